// 快捷命令数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 快捷命令
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snippet {
    pub id: Uuid,
    pub name: String,
    /// 命令内容
    pub content: String,
    pub language: Option<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 创建/更新快捷命令的输入
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnippetInput {
    pub name: String,
    pub content: String,
    pub language: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub description: Option<String>,
}

impl Snippet {
    pub fn from_input(input: &SnippetInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: input.name.clone(),
            content: input.content.clone(),
            language: input.language.clone(),
            tags: input.tags.clone(),
            description: input.description.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply_input(&mut self, input: &SnippetInput) {
        self.name = input.name.clone();
        self.content = input.content.clone();
        self.language = input.language.clone();
        self.tags = input.tags.clone();
        self.description = input.description.clone();
        self.updated_at = Utc::now();
    }
}
