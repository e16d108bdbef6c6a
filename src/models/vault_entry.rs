// 凭据条目数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 凭据条目类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultEntryKind {
    Password,
    SshKey,
    ApiKey,
    SecureNote,
    Certificate,
}

/// 凭据条目（不含秘密载荷）
///
/// 秘密载荷以密文单独存放，列表与查询永远不会返回明文，
/// 只有 `Vault::get_secret` 才会临时解密。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VaultEntry {
    /// 条目 ID（全局唯一，编辑后保持不变）
    pub id: Uuid,
    pub name: String,
    pub kind: VaultEntryKind,
    pub username: Option<String>,
    pub url: Option<String>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    /// 所属文件夹
    pub folder: Option<String>,
    pub favorite: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 最后使用时间（get_secret 时刷新）
    pub last_used: Option<DateTime<Utc>>,
}

/// 新建凭据条目的输入（秘密为必填）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewVaultEntry {
    pub name: String,
    pub kind: VaultEntryKind,
    pub username: Option<String>,
    /// 秘密载荷明文，写入前即被加密
    pub secret: String,
    pub url: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub folder: Option<String>,
}

/// 更新凭据条目的输入（secret 为 None 表示保留原值）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaultEntryUpdate {
    pub name: String,
    pub kind: VaultEntryKind,
    pub username: Option<String>,
    pub secret: Option<String>,
    pub url: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub folder: Option<String>,
    pub favorite: bool,
}

impl VaultEntry {
    pub fn from_input(input: &NewVaultEntry) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: input.name.clone(),
            kind: input.kind,
            username: input.username.clone(),
            url: input.url.clone(),
            notes: input.notes.clone(),
            tags: input.tags.clone(),
            folder: input.folder.clone(),
            favorite: false,
            created_at: now,
            updated_at: now,
            last_used: None,
        }
    }

    pub fn apply_update(&mut self, update: &VaultEntryUpdate) {
        self.name = update.name.clone();
        self.kind = update.kind;
        self.username = update.username.clone();
        self.url = update.url.clone();
        self.notes = update.notes.clone();
        self.tags = update.tags.clone();
        self.folder = update.folder.clone();
        self.favorite = update.favorite;
        self.updated_at = Utc::now();
    }
}
