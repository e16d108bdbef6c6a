// 主机与分组数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;
use zeroize::Zeroizing;

/// 认证方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Password,
    PrivateKey,
    Agent,
}

/// 保存的主机配置
///
/// 敏感字段（密码、私钥口令）不在此结构中，它们以密文存放在
/// 存储记录里，连接时通过 `Vault::host_credentials` 临时取出。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Host {
    /// 主机 ID（创建后不可变）
    pub id: Uuid,
    /// 显示名称
    pub name: String,
    /// 主机地址（域名或 IP）
    pub hostname: String,
    /// 端口
    pub port: u16,
    /// 用户名
    pub username: String,
    /// 认证方式
    pub auth_type: AuthType,
    /// 私钥文件路径（auth_type 为 PrivateKey 时使用）
    pub private_key_path: Option<PathBuf>,
    /// 所属分组（弱引用，分组删除时置空）
    pub group_id: Option<Uuid>,
    /// 标签
    pub tags: Vec<String>,
    /// 图标
    pub icon: Option<String>,
    /// 颜色
    pub color: Option<String>,
    /// 备注
    pub notes: Option<String>,
    /// 断开后是否自动重连
    pub auto_reconnect: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 最后连接时间
    pub last_connected: Option<DateTime<Utc>>,
}

/// 创建/更新主机的输入
///
/// 与 `Host` 的区别：携带明文密码与私钥口令，仅在写入凭据库
/// 前的瞬间存在，写入后即被加密。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostInput {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
    /// 密码（auth_type 为 Password 时使用）
    pub password: Option<String>,
    pub private_key_path: Option<PathBuf>,
    /// 私钥口令（如果私钥加密）
    pub passphrase: Option<String>,
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub auto_reconnect: bool,
}

impl HostInput {
    /// 构建最小输入（测试与 CLI 场景）
    pub fn new(name: impl Into<String>, hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            port: 22,
            username: username.into(),
            auth_type: AuthType::Password,
            password: None,
            private_key_path: None,
            passphrase: None,
            group_id: None,
            tags: vec![],
            icon: None,
            color: None,
            notes: None,
            auto_reconnect: false,
        }
    }
}

impl Host {
    /// 由输入构建新主机（分配 ID 与时间戳）
    pub fn from_input(input: &HostInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: input.name.clone(),
            hostname: input.hostname.clone(),
            port: input.port,
            username: input.username.clone(),
            auth_type: input.auth_type,
            private_key_path: input.private_key_path.clone(),
            group_id: input.group_id,
            tags: input.tags.clone(),
            icon: input.icon.clone(),
            color: input.color.clone(),
            notes: input.notes.clone(),
            auto_reconnect: input.auto_reconnect,
            created_at: now,
            updated_at: now,
            last_connected: None,
        }
    }

    /// 应用更新（保留 id/created_at/last_connected，刷新 updated_at）
    pub fn apply_input(&mut self, input: &HostInput) {
        self.name = input.name.clone();
        self.hostname = input.hostname.clone();
        self.port = input.port;
        self.username = input.username.clone();
        self.auth_type = input.auth_type;
        self.private_key_path = input.private_key_path.clone();
        self.group_id = input.group_id;
        self.tags = input.tags.clone();
        self.icon = input.icon.clone();
        self.color = input.color.clone();
        self.notes = input.notes.clone();
        self.auto_reconnect = input.auto_reconnect;
        self.updated_at = Utc::now();
    }
}

/// 主机的解密凭据（仅在建立连接时短暂存在）
pub struct HostCredentials {
    pub password: Option<Zeroizing<String>>,
    pub passphrase: Option<Zeroizing<String>>,
}

/// 主机分组
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostGroup {
    pub id: Uuid,
    pub name: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    /// 排序序号
    pub order: i32,
    pub created_at: DateTime<Utc>,
}

/// 创建/更新分组的输入
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostGroupInput {
    pub name: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    #[serde(default)]
    pub order: i32,
}

impl HostGroup {
    pub fn from_input(input: &HostGroupInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: input.name.clone(),
            icon: input.icon.clone(),
            color: input.color.clone(),
            order: input.order,
            created_at: Utc::now(),
        }
    }
}
