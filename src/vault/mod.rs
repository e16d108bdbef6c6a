// 加密凭据库
//
// 模块结构:
// - crypto: 加密原语 (ChaCha20-Poly1305 + Argon2id)
// - store: 存储实现 (单文件、逐记录加密、损坏记录隔离)
//
// 所有持久化集合（主机、分组、快捷命令、设置、凭据条目、已知主机）
// 存放在一个带版本号的加密文件中。

pub mod crypto;
pub mod store;

pub use crypto::{EncryptedData, VaultCrypto};
pub use store::Vault;

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// 凭据库错误类型
#[derive(Debug, Error)]
pub enum VaultError {
    /// 凭据库未解锁（缺少主密钥）
    #[error("Vault is locked")]
    Locked,

    /// 凭据库文件被其他实例占用
    #[error("Vault is in use by another instance (lock file: {0})")]
    Busy(PathBuf),

    /// 记录不存在
    #[error("Record not found: {0}")]
    NotFound(String),

    /// 解密失败（密钥错误或密文被篡改），绝不返回可疑明文
    #[error("Decryption failed")]
    DecryptionFailed,

    /// 加密失败
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// 单条记录损坏（已隔离，不影响其余记录）
    #[error("Corrupt record: {0}")]
    CorruptRecord(Uuid),

    /// 存储文件整体损坏或版本不受支持
    #[error("Corrupt store: {0}")]
    CorruptStore(String),

    /// 输入校验失败
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
