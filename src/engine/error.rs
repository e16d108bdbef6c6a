// 引擎错误类型

use thiserror::Error;
use uuid::Uuid;

use crate::sftp::SftpError;
use crate::ssh::SshError;
use crate::vault::VaultError;

/// 引擎命令层错误
#[derive(Debug, Error)]
pub enum EngineError {
    /// 凭据库错误
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// SSH 错误
    #[error(transparent)]
    Ssh(#[from] SshError),

    /// SFTP 错误
    #[error(transparent)]
    Sftp(#[from] SftpError),

    /// 会话不存在
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    /// 主机不存在
    #[error("Host not found: {0}")]
    HostNotFound(Uuid),

    /// 命令参数非法
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
