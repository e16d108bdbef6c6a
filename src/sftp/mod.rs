// SFTP 模块
//
// 模块结构:
// - service: 目录与文件元数据操作（封装 russh-sftp）
// - transfer: 分块上传/下载循环（取消与空闲超时）
// - manager: 会话级 SFTP 服务缓存与传输任务调度

pub mod manager;
pub mod service;
pub mod transfer;

pub use manager::SftpManager;
pub use service::SftpService;

use thiserror::Error;

use crate::ssh::SshError;

/// SFTP 错误类型
#[derive(Debug, Error)]
pub enum SftpError {
    /// 底层 SSH 错误
    #[error(transparent)]
    Ssh(#[from] SshError),

    /// 路径不存在
    #[error("Path not found: {0}")]
    NotFound(String),

    /// 权限不足
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// 目标已存在
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// SFTP 协议错误
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// 传输失败
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// 本地 IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 传输被取消
    #[error("Transfer cancelled")]
    Cancelled,

    /// 传输空闲超时（{0} 秒无进度）
    #[error("Transfer idle timeout after {0}s")]
    IdleTimeout(u64),

    /// 传输不存在
    #[error("Transfer not found")]
    TransferNotFound,
}

/// 将 russh-sftp 错误映射为带路径上下文的 SftpError
pub(crate) fn map_sftp_error(path: &str, e: russh_sftp::client::error::Error) -> SftpError {
    use russh_sftp::client::error::Error;
    use russh_sftp::protocol::StatusCode;

    if let Error::Status(status) = &e {
        match status.status_code {
            StatusCode::NoSuchFile => return SftpError::NotFound(path.to_string()),
            StatusCode::PermissionDenied => {
                return SftpError::PermissionDenied(path.to_string())
            }
            _ => {}
        }
    }
    SftpError::Protocol(format!("{}: {}", path, e))
}
