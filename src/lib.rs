// ShellVault - 多会话远程访问引擎
//
// SSH 终端会话 + SFTP 传输 + 加密凭据库，
// 统一由 Engine 提供命令面，异步结果经事件总线回传。

pub mod engine;
pub mod local;
pub mod models;
pub mod session;
pub mod sftp;
pub mod ssh;
pub mod terminal;
pub mod vault;

pub use engine::{Engine, EngineError, EngineEvent, TerminalEvent};
pub use models::{
    AuthType, FileEntry, Host, HostGroup, HostGroupInput, HostInput, KnownHost, NewVaultEntry,
    Settings, Snippet, SnippetInput, VaultEntry, VaultEntryKind, VaultEntryUpdate,
};
pub use session::{Session, SessionStatus};
pub use sftp::SftpError;
pub use ssh::{HostKeyAction, SshError};
pub use vault::{Vault, VaultError};

/// 初始化日志系统
/// 可以通过 RUST_LOG 环境变量控制日志级别，例如：RUST_LOG=debug
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();
}
