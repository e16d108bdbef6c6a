// SSH 连接模块
//
// 模块结构:
// - config: 连接配置与认证方式
// - error: 错误类型
// - event: 连接过程事件与主机密钥确认
// - handler: russh Handler 实现（主机密钥校验）
// - client: 连接建立与认证流程
// - session: 会话与终端通道
// - pool: 活跃连接池

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod pool;
pub mod session;

pub use client::SshClient;
pub use config::{AuthMethod, KeepaliveConfig, SshConfig};
pub use error::SshError;
pub use event::{ConnectionEvent, HostKeyAction};
pub use handler::HostKeyPolicy;
pub use pool::ConnectionPool;
pub use session::{PtyRequest, SshSession, TerminalChannel};
