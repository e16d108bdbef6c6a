// SSH 连接过程事件

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 连接过程中产生的事件
///
/// 由客户端与 handler 发出，经连接池转发到引擎事件总线。
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// 连接建立完成
    Connected { session_id: Uuid },
    /// 首次连接到未知主机，等待确认
    HostKeyVerification {
        session_id: Uuid,
        host: String,
        port: u16,
        key_type: String,
        fingerprint: String,
    },
    /// 服务器密钥与记录不一致
    HostKeyMismatch {
        session_id: Uuid,
        host: String,
        port: u16,
        key_type: String,
        expected: String,
        actual: String,
    },
    /// 主机密钥被接受（save 为 true 时应持久化）
    HostKeyAccepted {
        session_id: Uuid,
        host: String,
        port: u16,
        key_type: String,
        fingerprint: String,
        save: bool,
    },
}

/// 主机密钥确认动作
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyAction {
    /// 仅本次接受
    AcceptOnce,
    /// 接受并记录指纹
    AcceptAndSave,
    /// 拒绝连接
    Reject,
}
