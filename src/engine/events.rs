// 引擎事件总线
//
// 所有异步发生的事情（终端输出、状态变化、传输进度、主机密钥询问）
// 都通过单一事件流发布，订阅方按 session_id 分发。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionStatus;

/// 终端子事件
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalEvent {
    /// 终端输出数据
    Data { data: Vec<u8> },
    /// 终端通道已建立
    Connected,
    /// 终端通道关闭
    Disconnected,
    /// 终端错误
    Error { message: String },
    /// 延迟测量结果（毫秒）
    Latency { latency_ms: u32 },
}

/// 引擎事件
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// 会话状态变化
    Status {
        session_id: Uuid,
        status: SessionStatus,
    },
    /// 终端事件
    Terminal {
        session_id: Uuid,
        event: TerminalEvent,
    },
    /// 主机连接成功
    HostConnected { session_id: Uuid, host_id: Uuid },
    /// 主机连接断开
    HostDisconnected { session_id: Uuid, host_id: Uuid },
    /// 未知主机密钥，等待 confirm_host_key 应答
    HostKeyVerification {
        session_id: Uuid,
        host: String,
        port: u16,
        key_type: String,
        fingerprint: String,
    },
    /// 主机密钥与记录不一致
    HostKeyMismatch {
        session_id: Uuid,
        host: String,
        port: u16,
        key_type: String,
        expected: String,
        actual: String,
    },
    /// 传输进度（进度单调递增）
    TransferProgress {
        session_id: Uuid,
        transfer_id: Uuid,
        bytes_transferred: u64,
        total_bytes: u64,
        progress: f32,
    },
    /// 传输完成
    TransferComplete { session_id: Uuid, transfer_id: Uuid },
    /// 传输被取消
    TransferCancelled { session_id: Uuid, transfer_id: Uuid },
    /// 传输失败
    TransferFailed {
        session_id: Uuid,
        transfer_id: Uuid,
        error: String,
    },
    /// 会话级或全局错误
    Error {
        session_id: Option<Uuid>,
        message: String,
    },
}
