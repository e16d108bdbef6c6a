// SSH 客户端 Handler 实现
// 实现 russh::client::Handler trait，负责服务器主机密钥校验

use std::future::Future;

use russh::keys::PublicKey;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::event::{ConnectionEvent, HostKeyAction};

/// 主机密钥校验策略
#[derive(Clone, Debug)]
pub struct HostKeyPolicy {
    /// 已记录的指纹（来自 known hosts）
    pub known_fingerprint: Option<String>,
    /// 严格模式：指纹不一致时直接拒绝，不询问
    pub strict: bool,
    /// 是否允许向调用方询问（自动重连时禁用，只接受完全匹配）
    pub allow_prompt: bool,
}

/// SSH 客户端 Handler
pub struct ClientHandler {
    session_id: Uuid,
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    /// 主机密钥确认通道，只消费一次
    response_rx: Option<oneshot::Receiver<HostKeyAction>>,
}

impl ClientHandler {
    pub fn new(
        session_id: Uuid,
        host: String,
        port: u16,
        policy: HostKeyPolicy,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        response_rx: oneshot::Receiver<HostKeyAction>,
    ) -> Self {
        Self {
            session_id,
            host,
            port,
            policy,
            events,
            response_rx: Some(response_rx),
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    /// 检查服务器公钥
    ///
    /// - 指纹与记录一致: 直接接受
    /// - 指纹不一致: 严格模式或重连时拒绝，否则发出 HostKeyMismatch 并等待确认
    /// - 未知主机: 发出 HostKeyVerification 并等待确认（重连时拒绝）
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let fingerprint = server_public_key
            .fingerprint(russh::keys::ssh_key::HashAlg::Sha256)
            .to_string();
        let key_type = server_public_key.algorithm().to_string();

        let session_id = self.session_id;
        let host = self.host.clone();
        let port = self.port;
        let policy = self.policy.clone();
        let events = self.events.clone();
        let response_rx = self.response_rx.take();

        async move {
            match &policy.known_fingerprint {
                Some(expected) if *expected == fingerprint => {
                    debug!("[SSH] Host key for {}:{} matches known fingerprint", host, port);
                    return Ok(true);
                }
                Some(expected) => {
                    warn!(
                        "[SSH] Host key mismatch for {}:{} (expected {}, got {})",
                        host, port, expected, fingerprint
                    );
                    let _ = events.send(ConnectionEvent::HostKeyMismatch {
                        session_id,
                        host: host.clone(),
                        port,
                        key_type: key_type.clone(),
                        expected: expected.clone(),
                        actual: fingerprint.clone(),
                    });
                    if policy.strict || !policy.allow_prompt {
                        return Ok(false);
                    }
                }
                None => {
                    debug!("[SSH] Unknown host {}:{}, fingerprint {}", host, port, fingerprint);
                    if !policy.allow_prompt {
                        return Ok(false);
                    }
                    let _ = events.send(ConnectionEvent::HostKeyVerification {
                        session_id,
                        host: host.clone(),
                        port,
                        key_type: key_type.clone(),
                        fingerprint: fingerprint.clone(),
                    });
                }
            }

            // 等待调用方确认
            let Some(rx) = response_rx else {
                return Ok(false);
            };
            match rx.await {
                Ok(HostKeyAction::AcceptOnce) => {
                    let _ = events.send(ConnectionEvent::HostKeyAccepted {
                        session_id,
                        host,
                        port,
                        key_type,
                        fingerprint,
                        save: false,
                    });
                    Ok(true)
                }
                Ok(HostKeyAction::AcceptAndSave) => {
                    let _ = events.send(ConnectionEvent::HostKeyAccepted {
                        session_id,
                        host,
                        port,
                        key_type,
                        fingerprint,
                        save: true,
                    });
                    Ok(true)
                }
                Ok(HostKeyAction::Reject) | Err(_) => Ok(false),
            }
        }
    }
}
