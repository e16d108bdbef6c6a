// 连接池
// 按会话 ID 管理活跃的 SSH 连接，并暂存等待确认的主机密钥询问

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::SshClient;
use super::config::SshConfig;
use super::error::SshError;
use super::event::{ConnectionEvent, HostKeyAction};
use super::handler::HostKeyPolicy;
use super::session::SshSession;

/// SSH 连接池
pub struct ConnectionPool {
    /// 活跃连接
    sessions: RwLock<HashMap<Uuid, Arc<SshSession>>>,
    /// 等待主机密钥确认的连接
    pending_host_keys: Mutex<HashMap<Uuid, oneshot::Sender<HostKeyAction>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pending_host_keys: Mutex::new(HashMap::new()),
        }
    }

    /// 建立连接并纳入池中
    ///
    /// 连接期间 handler 可能发出主机密钥询问事件，调用方通过
    /// `confirm_host_key` 应答。无论成败，挂起的询问都会被清理。
    pub async fn connect(
        &self,
        session_id: Uuid,
        config: SshConfig,
        policy: HostKeyPolicy,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<SshSession>, SshError> {
        let (host_key_tx, host_key_rx) = oneshot::channel();
        self.pending_host_keys
            .lock()
            .unwrap()
            .insert(session_id, host_key_tx);

        let mut client = SshClient::new(config, policy, events, host_key_rx);
        let result = client.connect(session_id).await;

        self.pending_host_keys.lock().unwrap().remove(&session_id);

        let session = Arc::new(result?);
        self.sessions
            .write()
            .unwrap()
            .insert(session_id, session.clone());
        debug!("[Pool] Session {} added, {} active", session_id, self.len());
        Ok(session)
    }

    /// 获取活跃连接
    pub fn get(&self, session_id: Uuid) -> Result<Arc<SshSession>, SshError> {
        self.sessions
            .read()
            .unwrap()
            .get(&session_id)
            .cloned()
            .ok_or(SshError::NotConnected)
    }

    /// 应答挂起的主机密钥询问
    ///
    /// 返回 false 表示该会话没有等待中的询问。
    pub fn confirm_host_key(&self, session_id: Uuid, action: HostKeyAction) -> bool {
        let Some(tx) = self.pending_host_keys.lock().unwrap().remove(&session_id) else {
            warn!("[Pool] No pending host key prompt for session {}", session_id);
            return false;
        };
        tx.send(action).is_ok()
    }

    /// 断开并移除连接（幂等）
    pub async fn disconnect(&self, session_id: Uuid) {
        let session = self.sessions.write().unwrap().remove(&session_id);
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                debug!("[Pool] Error closing session {}: {}", session_id, e);
            }
            info!("[Pool] Session {} disconnected", session_id);
        }
    }

    /// 池中活跃连接数
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 关闭所有连接
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<SshSession>> =
            self.sessions.write().unwrap().drain().map(|(_, s)| s).collect();
        for session in sessions {
            let _ = session.close().await;
        }
        info!("[Pool] All sessions closed");
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_unknown_session() {
        let pool = ConnectionPool::new();
        assert!(matches!(
            pool.get(Uuid::new_v4()),
            Err(SshError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let pool = ConnectionPool::new();
        let id = Uuid::new_v4();
        pool.disconnect(id).await;
        pool.disconnect(id).await;
        assert!(pool.is_empty());
    }

    #[test]
    fn test_confirm_without_pending_prompt() {
        let pool = ConnectionPool::new();
        assert!(!pool.confirm_host_key(Uuid::new_v4(), HostKeyAction::AcceptOnce));
    }
}
