// 终端管理器
//
// 负责会话的完整生命周期:
// 建立连接 -> 打开 PTY 通道 -> 输出读取循环 + 延迟探测 ->
// 意外断开时按主机配置自动重连 -> 显式关闭。

pub mod reconnect;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{EngineError, EngineEvent, TerminalEvent};
use crate::models::{AuthType, Host, HostCredentials, Settings};
use crate::session::{SessionRegistry, SessionStatus};
use crate::ssh::{
    AuthMethod, ConnectionEvent, ConnectionPool, HostKeyPolicy, KeepaliveConfig, PtyRequest,
    SshConfig, SshSession, TerminalChannel,
};
use crate::vault::Vault;

struct TerminalHandle {
    channel: Arc<TerminalChannel>,
    cancel: CancellationToken,
}

/// 终端管理器
pub struct TerminalManager {
    pool: Arc<ConnectionPool>,
    registry: Arc<SessionRegistry>,
    vault: Arc<Vault>,
    events: mpsc::UnboundedSender<EngineEvent>,
    /// 活跃的终端通道
    channels: RwLock<HashMap<Uuid, TerminalHandle>>,
}

impl TerminalManager {
    pub fn new(
        pool: Arc<ConnectionPool>,
        registry: Arc<SessionRegistry>,
        vault: Arc<Vault>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            pool,
            registry,
            vault,
            events,
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn vault(&self) -> &Vault {
        &self.vault
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(crate) fn events(&self) -> &mpsc::UnboundedSender<EngineEvent> {
        &self.events
    }

    /// 建立连接并打开终端
    pub async fn connect(
        self: &Arc<Self>,
        session_id: Uuid,
        cols: u32,
        rows: u32,
    ) -> Result<(), EngineError> {
        if self.registry.get(session_id).is_none() {
            return Err(EngineError::SessionNotFound(session_id));
        }
        if !self
            .registry
            .set_status(session_id, SessionStatus::Connecting)
        {
            return Err(EngineError::InvalidCommand(
                "session is not in a connectable state".to_string(),
            ));
        }

        match self.establish(session_id, cols, rows, true).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.registry.set_status(session_id, SessionStatus::Error);
                let _ = self.events.send(EngineEvent::Error {
                    session_id: Some(session_id),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// 建立 SSH 连接、打开 PTY 并启动后台循环
    ///
    /// allow_prompt 为 false 时（自动重连）不发出主机密钥询问，
    /// 只接受与记录完全一致的指纹。
    ///
    /// 返回装箱 future：读取循环经重连任务再次进入 establish，
    /// 装箱切断递归的 future 类型。
    pub(crate) fn establish<'a>(
        self: &'a Arc<Self>,
        session_id: Uuid,
        cols: u32,
        rows: u32,
        allow_prompt: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'a>> {
        Box::pin(async move {
            let session = self
                .registry
                .get(session_id)
                .ok_or(EngineError::SessionNotFound(session_id))?;
            let host = self.vault.get_host(session.host_id).await?;
            let credentials = self.vault.host_credentials(host.id).await?;
            let settings = self.vault.settings().await?;

            let config = build_ssh_config(&host, credentials, &settings)?;
            let known_fingerprint = self
                .vault
                .known_host_for(&host.hostname, host.port)
                .await?
                .map(|k| k.fingerprint);
            let policy = HostKeyPolicy {
                known_fingerprint,
                strict: settings.strict_host_key_checking,
                allow_prompt,
            };

            let (conn_tx, conn_rx) = mpsc::unbounded_channel();
            self.spawn_connection_forwarder(conn_rx);

            let ssh = self
                .pool
                .connect(session_id, config, policy, conn_tx)
                .await?;

            let pty = PtyRequest {
                col_width: cols,
                row_height: rows,
                ..Default::default()
            };
            let channel = Arc::new(ssh.open_terminal(pty).await?);

            let cancel = CancellationToken::new();
            self.channels.write().await.insert(
                session_id,
                TerminalHandle {
                    channel: channel.clone(),
                    cancel: cancel.clone(),
                },
            );

            self.registry
                .set_status(session_id, SessionStatus::Connected);
            let _ = self.events.send(EngineEvent::Terminal {
                session_id,
                event: TerminalEvent::Connected,
            });
            let _ = self.events.send(EngineEvent::HostConnected {
                session_id,
                host_id: host.id,
            });
            if let Err(e) = self.vault.touch_host_connected(host.id).await {
                warn!("[Terminal] Failed to record last connected time: {}", e);
            }

            // 输出读取循环
            tokio::spawn(read_loop(
                self.clone(),
                session_id,
                host.id,
                host.auto_reconnect,
                channel,
                cancel.clone(),
                cols,
                rows,
            ));

            // 延迟探测
            if settings.show_latency {
                tokio::spawn(latency_loop(
                    self.clone(),
                    session_id,
                    ssh,
                    cancel,
                    settings.latency_interval_secs,
                ));
            }

            info!("[Terminal] Session {} connected to {}", session_id, host.hostname);
            Ok(())
        })
    }

    /// 写入终端输入
    ///
    /// 会话未连接时记录日志并忽略，不报错。
    pub async fn write(&self, session_id: Uuid, data: &[u8]) -> Result<(), EngineError> {
        let channels = self.channels.read().await;
        match channels.get(&session_id) {
            Some(handle) => {
                handle.channel.write(data).await?;
                Ok(())
            }
            None => {
                debug!("[Terminal] Write to disconnected session {} ignored", session_id);
                Ok(())
            }
        }
    }

    /// 调整终端大小
    pub async fn resize(&self, session_id: Uuid, cols: u32, rows: u32) -> Result<(), EngineError> {
        let channels = self.channels.read().await;
        match channels.get(&session_id) {
            Some(handle) => {
                handle.channel.resize(cols, rows).await?;
                Ok(())
            }
            None => {
                debug!("[Terminal] Resize on disconnected session {} ignored", session_id);
                Ok(())
            }
        }
    }

    /// 显式关闭会话（幂等）
    pub async fn close(&self, session_id: Uuid) {
        let handle = self.channels.write().await.remove(&session_id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.channel.close().await;
            let _ = self.events.send(EngineEvent::Terminal {
                session_id,
                event: TerminalEvent::Disconnected,
            });
            if let Some(session) = self.registry.get(session_id) {
                let _ = self.events.send(EngineEvent::HostDisconnected {
                    session_id,
                    host_id: session.host_id,
                });
            }
        }
        self.pool.disconnect(session_id).await;
        self.registry
            .set_status(session_id, SessionStatus::Disconnected);
    }

    /// 关闭所有会话
    pub async fn close_all(&self) {
        let ids: Vec<Uuid> = self.channels.read().await.keys().copied().collect();
        for id in ids {
            self.close(id).await;
        }
        self.pool.shutdown().await;
    }

    /// 转发连接过程事件到引擎事件总线
    ///
    /// HostKeyAccepted(save) 在这里持久化指纹。
    fn spawn_connection_forwarder(
        self: &Arc<Self>,
        mut conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let events = self.events.clone();
        let vault = self.vault.clone();
        tokio::spawn(async move {
            while let Some(event) = conn_rx.recv().await {
                match event {
                    ConnectionEvent::HostKeyVerification {
                        session_id,
                        host,
                        port,
                        key_type,
                        fingerprint,
                    } => {
                        let _ = events.send(EngineEvent::HostKeyVerification {
                            session_id,
                            host,
                            port,
                            key_type,
                            fingerprint,
                        });
                    }
                    ConnectionEvent::HostKeyMismatch {
                        session_id,
                        host,
                        port,
                        key_type,
                        expected,
                        actual,
                    } => {
                        let _ = events.send(EngineEvent::HostKeyMismatch {
                            session_id,
                            host,
                            port,
                            key_type,
                            expected,
                            actual,
                        });
                    }
                    ConnectionEvent::HostKeyAccepted {
                        host,
                        port,
                        key_type,
                        fingerprint,
                        save,
                        ..
                    } => {
                        if save {
                            if let Err(e) = vault
                                .remember_host_key(&host, port, key_type, fingerprint)
                                .await
                            {
                                warn!("[Terminal] Failed to persist host key: {}", e);
                            }
                        }
                    }
                    ConnectionEvent::Connected { session_id } => {
                        debug!("[Terminal] Connection established for {}", session_id);
                    }
                }
            }
        });
    }

    /// 意外断开处理：清理通道，视主机配置决定重连或置为断开
    async fn handle_unexpected_disconnect(
        self: &Arc<Self>,
        session_id: Uuid,
        host_id: Uuid,
        auto_reconnect: bool,
        cols: u32,
        rows: u32,
    ) {
        if let Some(handle) = self.channels.write().await.remove(&session_id) {
            handle.cancel.cancel();
        }
        self.pool.disconnect(session_id).await;

        let _ = self.events.send(EngineEvent::Terminal {
            session_id,
            event: TerminalEvent::Disconnected,
        });
        let _ = self.events.send(EngineEvent::HostDisconnected {
            session_id,
            host_id,
        });

        let attempts = self
            .vault
            .settings()
            .await
            .map(|s| s.reconnect_attempts)
            .unwrap_or(0);
        if auto_reconnect && attempts > 0 {
            info!("[Terminal] Session {} dropped, starting reconnect", session_id);
            tokio::spawn(reconnect::run(self.clone(), session_id, cols, rows));
        } else {
            self.registry
                .set_status(session_id, SessionStatus::Disconnected);
        }
    }
}

/// 终端输出读取循环
#[allow(clippy::too_many_arguments)]
async fn read_loop(
    manager: Arc<TerminalManager>,
    session_id: Uuid,
    host_id: Uuid,
    auto_reconnect: bool,
    channel: Arc<TerminalChannel>,
    cancel: CancellationToken,
    cols: u32,
    rows: u32,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = channel.read() => match result {
                Ok(Some(data)) => {
                    if !data.is_empty() {
                        let _ = manager.events.send(EngineEvent::Terminal {
                            session_id,
                            event: TerminalEvent::Data { data },
                        });
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("[Terminal] Read error on session {}: {}", session_id, e);
                    let _ = manager.events.send(EngineEvent::Terminal {
                        session_id,
                        event: TerminalEvent::Error { message: e.to_string() },
                    });
                    break;
                }
            },
        }
    }

    // 显式关闭走 cancelled 分支，这里只处理意外断开
    if cancel.is_cancelled() {
        return;
    }
    manager
        .handle_unexpected_disconnect(session_id, host_id, auto_reconnect, cols, rows)
        .await;
}

/// 延迟探测循环
async fn latency_loop(
    manager: Arc<TerminalManager>,
    session_id: Uuid,
    ssh: Arc<SshSession>,
    cancel: CancellationToken,
    interval_secs: u32,
) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(interval_secs.max(1) as u64));
    // 第一次 tick 立即返回，跳过
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                match ssh.probe_latency().await {
                    Ok(latency_ms) => {
                        manager.registry.set_latency(session_id, latency_ms);
                        let _ = manager.events.send(EngineEvent::Terminal {
                            session_id,
                            event: TerminalEvent::Latency { latency_ms },
                        });
                    }
                    Err(e) => {
                        debug!("[Terminal] Latency probe stopped for {}: {}", session_id, e);
                        return;
                    }
                }
            }
        }
    }
}

/// 由主机配置与凭据构建连接配置
fn build_ssh_config(
    host: &Host,
    credentials: HostCredentials,
    settings: &Settings,
) -> Result<SshConfig, EngineError> {
    let auth = match host.auth_type {
        AuthType::Password => {
            let password = credentials.password.ok_or_else(|| {
                EngineError::InvalidCommand("host has no stored password".to_string())
            })?;
            AuthMethod::Password(password.as_str().to_string())
        }
        AuthType::PrivateKey => {
            let key_path = host.private_key_path.clone().ok_or_else(|| {
                EngineError::InvalidCommand("host has no private key path".to_string())
            })?;
            AuthMethod::PublicKey {
                key_path,
                passphrase: credentials.passphrase.map(|p| p.as_str().to_string()),
            }
        }
        AuthType::Agent => AuthMethod::Agent,
    };

    Ok(SshConfig {
        host: host.hostname.clone(),
        port: host.port,
        username: host.username.clone(),
        auth,
        connect_timeout: settings.connection_timeout_secs as u64,
        keepalive: KeepaliveConfig {
            enabled: settings.keepalive_interval_secs > 0,
            interval: settings.keepalive_interval_secs.max(1) as u64,
            max_retries: 3,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostInput;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir) -> (Arc<TerminalManager>, Arc<SessionRegistry>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let vault = Arc::new(Vault::open(dir.path(), "test master").await.unwrap());
        let registry = Arc::new(SessionRegistry::new(tx.clone()));
        let pool = Arc::new(ConnectionPool::new());
        let manager = Arc::new(TerminalManager::new(pool, registry.clone(), vault, tx));
        (manager, registry)
    }

    #[tokio::test]
    async fn test_connect_unknown_session() {
        let dir = TempDir::new().unwrap();
        let (manager, _registry) = manager(&dir).await;
        assert!(matches!(
            manager.connect(Uuid::new_v4(), 80, 24).await,
            Err(EngineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_write_to_disconnected_session_is_noop() {
        let dir = TempDir::new().unwrap();
        let (manager, registry) = manager(&dir).await;
        let session = registry.create(Uuid::new_v4());
        assert!(manager.write(session.id, b"ls\n").await.is_ok());
        assert!(manager.resize(session.id, 120, 40).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (manager, registry) = manager(&dir).await;
        let session = registry.create(Uuid::new_v4());
        manager.close(session.id).await;
        manager.close(session.id).await;
        assert_eq!(
            registry.get(session.id).unwrap().status,
            SessionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_reconnect_task_is_spawnable_and_reports_exhaustion() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let vault = Arc::new(Vault::open(dir.path(), "test master").await.unwrap());
        let mut settings = vault.settings().await.unwrap();
        settings.reconnect_attempts = 0;
        vault.update_settings(settings).await.unwrap();
        let registry = Arc::new(SessionRegistry::new(tx.clone()));
        let pool = Arc::new(ConnectionPool::new());
        let manager = Arc::new(TerminalManager::new(pool, registry.clone(), vault, tx));
        let session = registry.create(Uuid::new_v4());

        // 重连任务进入 establish，establish 的读取循环又会派生重连任务，
        // 通过 spawn 验证该循环的 future 仍然是 Send
        tokio::spawn(reconnect::run(manager, session.id, 80, 24))
            .await
            .unwrap();

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Error { session_id, .. } = event {
                assert_eq!(session_id, Some(session.id));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn test_build_ssh_config_requires_password() {
        let host = Host::from_input(&HostInput::new("web", "10.0.0.5", "admin"));
        let creds = HostCredentials {
            password: None,
            passphrase: None,
        };
        let settings = Settings::default();
        assert!(matches!(
            build_ssh_config(&host, creds, &settings),
            Err(EngineError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_build_ssh_config_keepalive_disabled() {
        let mut input = HostInput::new("web", "10.0.0.5", "admin");
        input.password = Some("pw".to_string());
        let host = Host::from_input(&input);
        let creds = HostCredentials {
            password: Some(zeroize::Zeroizing::new("pw".to_string())),
            passphrase: None,
        };
        let mut settings = Settings::default();
        settings.keepalive_interval_secs = 0;
        let config = build_ssh_config(&host, creds, &settings).unwrap();
        assert!(!config.keepalive.enabled);
        assert_eq!(config.port, 22);
    }
}
