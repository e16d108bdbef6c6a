// SSH 客户端核心实现

use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::client::Handle;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::event::{ConnectionEvent, HostKeyAction};
use super::handler::{ClientHandler, HostKeyPolicy};
use super::session::SshSession;

/// SSH 客户端
/// 负责建立 SSH 连接并返回 SshSession
pub struct SshClient {
    /// 连接配置
    config: SshConfig,
    /// 主机密钥校验策略
    policy: HostKeyPolicy,
    /// 事件发送器
    events: mpsc::UnboundedSender<ConnectionEvent>,
    /// 主机密钥确认接收器
    host_key_rx: Option<oneshot::Receiver<HostKeyAction>>,
}

impl SshClient {
    pub fn new(
        config: SshConfig,
        policy: HostKeyPolicy,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        host_key_rx: oneshot::Receiver<HostKeyAction>,
    ) -> Self {
        Self {
            config,
            policy,
            events,
            host_key_rx: Some(host_key_rx),
        }
    }

    /// 执行连接（异步）
    /// 返回 SshSession 用于后续操作
    pub async fn connect(&mut self, session_id: Uuid) -> Result<SshSession, SshError> {
        debug!(
            "[SSH] Connecting {}@{}:{}",
            self.config.username, self.config.host, self.config.port
        );

        // 解析地址
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::Config(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::Config("No valid address found".to_string()))?;

        // TCP 连接
        let connect_timeout = Duration::from_secs(self.config.connect_timeout);
        let tcp_stream = timeout(connect_timeout, TcpStream::connect(socket_addr))
            .await
            .map_err(|_| SshError::Timeout(self.config.connect_timeout))?
            .map_err(SshError::Io)?;

        debug!("[SSH] TCP connection established to {}", socket_addr);

        // SSH 握手（含主机密钥校验）
        let russh_config = Arc::new(self.config.to_russh_config());

        let host_key_rx = self
            .host_key_rx
            .take()
            .ok_or_else(|| SshError::Config("connection already attempted".to_string()))?;

        let handler = ClientHandler::new(
            session_id,
            self.config.host.clone(),
            self.config.port,
            self.policy.clone(),
            self.events.clone(),
            host_key_rx,
        );

        let mut handle = timeout(
            connect_timeout,
            russh::client::connect_stream(russh_config, tcp_stream, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(self.config.connect_timeout))?
        .map_err(SshError::from)?;

        debug!("[SSH] Handshake completed");

        // 认证
        self.authenticate(&mut handle).await?;

        info!(
            "[SSH] Connected {}@{}:{} (session {})",
            self.config.username, self.config.host, self.config.port, session_id
        );

        let _ = self.events.send(ConnectionEvent::Connected { session_id });

        Ok(SshSession::new(session_id, Arc::new(handle)))
    }

    /// 执行认证
    async fn authenticate(&self, handle: &mut Handle<ClientHandler>) -> Result<(), SshError> {
        use russh::client::AuthResult;

        match &self.config.auth {
            AuthMethod::Password(password) => {
                debug!("[SSH] Using password authentication");

                let auth_result = handle
                    .authenticate_password(&self.config.username, password)
                    .await
                    .map_err(SshError::from)?;

                match auth_result {
                    AuthResult::Success => {}
                    AuthResult::Failure {
                        remaining_methods,
                        partial_success,
                    } => {
                        if partial_success {
                            return Err(SshError::Auth(
                                "Partial authentication - additional auth required".to_string(),
                            ));
                        }
                        return Err(SshError::Auth(format!(
                            "Password authentication failed. Server suggests: {:?}",
                            remaining_methods
                        )));
                    }
                }
            }
            AuthMethod::PublicKey {
                key_path,
                passphrase,
            } => {
                debug!("[SSH] Using public key authentication: {:?}", key_path);

                let key = self
                    .load_private_key(key_path, passphrase.as_deref())
                    .await?;

                let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(
                    Arc::new(key),
                    None, // 使用默认哈希算法
                );

                let auth_result = handle
                    .authenticate_publickey(&self.config.username, key_with_alg)
                    .await
                    .map_err(SshError::from)?;

                match auth_result {
                    AuthResult::Success => {}
                    AuthResult::Failure {
                        remaining_methods,
                        partial_success,
                    } => {
                        if partial_success {
                            return Err(SshError::Auth(
                                "Partial authentication - additional auth required".to_string(),
                            ));
                        }
                        return Err(SshError::Auth(format!(
                            "Public key authentication failed. Server suggests: {:?}",
                            remaining_methods
                        )));
                    }
                }
            }
            AuthMethod::Agent => {
                self.authenticate_agent(handle).await?;
            }
        }

        Ok(())
    }

    /// 通过 SSH agent 认证，逐个尝试 agent 中的身份
    #[cfg(unix)]
    async fn authenticate_agent(
        &self,
        handle: &mut Handle<ClientHandler>,
    ) -> Result<(), SshError> {
        use russh::keys::HashAlg;

        debug!("[SSH] Using SSH agent authentication");

        let agent_path = std::env::var("SSH_AUTH_SOCK")
            .map_err(|_| SshError::Agent("SSH_AUTH_SOCK is not set".to_string()))?;

        let stream = tokio::net::UnixStream::connect(&agent_path)
            .await
            .map_err(|e| SshError::Agent(format!("Failed to connect to SSH agent: {}", e)))?;

        let mut agent = russh::keys::agent::client::AgentClient::connect(stream);

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| SshError::Agent(format!("Failed to get identities: {}", e)))?;

        if identities.is_empty() {
            return Err(SshError::Agent(
                "No identities found in SSH agent".to_string(),
            ));
        }

        // RSA 密钥优先使用 SHA-512
        for identity in identities {
            let hash_alg = if identity.algorithm().is_rsa() {
                Some(HashAlg::Sha512)
            } else {
                None
            };

            match handle
                .authenticate_publickey_with(&self.config.username, identity, hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(()),
                Ok(_) => continue,
                Err(e) => {
                    debug!("[SSH] Agent key failed: {}", e);
                    continue;
                }
            }
        }

        Err(SshError::Auth(
            "No agent identity was accepted by the server".to_string(),
        ))
    }

    #[cfg(not(unix))]
    async fn authenticate_agent(
        &self,
        _handle: &mut Handle<ClientHandler>,
    ) -> Result<(), SshError> {
        Err(SshError::Agent(
            "SSH agent authentication is only supported on Unix".to_string(),
        ))
    }

    /// 加载私钥文件
    async fn load_private_key(
        &self,
        key_path: &Path,
        passphrase: Option<&str>,
    ) -> Result<russh::keys::PrivateKey, SshError> {
        let key_data = tokio::fs::read(key_path)
            .await
            .map_err(|e| SshError::Key(format!("Failed to read key file: {}", e)))?;

        let key = russh::keys::decode_secret_key(&String::from_utf8_lossy(&key_data), passphrase)
            .map_err(|e| SshError::Key(format!("Failed to decode key: {}", e)))?;

        Ok(key)
    }
}
