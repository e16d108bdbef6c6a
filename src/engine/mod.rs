// 引擎入口
//
// 对外的命令面：打开引擎得到 (Engine, 事件接收器)，所有操作
// 都是 Engine 上的方法，所有异步结果经事件总线回传。

pub mod error;
pub mod events;

pub use error::EngineError;
pub use events::{EngineEvent, TerminalEvent};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::local;
use crate::models::{
    FileEntry, Host, HostGroup, HostGroupInput, HostInput, KnownHost, NewVaultEntry, Settings,
    Snippet, SnippetInput, VaultEntry, VaultEntryUpdate,
};
use crate::session::{Session, SessionRegistry};
use crate::sftp::SftpManager;
use crate::ssh::{ConnectionPool, HostKeyAction};
use crate::terminal::TerminalManager;
use crate::vault::{Vault, VaultError};

/// 远程访问引擎
pub struct Engine {
    vault: Arc<Vault>,
    registry: Arc<SessionRegistry>,
    pool: Arc<ConnectionPool>,
    terminals: Arc<TerminalManager>,
    sftp: Arc<SftpManager>,
}

impl Engine {
    /// 打开引擎：解锁凭据库并构建事件总线
    ///
    /// 需要在 tokio 运行时内调用。
    pub async fn open(
        data_dir: impl AsRef<Path>,
        master_password: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EngineEvent>), EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let vault = Arc::new(Vault::open(data_dir, master_password).await?);
        let registry = Arc::new(SessionRegistry::new(tx.clone()));
        let pool = Arc::new(ConnectionPool::new());
        let terminals = Arc::new(TerminalManager::new(
            pool.clone(),
            registry.clone(),
            vault.clone(),
            tx.clone(),
        ));
        let sftp = Arc::new(SftpManager::new(pool.clone(), tx));

        info!("[Engine] Engine ready");
        Ok((
            Self {
                vault,
                registry,
                pool,
                terminals,
                sftp,
            },
            rx,
        ))
    }

    /// 默认数据目录
    pub fn default_data_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shellvault")
    }

    /// 关闭引擎：断开所有连接并锁定凭据库
    pub async fn shutdown(&self) {
        self.terminals.close_all().await;
        self.vault.lock().await;
        info!("[Engine] Shut down");
    }

    // ---- 会话 ----

    /// 为主机创建新会话（初始状态 disconnected）
    pub async fn create_session(&self, host_id: Uuid) -> Result<Session, EngineError> {
        self.vault.get_host(host_id).await.map_err(|e| match e {
            VaultError::NotFound(_) => EngineError::HostNotFound(host_id),
            other => other.into(),
        })?;
        Ok(self.registry.create(host_id))
    }

    /// 建立连接并打开终端
    pub async fn connect_terminal(
        &self,
        session_id: Uuid,
        cols: u32,
        rows: u32,
    ) -> Result<(), EngineError> {
        self.terminals.connect(session_id, cols, rows).await
    }

    /// 创建会话并立即连接
    pub async fn connect_host(
        &self,
        host_id: Uuid,
        cols: u32,
        rows: u32,
    ) -> Result<Session, EngineError> {
        let session = self.create_session(host_id).await?;
        self.connect_terminal(session.id, cols, rows).await?;
        // 连接后状态已变化，取最新快照
        Ok(self
            .registry
            .get(session.id)
            .ok_or(EngineError::SessionNotFound(session.id))?)
    }

    /// 写入终端输入
    pub async fn write_terminal(&self, session_id: Uuid, data: &[u8]) -> Result<(), EngineError> {
        self.terminals.write(session_id, data).await
    }

    /// 调整终端大小
    pub async fn resize_terminal(
        &self,
        session_id: Uuid,
        cols: u32,
        rows: u32,
    ) -> Result<(), EngineError> {
        self.terminals.resize(session_id, cols, rows).await
    }

    /// 关闭会话（幂等）：取消传输、关闭终端、销毁会话对象
    pub async fn close_session(&self, session_id: Uuid) {
        self.sftp.cancel_session(session_id).await;
        self.terminals.close(session_id).await;
        self.registry.remove(session_id);
    }

    pub fn get_session(&self, session_id: Uuid) -> Option<Session> {
        self.registry.get(session_id)
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.registry.list()
    }

    /// 应答主机密钥询问
    pub fn confirm_host_key(&self, session_id: Uuid, action: HostKeyAction) -> bool {
        self.pool.confirm_host_key(session_id, action)
    }

    // ---- 主机 ----

    pub async fn add_host(&self, input: HostInput) -> Result<Host, EngineError> {
        Ok(self.vault.add_host(input).await?)
    }

    pub async fn update_host(&self, id: Uuid, input: HostInput) -> Result<Host, EngineError> {
        Ok(self.vault.update_host(id, input).await?)
    }

    pub async fn delete_host(&self, id: Uuid) -> Result<(), EngineError> {
        Ok(self.vault.delete_host(id).await?)
    }

    pub async fn list_hosts(&self) -> Result<Vec<Host>, EngineError> {
        Ok(self.vault.list_hosts().await?)
    }

    pub async fn get_host(&self, id: Uuid) -> Result<Host, EngineError> {
        Ok(self.vault.get_host(id).await?)
    }

    // ---- 分组 ----

    pub async fn add_group(&self, input: HostGroupInput) -> Result<HostGroup, EngineError> {
        Ok(self.vault.add_group(input).await?)
    }

    pub async fn update_group(
        &self,
        id: Uuid,
        input: HostGroupInput,
    ) -> Result<HostGroup, EngineError> {
        Ok(self.vault.update_group(id, input).await?)
    }

    pub async fn delete_group(&self, id: Uuid) -> Result<(), EngineError> {
        Ok(self.vault.delete_group(id).await?)
    }

    pub async fn list_groups(&self) -> Result<Vec<HostGroup>, EngineError> {
        Ok(self.vault.list_groups().await?)
    }

    // ---- 快捷命令 ----

    pub async fn add_snippet(&self, input: SnippetInput) -> Result<Snippet, EngineError> {
        Ok(self.vault.add_snippet(input).await?)
    }

    pub async fn update_snippet(
        &self,
        id: Uuid,
        input: SnippetInput,
    ) -> Result<Snippet, EngineError> {
        Ok(self.vault.update_snippet(id, input).await?)
    }

    pub async fn delete_snippet(&self, id: Uuid) -> Result<(), EngineError> {
        Ok(self.vault.delete_snippet(id).await?)
    }

    pub async fn list_snippets(&self) -> Result<Vec<Snippet>, EngineError> {
        Ok(self.vault.list_snippets().await?)
    }

    /// 向终端发送快捷命令内容
    pub async fn run_snippet(&self, session_id: Uuid, snippet_id: Uuid) -> Result<(), EngineError> {
        let snippets = self.vault.list_snippets().await?;
        let snippet = snippets
            .into_iter()
            .find(|s| s.id == snippet_id)
            .ok_or_else(|| EngineError::InvalidCommand(format!("snippet {}", snippet_id)))?;
        self.terminals
            .write(session_id, snippet.content.as_bytes())
            .await
    }

    // ---- 凭据条目 ----

    pub async fn add_entry(&self, input: NewVaultEntry) -> Result<VaultEntry, EngineError> {
        Ok(self.vault.add_entry(input).await?)
    }

    pub async fn update_entry(
        &self,
        id: Uuid,
        update: VaultEntryUpdate,
    ) -> Result<VaultEntry, EngineError> {
        Ok(self.vault.update_entry(id, update).await?)
    }

    pub async fn delete_entry(&self, id: Uuid) -> Result<(), EngineError> {
        Ok(self.vault.delete_entry(id).await?)
    }

    pub async fn list_entries(&self) -> Result<Vec<VaultEntry>, EngineError> {
        Ok(self.vault.list_entries().await?)
    }

    pub async fn get_entry(&self, id: Uuid) -> Result<VaultEntry, EngineError> {
        Ok(self.vault.get_entry(id).await?)
    }

    pub async fn search_entries(&self, query: &str) -> Result<Vec<VaultEntry>, EngineError> {
        Ok(self.vault.search_entries(query).await?)
    }

    pub async fn entry_folders(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.vault.entry_folders().await?)
    }

    /// 解密凭据条目的秘密载荷
    pub async fn get_secret(&self, id: Uuid) -> Result<Zeroizing<String>, EngineError> {
        Ok(self.vault.get_secret(id).await?)
    }

    // ---- 凭据库管理 ----

    pub async fn lock_vault(&self) {
        self.vault.lock().await;
    }

    pub async fn unlock_vault(&self, master_password: &str) -> Result<(), EngineError> {
        Ok(self.vault.unlock(master_password).await?)
    }

    pub async fn is_vault_unlocked(&self) -> bool {
        self.vault.is_unlocked().await
    }

    pub async fn change_master_password(
        &self,
        current: &str,
        new: &str,
    ) -> Result<(), EngineError> {
        Ok(self.vault.change_master_password(current, new).await?)
    }

    // ---- 已知主机 ----

    pub async fn list_known_hosts(&self) -> Result<Vec<KnownHost>, EngineError> {
        Ok(self.vault.list_known_hosts().await?)
    }

    pub async fn forget_host_key(&self, hostname: &str, port: u16) -> Result<(), EngineError> {
        Ok(self.vault.forget_host_key(hostname, port).await?)
    }

    // ---- 设置 ----

    pub async fn settings(&self) -> Result<Settings, EngineError> {
        Ok(self.vault.settings().await?)
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<(), EngineError> {
        Ok(self.vault.update_settings(settings).await?)
    }

    // ---- 远端文件 ----

    pub async fn sftp_home_dir(&self, session_id: Uuid) -> Result<String, EngineError> {
        Ok(self.sftp.home_dir(session_id).await?)
    }

    pub async fn sftp_read_dir(
        &self,
        session_id: Uuid,
        path: &str,
    ) -> Result<Vec<FileEntry>, EngineError> {
        Ok(self.sftp.read_dir(session_id, path).await?)
    }

    pub async fn sftp_mkdir(&self, session_id: Uuid, path: &str) -> Result<(), EngineError> {
        Ok(self.sftp.mkdir(session_id, path).await?)
    }

    pub async fn sftp_remove_file(
        &self,
        session_id: Uuid,
        path: &str,
    ) -> Result<(), EngineError> {
        Ok(self.sftp.remove_file(session_id, path).await?)
    }

    pub async fn sftp_remove_dir(
        &self,
        session_id: Uuid,
        path: &str,
        recursive: bool,
    ) -> Result<(), EngineError> {
        Ok(self.sftp.remove_dir(session_id, path, recursive).await?)
    }

    pub async fn sftp_rename(
        &self,
        session_id: Uuid,
        from: &str,
        to: &str,
    ) -> Result<(), EngineError> {
        Ok(self.sftp.rename(session_id, from, to).await?)
    }

    pub async fn sftp_stat(
        &self,
        session_id: Uuid,
        path: &str,
    ) -> Result<FileEntry, EngineError> {
        Ok(self.sftp.stat(session_id, path).await?)
    }

    /// 上传本地文件到远端，返回传输 ID，进度与结果经事件总线回传
    pub async fn upload(
        &self,
        session_id: Uuid,
        local_path: PathBuf,
        remote_path: String,
    ) -> Result<Uuid, EngineError> {
        let idle_timeout = self.transfer_idle_timeout().await?;
        Ok(self
            .sftp
            .upload(session_id, local_path, remote_path, idle_timeout)
            .await?)
    }

    /// 从远端下载文件到本地，返回传输 ID
    pub async fn download(
        &self,
        session_id: Uuid,
        remote_path: String,
        local_path: PathBuf,
    ) -> Result<Uuid, EngineError> {
        let idle_timeout = self.transfer_idle_timeout().await?;
        Ok(self
            .sftp
            .download(session_id, remote_path, local_path, idle_timeout)
            .await?)
    }

    /// 取消进行中的传输
    pub fn cancel_transfer(&self, transfer_id: Uuid) -> Result<(), EngineError> {
        Ok(self.sftp.cancel_transfer(transfer_id)?)
    }

    async fn transfer_idle_timeout(&self) -> Result<std::time::Duration, EngineError> {
        let settings = self.vault.settings().await?;
        Ok(std::time::Duration::from_secs(
            settings.transfer_idle_timeout_secs.max(1) as u64,
        ))
    }

    // ---- 本地文件 ----

    pub fn local_home_dir(&self) -> PathBuf {
        local::home_dir()
    }

    pub async fn local_list_dir(&self, path: &Path) -> Result<Vec<FileEntry>, EngineError> {
        Ok(local::list_dir(path).await?)
    }

    pub async fn local_create_dir(&self, path: &Path) -> Result<(), EngineError> {
        Ok(local::create_dir(path).await?)
    }

    pub async fn local_remove(&self, path: &Path, recursive: bool) -> Result<(), EngineError> {
        Ok(local::remove(path, recursive).await?)
    }

    pub async fn local_rename(&self, from: &Path, to: &Path) -> Result<(), EngineError> {
        Ok(local::rename(from, to).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostInput;
    use crate::session::SessionStatus;
    use tempfile::TempDir;

    async fn engine(dir: &TempDir) -> (Engine, mpsc::UnboundedReceiver<EngineEvent>) {
        Engine::open(dir.path(), "test master").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_session_requires_host() {
        let dir = TempDir::new().unwrap();
        let (engine, _rx) = engine(&dir).await;
        assert!(matches!(
            engine.create_session(Uuid::new_v4()).await,
            Err(EngineError::HostNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_lifecycle_without_network() {
        let dir = TempDir::new().unwrap();
        let (engine, mut rx) = engine(&dir).await;

        let mut input = HostInput::new("web-01", "10.0.0.5", "admin");
        input.password = Some("hunter2".to_string());
        let host = engine.add_host(input).await.unwrap();

        let session = engine.create_session(host.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Disconnected);
        assert_eq!(engine.list_sessions().len(), 1);

        // 未连接时终端输入是安全的空操作
        engine.write_terminal(session.id, b"ls\n").await.unwrap();

        // 关闭是幂等的
        engine.close_session(session.id).await;
        engine.close_session(session.id).await;
        assert!(engine.get_session(session.id).is_none());

        // 状态事件已广播
        let mut saw_disconnect = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::Status { .. }) {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn test_confirm_host_key_without_prompt() {
        let dir = TempDir::new().unwrap();
        let (engine, _rx) = engine(&dir).await;
        assert!(!engine.confirm_host_key(Uuid::new_v4(), HostKeyAction::AcceptOnce));
    }

    #[tokio::test]
    async fn test_vault_lock_cycle() {
        let dir = TempDir::new().unwrap();
        let (engine, _rx) = engine(&dir).await;
        assert!(engine.is_vault_unlocked().await);
        engine.lock_vault().await;
        assert!(!engine.is_vault_unlocked().await);
        assert!(engine.list_hosts().await.is_err());
        engine.unlock_vault("test master").await.unwrap();
        assert!(engine.list_hosts().await.unwrap().is_empty());
    }
}
