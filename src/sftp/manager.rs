// SFTP 管理器
//
// 每个会话缓存一个 SftpService 用于目录操作；每个传输任务
// 打开独立的 SFTP 通道，互不阻塞，也不影响目录浏览。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh_sftp::client::SftpSession;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::EngineEvent;
use crate::models::FileEntry;
use crate::ssh::{ConnectionPool, SshSession};

use super::service::SftpService;
use super::{transfer, SftpError};

/// 进度事件节流步长
const PROGRESS_STEP: u64 = 256 * 1024;

struct TransferHandle {
    session_id: Uuid,
    cancel: CancellationToken,
}

/// 缓存的目录操作服务，连同创建它的传输层一起保存，
/// 重连后传输层实例变化即视为失效。
struct CachedService {
    ssh: Arc<SshSession>,
    service: Arc<SftpService>,
}

/// SFTP 管理器
pub struct SftpManager {
    pool: Arc<ConnectionPool>,
    events: mpsc::UnboundedSender<EngineEvent>,
    /// 会话级 SFTP 服务缓存
    services: RwLock<HashMap<Uuid, CachedService>>,
    /// 进行中的传输
    transfers: Arc<Mutex<HashMap<Uuid, TransferHandle>>>,
}

impl SftpManager {
    pub fn new(pool: Arc<ConnectionPool>, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            pool,
            events,
            services: RwLock::new(HashMap::new()),
            transfers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 获取（或创建）会话的 SFTP 服务
    async fn service(&self, session_id: Uuid) -> Result<Arc<SftpService>, SftpError> {
        let ssh_session = self.pool.get(session_id)?;

        if let Some(cached) = self.services.read().await.get(&session_id) {
            if Arc::ptr_eq(&cached.ssh, &ssh_session) && ssh_session.is_alive() {
                return Ok(cached.service.clone());
            }
        }

        let service = Arc::new(SftpService::new(session_id, &ssh_session).await?);
        self.services.write().await.insert(
            session_id,
            CachedService {
                ssh: ssh_session,
                service: service.clone(),
            },
        );
        Ok(service)
    }

    /// 丢弃会话的缓存服务（连接断开后调用）
    pub async fn invalidate(&self, session_id: Uuid) {
        if self.services.write().await.remove(&session_id).is_some() {
            debug!("[SFTP] Service cache invalidated for session {}", session_id);
        }
    }

    // ---- 目录与元数据操作 ----

    pub async fn home_dir(&self, session_id: Uuid) -> Result<String, SftpError> {
        self.service(session_id).await?.home_dir().await
    }

    pub async fn read_dir(
        &self,
        session_id: Uuid,
        path: &str,
    ) -> Result<Vec<FileEntry>, SftpError> {
        self.service(session_id).await?.read_dir(path).await
    }

    pub async fn mkdir(&self, session_id: Uuid, path: &str) -> Result<(), SftpError> {
        self.service(session_id).await?.mkdir(path).await
    }

    pub async fn remove_file(&self, session_id: Uuid, path: &str) -> Result<(), SftpError> {
        self.service(session_id).await?.remove_file(path).await
    }

    /// 删除目录，recursive 为 false 时要求目录为空
    pub async fn remove_dir(
        &self,
        session_id: Uuid,
        path: &str,
        recursive: bool,
    ) -> Result<(), SftpError> {
        let service = self.service(session_id).await?;
        if recursive {
            service.remove_recursive(path).await
        } else {
            service.remove_dir(path).await
        }
    }

    pub async fn rename(
        &self,
        session_id: Uuid,
        from: &str,
        to: &str,
    ) -> Result<(), SftpError> {
        self.service(session_id).await?.rename(from, to).await
    }

    pub async fn stat(&self, session_id: Uuid, path: &str) -> Result<FileEntry, SftpError> {
        self.service(session_id).await?.stat(path).await
    }

    // ---- 传输 ----

    /// 上传本地文件到远端，立即返回传输 ID
    pub async fn upload(
        &self,
        session_id: Uuid,
        local_path: PathBuf,
        remote_path: String,
        idle_timeout: Duration,
    ) -> Result<Uuid, SftpError> {
        let sftp = self.open_transfer_session(session_id).await?;
        let transfer_id = Uuid::new_v4();
        let cancel = self.register(transfer_id, session_id);

        let events = self.events.clone();
        let transfers = self.transfers.clone();

        tokio::spawn(async move {
            let mut on_progress =
                progress_emitter(events.clone(), session_id, transfer_id);
            let result = transfer::upload(
                &sftp,
                &local_path,
                &remote_path,
                &cancel,
                idle_timeout,
                &mut on_progress,
            )
            .await;
            transfers.lock().unwrap().remove(&transfer_id);

            match result {
                Ok(_) => {
                    let _ = events.send(EngineEvent::TransferComplete {
                        session_id,
                        transfer_id,
                    });
                }
                Err(SftpError::Cancelled) => {
                    info!("[SFTP] Upload {} cancelled", transfer_id);
                    let _ = events.send(EngineEvent::TransferCancelled {
                        session_id,
                        transfer_id,
                    });
                }
                Err(e) => {
                    warn!("[SFTP] Upload {} failed: {}", transfer_id, e);
                    let _ = events.send(EngineEvent::TransferFailed {
                        session_id,
                        transfer_id,
                        error: e.to_string(),
                    });
                }
            }
        });

        Ok(transfer_id)
    }

    /// 从远端下载文件到本地，立即返回传输 ID
    pub async fn download(
        &self,
        session_id: Uuid,
        remote_path: String,
        local_path: PathBuf,
        idle_timeout: Duration,
    ) -> Result<Uuid, SftpError> {
        let sftp = self.open_transfer_session(session_id).await?;
        let transfer_id = Uuid::new_v4();
        let cancel = self.register(transfer_id, session_id);

        let events = self.events.clone();
        let transfers = self.transfers.clone();

        tokio::spawn(async move {
            let mut on_progress =
                progress_emitter(events.clone(), session_id, transfer_id);
            let result = transfer::download(
                &sftp,
                &remote_path,
                &local_path,
                &cancel,
                idle_timeout,
                &mut on_progress,
            )
            .await;
            transfers.lock().unwrap().remove(&transfer_id);

            match result {
                Ok(_) => {
                    let _ = events.send(EngineEvent::TransferComplete {
                        session_id,
                        transfer_id,
                    });
                }
                Err(SftpError::Cancelled) => {
                    info!("[SFTP] Download {} cancelled", transfer_id);
                    let _ = events.send(EngineEvent::TransferCancelled {
                        session_id,
                        transfer_id,
                    });
                }
                Err(e) => {
                    warn!("[SFTP] Download {} failed: {}", transfer_id, e);
                    let _ = events.send(EngineEvent::TransferFailed {
                        session_id,
                        transfer_id,
                        error: e.to_string(),
                    });
                }
            }
        });

        Ok(transfer_id)
    }

    /// 取消进行中的传输
    ///
    /// 实际停止发生在下一个分块边界，部分文件由传输任务清理。
    pub fn cancel_transfer(&self, transfer_id: Uuid) -> Result<(), SftpError> {
        let transfers = self.transfers.lock().unwrap();
        let handle = transfers
            .get(&transfer_id)
            .ok_or(SftpError::TransferNotFound)?;
        handle.cancel.cancel();
        info!("[SFTP] Cancellation requested for transfer {}", transfer_id);
        Ok(())
    }

    /// 取消会话的全部传输并丢弃缓存服务
    pub async fn cancel_session(&self, session_id: Uuid) {
        {
            let transfers = self.transfers.lock().unwrap();
            for handle in transfers.values() {
                if handle.session_id == session_id {
                    handle.cancel.cancel();
                }
            }
        }
        self.invalidate(session_id).await;
    }

    /// 为单个传输打开专属 SFTP 通道
    async fn open_transfer_session(&self, session_id: Uuid) -> Result<SftpSession, SftpError> {
        let ssh_session = self.pool.get(session_id)?;
        let channel = ssh_session.open_sftp_channel().await?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::Protocol(format!("Failed to create SFTP session: {}", e)))
    }

    fn register(&self, transfer_id: Uuid, session_id: Uuid) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.transfers.lock().unwrap().insert(
            transfer_id,
            TransferHandle {
                session_id,
                cancel: cancel.clone(),
            },
        );
        cancel
    }
}

/// 进度事件发射器，按字节步长节流，完成时必定发出
fn progress_emitter(
    events: mpsc::UnboundedSender<EngineEvent>,
    session_id: Uuid,
    transfer_id: Uuid,
) -> impl FnMut(u64, u64) {
    let mut last_emitted = 0u64;
    move |bytes_transferred, total_bytes| {
        if bytes_transferred != total_bytes && bytes_transferred - last_emitted < PROGRESS_STEP {
            return;
        }
        last_emitted = bytes_transferred;
        // 源文件在统计总量后可能继续增长，比例封顶在 1.0
        let progress = if total_bytes > 0 {
            (bytes_transferred as f32 / total_bytes as f32).min(1.0)
        } else {
            0.0
        };
        let _ = events.send(EngineEvent::TransferProgress {
            session_id,
            transfer_id,
            bytes_transferred,
            total_bytes,
            progress,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_unknown_transfer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = SftpManager::new(Arc::new(ConnectionPool::new()), tx);
        assert!(matches!(
            manager.cancel_transfer(Uuid::new_v4()),
            Err(SftpError::TransferNotFound)
        ));
    }

    #[test]
    fn test_progress_emitter_throttles_and_flushes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut emit = progress_emitter(tx, Uuid::new_v4(), Uuid::new_v4());

        // 小步长增量被节流
        emit(1024, 1_000_000);
        assert!(rx.try_recv().is_err());

        // 跨过步长后发出
        emit(PROGRESS_STEP + 1024, 1_000_000);
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::TransferProgress { .. }
        ));

        // 完成时必定发出
        emit(1_000_000, 1_000_000);
        match rx.try_recv().unwrap() {
            EngineEvent::TransferProgress {
                bytes_transferred,
                total_bytes,
                progress,
                ..
            } => {
                assert_eq!(bytes_transferred, 1_000_000);
                assert_eq!(total_bytes, 1_000_000);
                assert!((progress - 1.0).abs() < f32::EPSILON);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_progress_ratio_stays_in_unit_range() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut emit = progress_emitter(tx, Uuid::new_v4(), Uuid::new_v4());

        // 传输的字节数超过开始时统计的总量（源文件中途变大）
        emit(300 * 1024, 1024);
        match rx.try_recv().unwrap() {
            EngineEvent::TransferProgress { progress, .. } => {
                assert!((0.0..=1.0).contains(&progress));
                assert_eq!(progress, 1.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
