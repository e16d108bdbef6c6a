// SFTP 服务 - 封装 russh-sftp 客户端

use std::sync::Arc;

use chrono::{DateTime, Utc};
use russh_sftp::client::SftpSession;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::sftp::{format_permissions, join_path, FileEntry};
use crate::ssh::SshSession;

use super::{map_sftp_error, SftpError};

/// SFTP 服务
/// 封装 russh-sftp 客户端，提供目录与文件元数据操作
pub struct SftpService {
    /// 所属会话 ID
    session_id: Uuid,
    /// russh-sftp 客户端会话（线程安全）
    sftp: Arc<SftpSession>,
}

impl SftpService {
    /// 在已有 SSH 会话上打开 SFTP 子系统
    pub async fn new(session_id: Uuid, ssh_session: &Arc<SshSession>) -> Result<Self, SftpError> {
        let channel = ssh_session.open_sftp_channel().await?;

        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::Protocol(format!("Failed to create SFTP session: {}", e)))?;

        info!("[SFTP] SFTP service created for session {}", session_id);

        Ok(Self {
            session_id,
            sftp: Arc::new(sftp),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// 获取用户主目录
    pub async fn home_dir(&self) -> Result<String, SftpError> {
        match self.sftp.canonicalize(".").await {
            Ok(path) => {
                debug!("[SFTP] Home directory: {}", path);
                Ok(path)
            }
            Err(e) => {
                debug!("[SFTP] Failed to resolve home directory: {}, using /", e);
                Ok("/".to_string())
            }
        }
    }

    /// 读取目录内容
    ///
    /// 每次调用都重新向服务器请求，不做缓存。
    pub async fn read_dir(&self, path: &str) -> Result<Vec<FileEntry>, SftpError> {
        debug!("[SFTP] Reading directory: {}", path);

        let dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| map_sftp_error(path, e))?;

        let mut entries = Vec::new();
        for entry in dir {
            let name = entry.file_name();

            if name == "." || name == ".." {
                continue;
            }

            let full_path = join_path(path, &name);
            let attrs = entry.metadata();
            let is_dir = attrs.is_dir();

            entries.push(FileEntry {
                name: name.to_string(),
                path: full_path,
                is_dir,
                size: attrs.size.unwrap_or(0),
                modified: attrs.mtime.and_then(mtime_to_datetime),
                permissions: attrs
                    .permissions
                    .map(|mode| format_permissions(mode, is_dir)),
            });
        }

        debug!("[SFTP] Read {} entries from {}", entries.len(), path);
        Ok(entries)
    }

    /// 创建目录
    ///
    /// 目标已存在时返回 AlreadyExists 而非笼统的协议错误。
    pub async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        info!("[SFTP] Creating directory: {}", path);
        match self.sftp.create_dir(path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.sftp.metadata(path).await.is_ok() {
                    return Err(SftpError::AlreadyExists(path.to_string()));
                }
                Err(map_sftp_error(path, e))
            }
        }
    }

    /// 删除文件
    pub async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        info!("[SFTP] Removing file: {}", path);
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| map_sftp_error(path, e))
    }

    /// 删除空目录
    pub async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        info!("[SFTP] Removing directory: {}", path);
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| map_sftp_error(path, e))
    }

    /// 递归删除目录（深度优先）
    pub fn remove_recursive<'a>(
        &'a self,
        path: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SftpError>> + Send + 'a>>
    {
        Box::pin(async move {
            let entries = self.read_dir(path).await?;
            for entry in entries {
                if entry.is_dir {
                    self.remove_recursive(&entry.path).await?;
                } else {
                    self.remove_file(&entry.path).await?;
                }
            }
            self.remove_dir(path).await
        })
    }

    /// 重命名文件或目录
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        info!("[SFTP] Renaming {} -> {}", from, to);
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| map_sftp_error(from, e))
    }

    /// 获取文件/目录属性
    pub async fn stat(&self, path: &str) -> Result<FileEntry, SftpError> {
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| map_sftp_error(path, e))?;

        let name = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("/")
            .to_string();
        let is_dir = attrs.is_dir();

        Ok(FileEntry {
            name,
            path: path.to_string(),
            is_dir,
            size: attrs.size.unwrap_or(0),
            modified: attrs.mtime.and_then(mtime_to_datetime),
            permissions: attrs
                .permissions
                .map(|mode| format_permissions(mode, is_dir)),
        })
    }

    /// 获取 SFTP 会话引用（供传输任务复用）
    pub fn sftp(&self) -> Arc<SftpSession> {
        self.sftp.clone()
    }
}

fn mtime_to_datetime(mtime: u32) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(mtime as i64, 0)
}
