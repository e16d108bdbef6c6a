// 本地文件系统操作
// 传输对端的本地侧浏览，接口形态与远端目录操作保持一致

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::sftp::{format_permissions, FileEntry};

/// 本地用户主目录
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// 列出本地目录内容
pub async fn list_dir(path: &Path) -> Result<Vec<FileEntry>, std::io::Error> {
    debug!("[Local] Reading directory: {}", path.display());

    let mut read_dir = tokio::fs::read_dir(path).await?;
    let mut entries = Vec::new();

    while let Some(entry) = read_dir.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            // 条目在遍历期间消失时跳过
            Err(_) => continue,
        };

        let is_dir = metadata.is_dir();
        let modified = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(format_permissions(metadata.permissions().mode(), is_dir))
        };
        #[cfg(not(unix))]
        let permissions = None;

        entries.push(FileEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            path: entry.path().to_string_lossy().to_string(),
            is_dir,
            size: metadata.len(),
            modified,
            permissions,
        });
    }

    Ok(entries)
}

/// 创建本地目录
pub async fn create_dir(path: &Path) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(path).await
}

/// 删除本地文件或目录
pub async fn remove(path: &Path, recursive: bool) -> Result<(), std::io::Error> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.is_dir() {
        if recursive {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_dir(path).await
        }
    } else {
        tokio::fs::remove_file(path).await
    }
}

/// 重命名本地文件或目录
pub async fn rename(from: &Path, to: &Path) -> Result<(), std::io::Error> {
    tokio::fs::rename(from, to).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_list_dir() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"hello")
            .await
            .unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

        let entries = list_dir(dir.path()).await.unwrap();
        assert_eq!(entries.len(), 2);

        let file = entries.iter().find(|e| e.name == "a.txt").unwrap();
        assert!(!file.is_dir);
        assert_eq!(file.size, 5);
        assert!(file.modified.is_some());

        let sub = entries.iter().find(|e| e.name == "sub").unwrap();
        assert!(sub.is_dir);
    }

    #[tokio::test]
    async fn test_remove_file_and_dir() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        tokio::fs::write(&file, b"x").await.unwrap();
        remove(&file, false).await.unwrap();
        assert!(!file.exists());

        let sub = dir.path().join("sub");
        tokio::fs::create_dir(&sub).await.unwrap();
        tokio::fs::write(sub.join("b.txt"), b"y").await.unwrap();

        // 非递归删除非空目录失败
        assert!(remove(&sub, false).await.is_err());
        remove(&sub, true).await.unwrap();
        assert!(!sub.exists());
    }

    #[tokio::test]
    async fn test_rename() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("old.txt");
        let to = dir.path().join("new.txt");
        tokio::fs::write(&from, b"x").await.unwrap();
        rename(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert!(to.exists());
    }
}
