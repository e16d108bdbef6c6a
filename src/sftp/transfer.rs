// 分块传输循环
//
// 上传/下载都按 32 KiB 分块推进:
// - 每块之间检查取消令牌，阻塞 IO 期间也能被取消
// - 每块的读和写各受空闲超时约束，超时视为传输失败
// - 进度回调的字节数单调递增
// - 失败或取消时只清理本次创建的目标文件，创建之前的失败不触碰目标

use std::path::Path;
use std::time::Duration;

use russh_sftp::client::SftpSession;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{map_sftp_error, SftpError};

/// 传输分块大小
pub const CHUNK_SIZE: usize = 32 * 1024;

/// 上传本地文件到远端，返回传输的字节数
pub async fn upload(
    sftp: &SftpSession,
    local_path: &Path,
    remote_path: &str,
    cancel: &CancellationToken,
    idle_timeout: Duration,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<u64, SftpError> {
    info!("[SFTP] Uploading {:?} -> {}", local_path, remote_path);

    let mut local_file = tokio::fs::File::open(local_path).await?;
    let total_bytes = local_file.metadata().await?.len();

    // 远端文件从这里起才存在
    let mut remote_file = sftp
        .create(remote_path)
        .await
        .map_err(|e| map_sftp_error(remote_path, e))?;

    let result: Result<u64, SftpError> = async {
        let n = copy_chunks(
            &mut local_file,
            &mut remote_file,
            total_bytes,
            cancel,
            idle_timeout,
            &mut on_progress,
        )
        .await?;
        remote_file
            .shutdown()
            .await
            .map_err(|e| SftpError::TransferFailed(format!("Failed to close remote file: {}", e)))?;
        Ok(n)
    }
    .await;

    match result {
        Ok(n) => {
            info!("[SFTP] Upload complete: {} bytes", n);
            Ok(n)
        }
        Err(e) => {
            drop(remote_file);
            if let Err(cleanup) = sftp.remove_file(remote_path).await {
                debug!("[SFTP] Could not remove partial file {}: {}", remote_path, cleanup);
            }
            Err(e)
        }
    }
}

/// 从远端下载文件到本地，返回传输的字节数
pub async fn download(
    sftp: &SftpSession,
    remote_path: &str,
    local_path: &Path,
    cancel: &CancellationToken,
    idle_timeout: Duration,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<u64, SftpError> {
    info!("[SFTP] Downloading {} -> {:?}", remote_path, local_path);

    let attrs = sftp
        .metadata(remote_path)
        .await
        .map_err(|e| map_sftp_error(remote_path, e))?;
    let total_bytes = attrs.size.unwrap_or(0);

    let mut remote_file = sftp
        .open(remote_path)
        .await
        .map_err(|e| map_sftp_error(remote_path, e))?;

    let n = write_local(
        &mut remote_file,
        local_path,
        total_bytes,
        cancel,
        idle_timeout,
        &mut on_progress,
    )
    .await?;

    debug!("[SFTP] Download complete: {} bytes", n);
    Ok(n)
}

/// 创建本地文件并写入 reader 的内容
///
/// 本地文件在这里才被创建，失败时删除的也只是这次创建的文件。
async fn write_local<R>(
    reader: &mut R,
    local_path: &Path,
    total_bytes: u64,
    cancel: &CancellationToken,
    idle_timeout: Duration,
    on_progress: &mut impl FnMut(u64, u64),
) -> Result<u64, SftpError>
where
    R: AsyncRead + Unpin,
{
    let mut local_file = tokio::fs::File::create(local_path).await?;

    let result: Result<u64, SftpError> = async {
        let n = copy_chunks(
            reader,
            &mut local_file,
            total_bytes,
            cancel,
            idle_timeout,
            on_progress,
        )
        .await?;
        local_file.flush().await?;
        local_file.sync_all().await?;
        Ok(n)
    }
    .await;

    match result {
        Ok(n) => Ok(n),
        Err(e) => {
            drop(local_file);
            let _ = tokio::fs::remove_file(local_path).await;
            Err(e)
        }
    }
}

/// 分块拷贝循环
///
/// 每块之前检查取消令牌，读和写各受空闲超时约束。
async fn copy_chunks<R, W>(
    reader: &mut R,
    writer: &mut W,
    total_bytes: u64,
    cancel: &CancellationToken,
    idle_timeout: Duration,
    on_progress: &mut impl FnMut(u64, u64),
) -> Result<u64, SftpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut bytes_transferred = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(SftpError::Cancelled);
        }

        let read = tokio::time::timeout(idle_timeout, reader.read(&mut buffer));
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(SftpError::Cancelled),
            result = read => match result {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(SftpError::TransferFailed(format!("Read failed: {}", e))),
                Err(_) => return Err(SftpError::IdleTimeout(idle_timeout.as_secs())),
            },
        };
        if n == 0 {
            break;
        }

        let write = tokio::time::timeout(idle_timeout, writer.write_all(&buffer[..n]));
        tokio::select! {
            _ = cancel.cancelled() => return Err(SftpError::Cancelled),
            result = write => match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(SftpError::TransferFailed(format!("Write failed: {}", e))),
                Err(_) => return Err(SftpError::IdleTimeout(idle_timeout.as_secs())),
            },
        }

        bytes_transferred += n as u64;
        on_progress(bytes_transferred, total_bytes);
    }

    Ok(bytes_transferred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_copy_chunks_reports_monotonic_progress() {
        let data = vec![42u8; CHUNK_SIZE * 2 + 17];
        let mut reader = data.as_slice();
        let mut writer = Cursor::new(Vec::new());
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();

        let n = copy_chunks(
            &mut reader,
            &mut writer,
            data.len() as u64,
            &cancel,
            Duration::from_secs(5),
            &mut |done, total| seen.push((done, total)),
        )
        .await
        .unwrap();

        assert_eq!(n, data.len() as u64);
        assert_eq!(writer.into_inner(), data);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(seen.last().unwrap().0, data.len() as u64);
    }

    #[tokio::test]
    async fn test_copy_chunks_cancelled_before_first_chunk() {
        let data = vec![0u8; 16];
        let mut reader = data.as_slice();
        let mut writer = Cursor::new(Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = copy_chunks(
            &mut reader,
            &mut writer,
            16,
            &cancel,
            Duration::from_secs(5),
            &mut |_, _| {},
        )
        .await;
        assert!(matches!(result, Err(SftpError::Cancelled)));
        assert!(writer.into_inner().is_empty());
    }

    #[tokio::test]
    async fn test_copy_chunks_idle_timeout() {
        // 对端既不写入也不关闭，读取一直挂起
        let (mut quiet, _held) = tokio::io::duplex(64);
        let mut writer = Cursor::new(Vec::new());
        let cancel = CancellationToken::new();

        let result = copy_chunks(
            &mut quiet,
            &mut writer,
            0,
            &cancel,
            Duration::from_millis(50),
            &mut |_, _| {},
        )
        .await;
        assert!(matches!(result, Err(SftpError::IdleTimeout(_))));
    }

    #[tokio::test]
    async fn test_write_local_removes_partial_file_on_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("partial.bin");
        let cancel = CancellationToken::new();

        // 先推送一块数据，然后让读取挂起直到超时
        let (mut remote, mut feeder) = tokio::io::duplex(CHUNK_SIZE);
        feeder.write_all(&[7u8; 128]).await.unwrap();

        let result = write_local(
            &mut remote,
            &target,
            1024,
            &cancel,
            Duration::from_millis(50),
            &mut |_, _| {},
        )
        .await;

        assert!(matches!(result, Err(SftpError::IdleTimeout(_))));
        assert!(!target.exists());
        drop(feeder);
    }

    #[tokio::test]
    async fn test_write_local_keeps_complete_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("whole.bin");
        let cancel = CancellationToken::new();
        let data = vec![9u8; 4096];
        let mut reader = data.as_slice();

        let n = write_local(
            &mut reader,
            &target,
            data.len() as u64,
            &cancel,
            Duration::from_secs(5),
            &mut |_, _| {},
        )
        .await
        .unwrap();

        assert_eq!(n, data.len() as u64);
        assert_eq!(tokio::fs::read(&target).await.unwrap(), data);
    }
}
