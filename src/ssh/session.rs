// SSH 会话管理
// 连接成功后的会话对象，支持并发打开多个通道

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use russh::client::{Handle, Msg};
use russh::ChannelMsg;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::error::SshError;
use super::handler::ClientHandler;

/// PTY 请求参数
#[derive(Clone, Debug)]
pub struct PtyRequest {
    /// 终端类型
    pub term: String,
    /// 列数
    pub col_width: u32,
    /// 行数
    pub row_height: u32,
    /// 像素宽度
    pub pix_width: u32,
    /// 像素高度
    pub pix_height: u32,
    /// 终端模式
    pub modes: Vec<(russh::Pty, u32)>,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            col_width: 80,
            row_height: 24,
            pix_width: 0,
            pix_height: 0,
            modes: vec![],
        }
    }
}

type RusshChannel = russh::Channel<Msg>;

/// SSH 会话（连接成功后）
/// 内部持有 Handle，支持并发打开多个通道
pub struct SshSession {
    /// 会话 ID
    id: Uuid,
    /// 共享的 russh Handle
    handle: Arc<Handle<ClientHandler>>,
    /// 连接状态
    is_connected: AtomicBool,
}

impl SshSession {
    pub fn new(id: Uuid, handle: Arc<Handle<ClientHandler>>) -> Self {
        Self {
            id,
            handle,
            is_connected: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 检查会话是否活跃
    pub fn is_alive(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed)
    }

    /// 标记会话断开
    pub fn mark_disconnected(&self) {
        self.is_connected.store(false, Ordering::Relaxed);
    }

    /// 打开终端 Shell 通道
    pub async fn open_terminal(&self, pty: PtyRequest) -> Result<TerminalChannel, SshError> {
        if !self.is_alive() {
            return Err(SshError::Disconnected(
                "Session is disconnected".to_string(),
            ));
        }

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SshError::from)?;

        channel
            .request_pty(
                false,
                &pty.term,
                pty.col_width,
                pty.row_height,
                pty.pix_width,
                pty.pix_height,
                &pty.modes,
            )
            .await
            .map_err(SshError::from)?;

        channel.request_shell(false).await.map_err(SshError::from)?;

        Ok(TerminalChannel::new(channel, self.handle.clone()))
    }

    /// 打开 SFTP 子系统通道
    pub async fn open_sftp_channel(&self) -> Result<RusshChannel, SshError> {
        if !self.is_alive() {
            return Err(SshError::Disconnected(
                "Session is disconnected".to_string(),
            ));
        }

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SshError::from)?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(SshError::from)?;

        Ok(channel)
    }

    /// 往返延迟探测：打开并立即关闭一个会话通道
    pub async fn probe_latency(&self) -> Result<u32, SshError> {
        if !self.is_alive() {
            return Err(SshError::Disconnected(
                "Session is disconnected".to_string(),
            ));
        }

        let start = Instant::now();
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SshError::from)?;
        let elapsed = start.elapsed().as_millis() as u32;
        let _ = channel.eof().await;
        Ok(elapsed)
    }

    /// 关闭会话（幂等）
    pub async fn close(&self) -> Result<(), SshError> {
        if !self.is_connected.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "disconnect", "en")
            .await
            .map_err(SshError::from)
    }
}

/// 终端通道
/// 分离读写路径以避免死锁：
/// - 读：需要 channel.wait()，会持有 channel 内部状态
/// - 写：直接使用 handle.data()，不需要持有 channel 锁
pub struct TerminalChannel {
    id: russh::ChannelId,
    handle: Arc<Handle<ClientHandler>>,
    channel: Mutex<RusshChannel>,
}

impl TerminalChannel {
    fn new(channel: RusshChannel, handle: Arc<Handle<ClientHandler>>) -> Self {
        Self {
            id: channel.id(),
            channel: Mutex::new(channel),
            handle,
        }
    }

    /// 写入数据到终端
    /// 直接通过 handle 发送，不阻塞读取循环
    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        self.handle
            .data(self.id, data.to_vec().into())
            .await
            .map_err(|_| SshError::Channel("Failed to send data to channel".to_string()))
    }

    /// 读取终端输出
    /// 返回 None 表示通道已关闭
    pub async fn read(&self) -> Result<Option<Vec<u8>>, SshError> {
        let mut channel = self.channel.lock().await;

        match channel.wait().await {
            Some(channel_msg) => match channel_msg {
                ChannelMsg::Data { data } => Ok(Some(data.to_vec())),
                ChannelMsg::ExtendedData { data, .. } => Ok(Some(data.to_vec())),
                ChannelMsg::Eof | ChannelMsg::Close => Ok(None),
                _ => Ok(Some(vec![])),
            },
            None => Ok(None),
        }
    }

    /// 调整终端大小
    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        let channel = self.channel.lock().await;
        channel
            .window_change(cols, rows, 0, 0)
            .await
            .map_err(|e| SshError::Channel(e.to_string()))
    }

    /// 关闭通道
    pub async fn close(&self) -> Result<(), SshError> {
        let channel = self.channel.lock().await;
        channel
            .eof()
            .await
            .map_err(|e| SshError::Channel(e.to_string()))
    }
}
