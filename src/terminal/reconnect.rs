// 自动重连
//
// 指数退避：基础间隔 * 2^(attempt-1)，上限 60 秒。
// 重连期间不弹主机密钥询问，只接受与记录完全一致的指纹。

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::EngineEvent;
use crate::session::SessionStatus;

use super::TerminalManager;

/// 退避上限
const MAX_BACKOFF_SECS: u64 = 60;

/// 计算第 attempt 次重试前的等待时间（attempt 从 1 开始）
pub fn backoff_delay(base_secs: u32, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    let secs = (base_secs as u64).saturating_mul(factor);
    Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
}

/// 重连循环
///
/// 每次尝试前迁移到 Reconnecting{attempt}，成功即恢复 Connected，
/// 尝试耗尽后迁移到 Error 并广播错误事件。
pub async fn run(manager: Arc<TerminalManager>, session_id: Uuid, cols: u32, rows: u32) {
    let settings = match manager.vault().settings().await {
        Ok(settings) => settings,
        Err(e) => {
            warn!("[Reconnect] Cannot read settings: {}", e);
            return;
        }
    };
    let max_attempts = settings.reconnect_attempts;
    let base_secs = settings.reconnect_interval_secs;

    for attempt in 1..=max_attempts {
        if !manager.registry().set_status(
            session_id,
            SessionStatus::Reconnecting {
                attempt,
                max_attempts,
            },
        ) {
            // 会话已被显式关闭
            return;
        }

        let delay = backoff_delay(base_secs, attempt);
        info!(
            "[Reconnect] Session {} attempt {}/{} in {:?}",
            session_id, attempt, max_attempts, delay
        );
        tokio::time::sleep(delay).await;

        match manager.establish(session_id, cols, rows, false).await {
            Ok(()) => {
                info!(
                    "[Reconnect] Session {} restored on attempt {}",
                    session_id, attempt
                );
                return;
            }
            Err(e) => {
                warn!(
                    "[Reconnect] Session {} attempt {} failed: {}",
                    session_id, attempt, e
                );
            }
        }
    }

    manager.registry().set_status(session_id, SessionStatus::Error);
    let _ = manager.events().send(EngineEvent::Error {
        session_id: Some(session_id),
        message: format!("Reconnect failed after {} attempts", max_attempts),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(5, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(5, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(5, 3), Duration::from_secs(20));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(5, 5), Duration::from_secs(60));
        assert_eq!(backoff_delay(30, 10), Duration::from_secs(60));
        // 溢出安全
        assert_eq!(backoff_delay(u32::MAX, u32::MAX), Duration::from_secs(60));
    }
}
