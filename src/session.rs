// 会话状态机与会话注册表
//
// Session 是运行时对象，不持久化。状态只能通过注册表按
// 状态机迁移，外部无法绕过管理器直接改写。

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::EngineEvent;

/// 会话状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, max_attempts: u32 },
    Error,
}

impl SessionStatus {
    /// 状态机迁移检查
    ///
    /// disconnected --connect--> connecting --auth--> connected | error
    /// connected --drop--> disconnected | reconnecting
    /// reconnecting --> connected | error | reconnecting（下一次尝试）
    /// 任意状态 --close--> disconnected
    pub fn can_transition(&self, next: &SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            // 显式关闭：任意状态都可以回到 disconnected
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) | (Connecting, Error) => true,
            (Connected, Reconnecting { .. }) => true,
            (Reconnecting { .. }, Connected)
            | (Reconnecting { .. }, Error)
            | (Reconnecting { .. }, Reconnecting { .. }) => true,
            _ => false,
        }
    }
}

/// 运行时会话对象
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// 发起连接的主机 ID
    pub host_id: Uuid,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    /// 连接建立时间
    pub connected_at: Option<DateTime<Utc>>,
    /// 最近一次测得的延迟（毫秒）
    pub latency_ms: Option<u32>,
}

impl Session {
    pub fn new(host_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            host_id,
            status: SessionStatus::Disconnected,
            created_at: Utc::now(),
            connected_at: None,
            latency_ms: None,
        }
    }
}

/// 会话注册表
///
/// 所有状态迁移都经过 `set_status`，非法迁移被拒绝并记日志，
/// 合法迁移通过事件总线广播给订阅者。
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Session>>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl SessionRegistry {
    pub fn new(events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// 创建新会话（初始状态 disconnected）
    pub fn create(&self, host_id: Uuid) -> Session {
        let session = Session::new(host_id);
        self.sessions
            .write()
            .unwrap()
            .insert(session.id, session.clone());
        debug!("[Session] Created session {} for host {}", session.id, host_id);
        session
    }

    pub fn get(&self, id: Uuid) -> Option<Session> {
        self.sessions.read().unwrap().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<Session> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.read().unwrap().contains_key(&id)
    }

    /// 迁移会话状态
    ///
    /// 返回 false 表示会话不存在或迁移非法（已记录日志，不会 panic）。
    pub fn set_status(&self, id: Uuid, status: SessionStatus) -> bool {
        let mut sessions = self.sessions.write().unwrap();
        let Some(session) = sessions.get_mut(&id) else {
            debug!("[Session] set_status on unknown session {}", id);
            return false;
        };
        if !session.status.can_transition(&status) {
            warn!(
                "[Session] Illegal transition {:?} -> {:?} for {}",
                session.status, status, id
            );
            return false;
        }
        session.status = status;
        if matches!(status, SessionStatus::Connected) {
            session.connected_at = Some(Utc::now());
        }
        let _ = self.events.send(EngineEvent::Status {
            session_id: id,
            status,
        });
        true
    }

    /// 记录最近一次延迟测量
    pub fn set_latency(&self, id: Uuid, latency_ms: u32) {
        if let Some(session) = self.sessions.write().unwrap().get_mut(&id) {
            session.latency_ms = Some(latency_ms);
        }
    }

    /// 销毁会话对象（显式关闭后调用）
    pub fn remove(&self, id: Uuid) -> Option<Session> {
        self.sessions.write().unwrap().remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        let (tx, _rx) = mpsc::unbounded_channel();
        SessionRegistry::new(tx)
    }

    #[test]
    fn test_legal_transitions() {
        use SessionStatus::*;
        assert!(Disconnected.can_transition(&Connecting));
        assert!(Connecting.can_transition(&Connected));
        assert!(Connecting.can_transition(&Error));
        assert!(Connected.can_transition(&Disconnected));
        assert!(Connected.can_transition(&Reconnecting { attempt: 1, max_attempts: 3 }));
        assert!(Reconnecting { attempt: 1, max_attempts: 3 }.can_transition(&Connected));
        assert!(Reconnecting { attempt: 3, max_attempts: 3 }.can_transition(&Error));
        // 任意状态都可以显式关闭
        assert!(Error.can_transition(&Disconnected));
        assert!(Disconnected.can_transition(&Disconnected));
    }

    #[test]
    fn test_illegal_transitions() {
        use SessionStatus::*;
        assert!(!Disconnected.can_transition(&Connected));
        assert!(!Disconnected.can_transition(&Error));
        assert!(!Connected.can_transition(&Connecting));
        assert!(!Error.can_transition(&Connected));
        assert!(!Connected.can_transition(&Error));
    }

    #[test]
    fn test_registry_rejects_illegal_transition() {
        let reg = registry();
        let session = reg.create(Uuid::new_v4());
        assert!(!reg.set_status(session.id, SessionStatus::Connected));
        assert!(reg.set_status(session.id, SessionStatus::Connecting));
        assert!(reg.set_status(session.id, SessionStatus::Connected));
        assert!(reg.get(session.id).unwrap().connected_at.is_some());
    }

    #[test]
    fn test_scenario_connect_then_drop() {
        let reg = registry();
        let session = reg.create(Uuid::new_v4());
        // disconnected -> connecting -> connected -> disconnected
        assert!(reg.set_status(session.id, SessionStatus::Connecting));
        assert!(reg.set_status(session.id, SessionStatus::Connected));
        assert!(reg.set_status(session.id, SessionStatus::Disconnected));
        // 重复关闭是幂等的
        assert!(reg.set_status(session.id, SessionStatus::Disconnected));
    }
}
