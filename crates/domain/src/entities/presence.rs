//! 在线状态
//!
//! 在线状态只是建议性的：超过心跳超时未更新的记录即使标记为在线也按离线处理。

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::value_objects::{ActorId, Timestamp, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// 在 presence 话题上广播的瞬时事件，不落库
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    Online {
        actor: ActorId,
        custom_status: Option<String>,
        at: Timestamp,
    },
    Heartbeat {
        actor: ActorId,
        at: Timestamp,
    },
    Status {
        actor: ActorId,
        custom_status: Option<String>,
        at: Timestamp,
    },
    Offline {
        actor: ActorId,
        at: Timestamp,
    },
    TypingStarted {
        actor: ActorId,
        at: Timestamp,
    },
    TypingStopped {
        actor: ActorId,
        at: Timestamp,
    },
}

impl PresenceEvent {
    pub fn actor(&self) -> ActorId {
        match self {
            PresenceEvent::Online { actor, .. }
            | PresenceEvent::Heartbeat { actor, .. }
            | PresenceEvent::Status { actor, .. }
            | PresenceEvent::Offline { actor, .. }
            | PresenceEvent::TypingStarted { actor, .. }
            | PresenceEvent::TypingStopped { actor, .. } => *actor,
        }
    }

    pub fn at(&self) -> Timestamp {
        match self {
            PresenceEvent::Online { at, .. }
            | PresenceEvent::Heartbeat { at, .. }
            | PresenceEvent::Status { at, .. }
            | PresenceEvent::Offline { at, .. }
            | PresenceEvent::TypingStarted { at, .. }
            | PresenceEvent::TypingStopped { at, .. } => *at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub actor: ActorId,
    pub topic: Topic,
    pub online: bool,
    pub custom_status: Option<String>,
    pub last_seen: Timestamp,
}

impl PresenceRecord {
    pub fn new(actor: ActorId, topic: Topic, at: Timestamp) -> Self {
        Self {
            actor,
            topic,
            online: false,
            custom_status: None,
            last_seen: at,
        }
    }

    /// 应用一条事件。早于 last_seen 的事件被丢弃并返回 false。
    pub fn apply(&mut self, event: &PresenceEvent) -> bool {
        let at = event.at();
        if at < self.last_seen {
            return false;
        }

        match event {
            PresenceEvent::Online { custom_status, .. } => {
                self.online = true;
                self.custom_status = custom_status.clone();
            }
            PresenceEvent::Heartbeat { .. } => self.online = true,
            PresenceEvent::Status { custom_status, .. } => {
                self.custom_status = custom_status.clone();
            }
            PresenceEvent::Offline { .. } => self.online = false,
            PresenceEvent::TypingStarted { .. } | PresenceEvent::TypingStopped { .. } => {}
        }
        self.last_seen = at;
        true
    }

    /// 读取端看到的状态：超时未更新即视为离线
    pub fn effective_status(&self, now: Timestamp, timeout: Duration) -> PresenceStatus {
        if self.online && now - self.last_seen <= timeout {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn stale_events_do_not_move_last_seen_backwards() {
        let actor = ActorId::from(Uuid::new_v4());
        let now = Utc::now();
        let mut record = PresenceRecord::new(actor, Topic::leaderboard(), now);

        assert!(record.apply(&PresenceEvent::Online {
            actor,
            custom_status: Some("grinding".into()),
            at: now + Duration::seconds(10),
        }));
        assert!(!record.apply(&PresenceEvent::Offline { actor, at: now }));

        assert!(record.online);
        assert_eq!(record.last_seen, now + Duration::seconds(10));
    }

    #[test]
    fn missing_heartbeat_reads_as_offline() {
        let actor = ActorId::from(Uuid::new_v4());
        let now = Utc::now();
        let mut record = PresenceRecord::new(actor, Topic::leaderboard(), now);
        record.apply(&PresenceEvent::Online {
            actor,
            custom_status: None,
            at: now,
        });

        let timeout = Duration::seconds(30);
        assert_eq!(record.effective_status(now + Duration::seconds(29), timeout), PresenceStatus::Online);
        assert_eq!(record.effective_status(now + Duration::seconds(31), timeout), PresenceStatus::Offline);
    }
}
