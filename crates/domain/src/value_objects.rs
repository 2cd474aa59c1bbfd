use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = DateTime<Utc>;

/// 话题名称的最大长度。
pub const MAX_TOPIC_LEN: usize = 128;

/// 参与者（用户）唯一标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(pub Uuid);

impl ActorId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ActorId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<ActorId> for Uuid {
    fn from(value: ActorId) -> Self {
        value.0
    }
}

/// 消息唯一标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<MessageId> for Uuid {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

/// 逻辑事件流的名称：聊天房间、排行榜、维护开关等。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into().trim().to_owned();
        if value.is_empty() {
            return Err(DomainError::validation_error("topic", "cannot be empty"));
        }
        if value.len() > MAX_TOPIC_LEN {
            return Err(DomainError::validation_error("topic", "too long"));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(DomainError::validation_error(
                "topic",
                "cannot contain whitespace",
            ));
        }
        Ok(Self(value))
    }

    /// 聊天房间话题
    pub fn room(room_id: Uuid) -> Self {
        Self(format!("room:{room_id}"))
    }

    /// 全局排行榜话题
    pub fn leaderboard() -> Self {
        Self("leaderboard".to_owned())
    }

    /// 维护模式开关话题
    pub fn maintenance_flag() -> Self {
        Self("maintenance-flag".to_owned())
    }

    /// 该话题对应的在线状态/输入状态瞬时流
    pub fn presence(&self) -> Self {
        Self(format!("presence:{}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 受限流保护的写操作类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// 提交任务
    TaskSubmission,
    /// 发送聊天消息
    Message,
    /// 添加表情反应
    Reaction,
    /// 重新发送验证邮件等
    Resend,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::TaskSubmission => "task_submission",
            ActionKind::Message => "message",
            ActionKind::Reaction => "reaction",
            ActionKind::Resend => "resend",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
