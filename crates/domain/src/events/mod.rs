//! 变更通知
//!
//! 后端存储提交后发出的变更事件，以及订阅时使用的过滤条件。
//! 在线状态、输入状态等瞬时信号同样以 `Broadcast` 类型的事件在传输层上流动。

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::value_objects::{Timestamp, Topic};

/// 逻辑表名
pub mod tables {
    pub const MESSAGES: &str = "messages";
    pub const REACTIONS: &str = "reactions";
    pub const MENTIONS: &str = "mentions";
    pub const PROFILES: &str = "profiles";
    pub const PRESENCE: &str = "presence";
    pub const APP_SETTINGS: &str = "app_settings";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// 不落库的瞬时广播
    Broadcast,
}

/// 一次已提交写入（或一次瞬时广播）的通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub topic: Topic,
    pub table: String,
    pub kind: ChangeKind,
    pub payload: serde_json::Value,
    pub committed_at: Timestamp,
}

impl ChangeEvent {
    pub fn new(
        topic: Topic,
        table: impl Into<String>,
        kind: ChangeKind,
        payload: serde_json::Value,
        committed_at: Timestamp,
    ) -> Self {
        Self {
            topic,
            table: table.into(),
            kind,
            payload,
            committed_at,
        }
    }

    /// 将可序列化的行包装为变更事件
    pub fn for_row<T: Serialize>(
        topic: Topic,
        table: impl Into<String>,
        kind: ChangeKind,
        row: &T,
        committed_at: Timestamp,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_value(row)?;
        Ok(Self::new(topic, table, kind, payload, committed_at))
    }

    /// 解析事件负载
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// 订阅过滤条件，字段为空表示不限制
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub table: Option<String>,
    pub kind: Option<ChangeKind>,
}

impl ChangeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: ChangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        let table_ok = self
            .table
            .as_deref()
            .map(|table| table == event.table)
            .unwrap_or(true);
        let kind_ok = self.kind.map(|kind| kind == event.kind).unwrap_or(true);
        table_ok && kind_ok
    }
}
