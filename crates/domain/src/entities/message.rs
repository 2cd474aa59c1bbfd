//! 消息实体定义
//!
//! 包含消息、回复线程的排序规则以及发送前的校验。

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ActorId, MessageId, Timestamp, Topic};

/// 消息正文最大字符数
pub const MAX_BODY_CHARS: usize = 2000;

/// 消息类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// 文本消息
    #[default]
    Text,
    /// 图片消息
    Image,
    /// 语音消息
    Voice,
    /// 文件消息
    File,
}

/// 待发送的消息
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub author: ActorId,
    pub body: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub parent_id: Option<MessageId>,
    pub mentions: Vec<ActorId>,
}

impl NewMessage {
    pub fn text(author: ActorId, body: impl Into<String>) -> Self {
        Self {
            author,
            body: body.into(),
            kind: MessageKind::Text,
            media_url: None,
            parent_id: None,
            mentions: Vec::new(),
        }
    }

    pub fn with_media(mut self, kind: MessageKind, url: impl Into<String>) -> Self {
        self.kind = kind;
        self.media_url = Some(url.into());
        self
    }

    pub fn reply_to(mut self, parent_id: MessageId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn mentioning(mut self, actor: ActorId) -> Self {
        self.mentions.push(actor);
        self
    }

    /// 发送前校验
    pub fn validate(&self) -> DomainResult<()> {
        validate_body(&self.body, self.media_url.is_some())?;

        if let Some(url) = &self.media_url {
            if url.trim().is_empty() {
                return Err(DomainError::validation_error(
                    "media_url",
                    "媒体地址不能为空",
                ));
            }
        } else if self.kind != MessageKind::Text {
            return Err(DomainError::validation_error(
                "media_url",
                "非文本消息必须携带媒体地址",
            ));
        }

        Ok(())
    }
}

/// 校验消息正文：无媒体时不能为空，且不能超过长度上限
pub fn validate_body(body: &str, has_media: bool) -> DomainResult<()> {
    if body.trim().is_empty() && !has_media {
        return Err(DomainError::validation_error("body", "消息内容不能为空"));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(DomainError::validation_error(
            "body",
            format!("消息内容不能超过{MAX_BODY_CHARS}个字符"),
        ));
    }
    Ok(())
}

/// 正文中以 `@<参与者ID>` 形式引用的参与者，按出现顺序返回
pub fn referenced_actors(body: &str) -> Vec<ActorId> {
    body.split(|c: char| c.is_whitespace())
        .filter_map(|token| token.strip_prefix('@'))
        .filter_map(|rest| {
            let id = rest.trim_end_matches(|c: char| !c.is_ascii_hexdigit());
            uuid::Uuid::parse_str(id).ok().map(ActorId::from)
        })
        .collect()
}

/// 消息实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 消息唯一ID，创建后不可变
    pub id: MessageId,
    /// 所属话题
    pub topic: Topic,
    /// 作者，创建后不可变
    pub author: ActorId,
    pub body: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    /// 回复的父消息
    pub parent_id: Option<MessageId>,
    pub edit_count: u32,
    pub last_edited_at: Option<Timestamp>,
    pub likes: u64,
    pub views: u64,
    pub reply_count: u64,
    pub created_at: Timestamp,
    /// 存储分配的写入序号，用于同一时间戳下的排序
    #[serde(default)]
    pub seq: u64,
}

impl Message {
    pub fn from_new(id: MessageId, topic: Topic, new: NewMessage, created_at: Timestamp) -> Self {
        Self {
            id,
            topic,
            author: new.author,
            body: new.body,
            kind: new.kind,
            media_url: new.media_url,
            parent_id: new.parent_id,
            edit_count: 0,
            last_edited_at: None,
            likes: 0,
            views: 0,
            reply_count: 0,
            created_at,
            seq: 0,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }

    /// 只有作者可以编辑
    pub fn ensure_author(&self, actor: ActorId) -> DomainResult<()> {
        if self.author != actor {
            return Err(DomainError::permission_denied("edit message"));
        }
        Ok(())
    }

    /// 就地编辑，不保留历史版本
    pub fn apply_edit(&mut self, body: String, edited_at: Timestamp) {
        self.body = body;
        self.edit_count += 1;
        self.last_edited_at = Some(edited_at);
    }
}

/// 线程内排序：先按创建时间，时间相同则按写入顺序
pub fn thread_order(a: &Message, b: &Message) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.seq.cmp(&b.seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn actor() -> ActorId {
        ActorId::from(Uuid::new_v4())
    }

    #[test]
    fn body_references_become_mentions() {
        let a = actor();
        let b = actor();
        let body = format!("hi @{a}, ping @{b}. not @someone or email@{a}");
        assert_eq!(referenced_actors(&body), vec![a, b]);
        assert!(referenced_actors("no mentions here").is_empty());
    }

    #[test]
    fn empty_text_is_rejected() {
        let result = NewMessage::text(actor(), "   ").validate();
        assert!(matches!(
            result,
            Err(DomainError::ValidationError { ref field, .. }) if field == "body"
        ));
    }

    #[test]
    fn media_message_may_have_empty_body() {
        let message = NewMessage::text(actor(), "").with_media(MessageKind::Image, "s3://img.png");
        assert!(message.validate().is_ok());
    }

    #[test]
    fn voice_without_media_is_rejected() {
        let mut message = NewMessage::text(actor(), "hello");
        message.kind = MessageKind::Voice;
        assert!(message.validate().is_err());
    }

    #[test]
    fn overly_long_body_is_rejected() {
        let message = NewMessage::text(actor(), "a".repeat(MAX_BODY_CHARS + 1));
        assert!(message.validate().is_err());
    }

    #[test]
    fn edit_preserves_identity() {
        let author = actor();
        let created_at = Utc::now();
        let mut message = Message::from_new(
            MessageId::generate(),
            Topic::room(Uuid::new_v4()),
            NewMessage::text(author, "first"),
            created_at,
        );
        let id = message.id;

        message.apply_edit("second".into(), created_at + Duration::seconds(5));

        assert_eq!(message.id, id);
        assert_eq!(message.author, author);
        assert_eq!(message.created_at, created_at);
        assert_eq!(message.edit_count, 1);
        assert_eq!(message.body, "second");
        assert!(message.ensure_author(actor()).is_err());
    }

    #[test]
    fn thread_order_breaks_ties_by_sequence() {
        let at = Utc::now();
        let topic = Topic::room(Uuid::new_v4());
        let mut first = Message::from_new(MessageId::generate(), topic.clone(), NewMessage::text(actor(), "a"), at);
        let mut second = Message::from_new(MessageId::generate(), topic, NewMessage::text(actor(), "b"), at);
        first.seq = 1;
        second.seq = 2;

        assert_eq!(thread_order(&first, &second), Ordering::Less);
        assert_eq!(thread_order(&second, &first), Ordering::Greater);
    }
}
