//! 表情反应与提及
//!
//! 存储层允许重复行，聚合展示时按 (消息, 表情, 参与者) 去重。

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ActorId, MessageId, Timestamp};

/// 表情最大字节数
pub const MAX_EMOJI_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: MessageId,
    pub emoji: String,
    pub actor: ActorId,
    pub created_at: Timestamp,
}

impl Reaction {
    pub fn new(
        message_id: MessageId,
        emoji: impl Into<String>,
        actor: ActorId,
        created_at: Timestamp,
    ) -> DomainResult<Self> {
        let emoji = emoji.into().trim().to_owned();
        if emoji.is_empty() {
            return Err(DomainError::validation_error("emoji", "表情不能为空"));
        }
        if emoji.len() > MAX_EMOJI_BYTES {
            return Err(DomainError::validation_error("emoji", "表情过长"));
        }
        Ok(Self {
            message_id,
            emoji,
            actor,
            created_at,
        })
    }
}

/// 单个表情的聚合计数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionCount {
    pub emoji: String,
    pub count: usize,
    pub actors: Vec<ActorId>,
}

/// 按表情聚合，同一参与者对同一表情只计一次。
/// 结果按计数降序、表情升序排列。
pub fn summarize_reactions(reactions: &[Reaction]) -> Vec<ReactionCount> {
    let mut by_emoji: BTreeMap<&str, BTreeSet<ActorId>> = BTreeMap::new();
    for reaction in reactions {
        by_emoji
            .entry(reaction.emoji.as_str())
            .or_default()
            .insert(reaction.actor);
    }

    let mut counts: Vec<ReactionCount> = by_emoji
        .into_iter()
        .map(|(emoji, actors)| ReactionCount {
            emoji: emoji.to_owned(),
            count: actors.len(),
            actors: actors.into_iter().collect(),
        })
        .collect();
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.emoji.cmp(&b.emoji)));
    counts
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    pub message_id: MessageId,
    pub actor: ActorId,
    pub read: bool,
    pub created_at: Timestamp,
}

impl Mention {
    pub fn new(message_id: MessageId, actor: ActorId, created_at: Timestamp) -> Self {
        Self {
            message_id,
            actor,
            read: false,
            created_at,
        }
    }

    /// 已读标记只能从 false 变为 true
    pub fn mark_read(&mut self) {
        self.read = true;
    }
}

/// 读取端去重：同一 (消息, 参与者) 只保留一条，任一副本已读即视为已读。
/// 返回仍未读的提及，按创建时间排序。
pub fn unread_mentions(mentions: &[Mention]) -> Vec<Mention> {
    let mut merged: HashMap<(MessageId, ActorId), Mention> = HashMap::new();
    for mention in mentions {
        merged
            .entry((mention.message_id, mention.actor))
            .and_modify(|existing| {
                existing.read |= mention.read;
                if mention.created_at < existing.created_at {
                    existing.created_at = mention.created_at;
                }
            })
            .or_insert_with(|| mention.clone());
    }

    let mut unread: Vec<Mention> = merged.into_values().filter(|m| !m.read).collect();
    unread.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    unread
}
