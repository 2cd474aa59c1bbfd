//! 内存实现的后端存储（用于测试和单实例运行）
//!
//! 每次提交后在持有锁的情况下发出变更通知，保证同一话题上的通知顺序与提交顺序一致。
//! 通知失败只记录日志，不影响写入结果。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    tables, ActorId, ChangeEvent, ChangeKind, Mention, Message, MessageId, Reaction, ScoreRow,
    Timestamp, Topic,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::repository::{
    MentionRepository, MessageCounter, MessageRepository, ReactionRepository, RepositoryError,
    ScoreRepository,
};
use crate::transport::Transport;

#[derive(Default)]
struct StoreState {
    next_seq: u64,
    messages: HashMap<MessageId, Message>,
    reactions: Vec<Reaction>,
    mentions: Vec<Mention>,
    scores: HashMap<ActorId, i64>,
    maintenance: bool,
}

pub struct MemoryStore {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// 发放积分，返回新分数
    pub async fn grant_points(&self, actor: ActorId, points: i64) -> i64 {
        let mut state = self.state.lock().await;
        let score = state.scores.entry(actor).or_insert(0);
        *score += points;
        let row = ScoreRow {
            actor,
            score: *score,
        };
        self.notify(Topic::leaderboard(), tables::PROFILES, ChangeKind::Update, &row)
            .await;
        row.score
    }

    /// 切换维护模式开关
    pub async fn set_maintenance(&self, enabled: bool) {
        let mut state = self.state.lock().await;
        state.maintenance = enabled;
        let payload = json!({ "key": "maintenance_mode", "enabled": enabled });
        self.notify(
            Topic::maintenance_flag(),
            tables::APP_SETTINGS,
            ChangeKind::Update,
            &payload,
        )
        .await;
    }

    pub async fn maintenance(&self) -> bool {
        self.state.lock().await.maintenance
    }

    async fn notify<T: Serialize + Sync>(&self, topic: Topic, table: &str, kind: ChangeKind, row: &T) {
        let event = match ChangeEvent::for_row(topic, table, kind, row, self.clock.now()) {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = %err, table, "变更通知序列化失败");
                return;
            }
        };
        if let Err(err) = self.transport.publish(event).await {
            tracing::warn!(error = %err, table, "变更通知发送失败");
        }
    }

    fn topic_of(state: &StoreState, message_id: MessageId) -> Result<Topic, RepositoryError> {
        state
            .messages
            .get(&message_id)
            .map(|m| m.topic.clone())
            .ok_or(RepositoryError::NotFound)
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn save_message(&self, mut message: Message) -> Result<Message, RepositoryError> {
        let mut state = self.state.lock().await;
        if state.messages.contains_key(&message.id) {
            return Err(RepositoryError::storage(format!(
                "duplicate message id {}",
                message.id
            )));
        }
        state.next_seq += 1;
        message.seq = state.next_seq;
        state.messages.insert(message.id, message.clone());

        self.notify(message.topic.clone(), tables::MESSAGES, ChangeKind::Insert, &message)
            .await;
        Ok(message)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        Ok(self.state.lock().await.messages.get(&id).cloned())
    }

    async fn record_edit(
        &self,
        id: MessageId,
        body: String,
        edited_at: Timestamp,
    ) -> Result<Message, RepositoryError> {
        let mut state = self.state.lock().await;
        let message = state.messages.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        message.apply_edit(body, edited_at);
        let updated = message.clone();

        self.notify(updated.topic.clone(), tables::MESSAGES, ChangeKind::Update, &updated)
            .await;
        Ok(updated)
    }

    async fn increment_counter(
        &self,
        id: MessageId,
        counter: MessageCounter,
    ) -> Result<Message, RepositoryError> {
        let mut state = self.state.lock().await;
        let message = state.messages.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        match counter {
            MessageCounter::Likes => message.likes += 1,
            MessageCounter::Views => message.views += 1,
            MessageCounter::Replies => message.reply_count += 1,
        }
        let updated = message.clone();

        self.notify(updated.topic.clone(), tables::MESSAGES, ChangeKind::Update, &updated)
            .await;
        Ok(updated)
    }

    async fn list_thread(&self, parent_id: MessageId) -> Result<Vec<Message>, RepositoryError> {
        let state = self.state.lock().await;
        let mut replies: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.parent_id == Some(parent_id))
            .cloned()
            .collect();
        replies.sort_by(domain::thread_order);
        Ok(replies)
    }

    async fn list_recent(&self, topic: &Topic, limit: usize) -> Result<Vec<Message>, RepositoryError> {
        let state = self.state.lock().await;
        let mut messages: Vec<Message> = state
            .messages
            .values()
            .filter(|m| &m.topic == topic && m.parent_id.is_none())
            .cloned()
            .collect();
        messages.sort_by(|a, b| domain::thread_order(b, a));
        messages.truncate(limit);
        messages.reverse();
        Ok(messages)
    }
}

#[async_trait]
impl ReactionRepository for MemoryStore {
    async fn save_reaction(&self, reaction: Reaction) -> Result<Reaction, RepositoryError> {
        let mut state = self.state.lock().await;
        let topic = Self::topic_of(&state, reaction.message_id)?;
        state.reactions.push(reaction.clone());

        self.notify(topic, tables::REACTIONS, ChangeKind::Insert, &reaction)
            .await;
        Ok(reaction)
    }

    async fn list_reactions(&self, message_id: MessageId) -> Result<Vec<Reaction>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .reactions
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MentionRepository for MemoryStore {
    async fn save_mention(&self, mention: Mention) -> Result<Mention, RepositoryError> {
        let mut state = self.state.lock().await;
        let topic = Self::topic_of(&state, mention.message_id)?;
        state.mentions.push(mention.clone());

        self.notify(topic, tables::MENTIONS, ChangeKind::Insert, &mention)
            .await;
        Ok(mention)
    }

    async fn mark_read(&self, message_id: MessageId, actor: ActorId) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for mention in state
            .mentions
            .iter_mut()
            .filter(|m| m.message_id == message_id && m.actor == actor && !m.read)
        {
            mention.mark_read();
            updated += 1;
        }
        Ok(updated)
    }

    async fn list_mentions(&self, actor: ActorId) -> Result<Vec<Mention>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .mentions
            .iter()
            .filter(|m| m.actor == actor)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ScoreRepository for MemoryStore {
    async fn top_scores(&self, limit: usize) -> Result<Vec<ScoreRow>, RepositoryError> {
        let state = self.state.lock().await;
        let mut rows: Vec<ScoreRow> = state
            .scores
            .iter()
            .map(|(actor, score)| ScoreRow {
                actor: *actor,
                score: *score,
            })
            .collect();
        // ORDER BY score DESC, actor ASC
        rows.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.actor.cmp(&b.actor)));
        rows.truncate(limit);
        Ok(rows)
    }
}
