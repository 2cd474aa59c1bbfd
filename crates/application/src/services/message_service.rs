//! 消息扇出服务
//!
//! 写入走仓储，提交后的变更通知由存储通过传输层发出，这里不直接广播。
//! 表情反应和提及只追加，读取时去重。

use std::collections::BTreeSet;
use std::sync::Arc;

use config::RateLimitConfig;
use domain::{
    referenced_actors, summarize_reactions, thread_order, unread_mentions, validate_body, ActionKind, ActorId,
    DomainError, Mention, Message, MessageId, NewMessage, Reaction, ReactionCount, Topic,
};

use crate::{
    clock::Clock,
    error::ApplicationError,
    rate_limiter::{rule_for, RateKey, RateLimitStore},
    repository::{MentionRepository, MessageCounter, MessageRepository, ReactionRepository},
};

pub struct MessageServiceDependencies {
    pub message_repository: Arc<dyn MessageRepository>,
    pub reaction_repository: Arc<dyn ReactionRepository>,
    pub mention_repository: Arc<dyn MentionRepository>,
    pub rate_limiter: Arc<dyn RateLimitStore>,
    pub rate_limits: RateLimitConfig,
    pub clock: Arc<dyn Clock>,
}

pub struct MessageService {
    deps: MessageServiceDependencies,
}

impl MessageService {
    pub fn new(deps: MessageServiceDependencies) -> Self {
        Self { deps }
    }

    /// 检查限流，超限时返回需要等待的时长
    pub async fn enforce_rate_limit(
        &self,
        actor: ActorId,
        action: ActionKind,
    ) -> Result<(), ApplicationError> {
        let rule = rule_for(&self.deps.rate_limits, action);
        let decision = self
            .deps
            .rate_limiter
            .check(&RateKey::new(actor, action), rule)
            .await?;
        if decision.allowed {
            Ok(())
        } else {
            tracing::debug!(actor = %actor, action = %action, retry_after = ?decision.retry_after, "触发限流");
            Err(ApplicationError::RateLimited {
                action,
                retry_after: decision.retry_after,
            })
        }
    }

    async fn require_message(&self, id: MessageId) -> Result<Message, ApplicationError> {
        self.deps
            .message_repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| DomainError::resource_not_found("message", id.to_string()).into())
    }

    pub async fn post(&self, topic: &Topic, new: NewMessage) -> Result<Message, ApplicationError> {
        new.validate()?;

        if let Some(parent_id) = new.parent_id {
            let parent = self.require_message(parent_id).await?;
            if &parent.topic != topic {
                return Err(DomainError::validation_error(
                    "parent_id",
                    "回复必须与父消息在同一话题内",
                )
                .into());
            }
        }

        self.enforce_rate_limit(new.author, ActionKind::Message)
            .await?;

        let mentioned: BTreeSet<ActorId> = new
            .mentions
            .iter()
            .copied()
            .chain(referenced_actors(&new.body))
            .collect();
        let now = self.deps.clock.now();
        let message = Message::from_new(MessageId::generate(), topic.clone(), new, now);
        let stored = self.deps.message_repository.save_message(message).await?;

        // 回复计数和提及与消息属于同一次写入，任一失败都作为写入失败返回
        if let Some(parent_id) = stored.parent_id {
            self.deps
                .message_repository
                .increment_counter(parent_id, MessageCounter::Replies)
                .await
                .inspect_err(|err| {
                    tracing::error!(
                        message_id = %stored.id,
                        parent_id = %parent_id,
                        error = %err,
                        "回复计数更新失败"
                    )
                })?;
        }

        for actor in mentioned {
            let mention = Mention::new(stored.id, actor, now);
            self.deps
                .mention_repository
                .save_mention(mention)
                .await
                .inspect_err(|err| {
                    tracing::error!(
                        message_id = %stored.id,
                        actor = %actor,
                        error = %err,
                        "提及写入失败"
                    )
                })?;
        }

        tracing::debug!(topic = %topic, message_id = %stored.id, author = %stored.author, "消息已发送");
        Ok(stored)
    }

    pub async fn react(
        &self,
        message_id: MessageId,
        emoji: &str,
        actor: ActorId,
    ) -> Result<Reaction, ApplicationError> {
        let reaction = Reaction::new(message_id, emoji, actor, self.deps.clock.now())?;
        self.require_message(message_id).await?;
        self.enforce_rate_limit(actor, ActionKind::Reaction).await?;

        let stored = self.deps.reaction_repository.save_reaction(reaction).await?;
        Ok(stored)
    }

    pub async fn reaction_summary(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<ReactionCount>, ApplicationError> {
        let reactions = self
            .deps
            .reaction_repository
            .list_reactions(message_id)
            .await?;
        Ok(summarize_reactions(&reactions))
    }

    pub async fn mention(
        &self,
        message_id: MessageId,
        actor: ActorId,
    ) -> Result<Mention, ApplicationError> {
        self.require_message(message_id).await?;
        let mention = Mention::new(message_id, actor, self.deps.clock.now());
        Ok(self.deps.mention_repository.save_mention(mention).await?)
    }

    pub async fn mark_mention_read(
        &self,
        message_id: MessageId,
        actor: ActorId,
    ) -> Result<u64, ApplicationError> {
        Ok(self
            .deps
            .mention_repository
            .mark_read(message_id, actor)
            .await?)
    }

    pub async fn unread_mentions(&self, actor: ActorId) -> Result<Vec<Mention>, ApplicationError> {
        let mentions = self.deps.mention_repository.list_mentions(actor).await?;
        Ok(unread_mentions(&mentions))
    }

    /// 某条消息的回复，按 (创建时间, 写入序号) 排序
    pub async fn thread(&self, parent_id: MessageId) -> Result<Vec<Message>, ApplicationError> {
        let mut replies = self.deps.message_repository.list_thread(parent_id).await?;
        replies.sort_by(thread_order);
        Ok(replies)
    }

    /// 只有作者能编辑；id、作者和创建时间保持不变
    pub async fn edit(
        &self,
        message_id: MessageId,
        editor: ActorId,
        body: String,
    ) -> Result<Message, ApplicationError> {
        let message = self.require_message(message_id).await?;
        message.ensure_author(editor)?;
        validate_body(&body, message.media_url.is_some())?;

        let now = self.deps.clock.now();
        Ok(self
            .deps
            .message_repository
            .record_edit(message_id, body, now)
            .await?)
    }

    pub async fn history(&self, topic: &Topic, limit: usize) -> Result<Vec<Message>, ApplicationError> {
        Ok(self
            .deps
            .message_repository
            .list_recent(topic, limit)
            .await?)
    }

    pub async fn record_view(&self, message_id: MessageId) -> Result<Message, ApplicationError> {
        Ok(self
            .deps
            .message_repository
            .increment_counter(message_id, MessageCounter::Views)
            .await?)
    }

    pub async fn like(&self, message_id: MessageId) -> Result<Message, ApplicationError> {
        Ok(self
            .deps
            .message_repository
            .increment_counter(message_id, MessageCounter::Likes)
            .await?)
    }
}
