use async_trait::async_trait;
use domain::{
    ActorId, Mention, Message, MessageId, Reaction, ScoreRow, Timestamp, Topic,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

/// 可原子递增的消息计数器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCounter {
    Likes,
    Views,
    Replies,
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    // 保存消息并分配写入序号，提交后由存储发出变更通知
    async fn save_message(&self, message: Message) -> Result<Message, RepositoryError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;

    // 就地更新正文、编辑次数和编辑时间
    async fn record_edit(
        &self,
        id: MessageId,
        body: String,
        edited_at: Timestamp,
    ) -> Result<Message, RepositoryError>;

    async fn increment_counter(
        &self,
        id: MessageId,
        counter: MessageCounter,
    ) -> Result<Message, RepositoryError>;

    // 某条消息下的全部回复
    async fn list_thread(&self, parent_id: MessageId) -> Result<Vec<Message>, RepositoryError>;

    // 话题内最近的消息（不含回复）
    async fn list_recent(&self, topic: &Topic, limit: usize) -> Result<Vec<Message>, RepositoryError>;
}

#[async_trait]
pub trait ReactionRepository: Send + Sync {
    async fn save_reaction(&self, reaction: Reaction) -> Result<Reaction, RepositoryError>;

    async fn list_reactions(&self, message_id: MessageId) -> Result<Vec<Reaction>, RepositoryError>;
}

#[async_trait]
pub trait MentionRepository: Send + Sync {
    async fn save_mention(&self, mention: Mention) -> Result<Mention, RepositoryError>;

    /// 返回被标记的行数
    async fn mark_read(&self, message_id: MessageId, actor: ActorId) -> Result<u64, RepositoryError>;

    async fn list_mentions(&self, actor: ActorId) -> Result<Vec<Mention>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScoreRepository: Send + Sync {
    /// 服务端聚合：按分数降序取前 N 名
    async fn top_scores(&self, limit: usize) -> Result<Vec<ScoreRow>, RepositoryError>;
}
