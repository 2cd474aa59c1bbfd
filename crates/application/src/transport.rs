//! 发布/订阅传输层接口
//!
//! 后端存储提交写入后通过传输层推送 [`ChangeEvent`]；在线状态等瞬时信号也走同一通道。

use std::sync::Arc;

use async_trait::async_trait;
use domain::{ChangeEvent, ChangeFilter, Topic};
use thiserror::Error;

/// 变更处理器。在事件循环上同步执行，不能阻塞，耗时工作需要自行派发。
pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// 全局唯一的订阅名
    pub name: String,
    pub topic: Topic,
    pub filter: ChangeFilter,
}

/// 传输层返回的订阅句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub name: String,
    pub topic: Topic,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("subscribe to {topic} failed: {message}")]
    Subscribe { topic: Topic, message: String },
    #[error("unsubscribe {name} failed: {message}")]
    Unsubscribe { name: String, message: String },
    #[error("publish to {topic} failed: {message}")]
    Publish { topic: Topic, message: String },
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    pub fn subscribe(topic: &Topic, message: impl Into<String>) -> Self {
        Self::Subscribe {
            topic: topic.clone(),
            message: message.into(),
        }
    }

    pub fn publish(topic: &Topic, message: impl Into<String>) -> Self {
        Self::Publish {
            topic: topic.clone(),
            message: message.into(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// 建立订阅，之后该话题上匹配过滤条件的事件按提交顺序交给处理器
    async fn subscribe(
        &self,
        request: SubscriptionRequest,
        handler: ChangeHandler,
    ) -> Result<SubscriptionHandle, TransportError>;

    /// 取消订阅。对不存在的句柄调用不是错误。
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), TransportError>;

    async fn publish(&self, event: ChangeEvent) -> Result<(), TransportError>;

    /// 订阅是否仍在投递。连接断开后订阅会失效，需要重新获取。
    async fn is_subscribed(&self, handle: &SubscriptionHandle) -> bool;

    /// 连通性探测
    async fn ping(&self) -> Result<(), TransportError>;
}
