//! 基于 Redis Pub/Sub 的传输层
//!
//! 每个话题对应一个 Redis 频道，事件以 JSON 形式发布。每个订阅独占一条
//! Pub/Sub 连接，由后台任务读取消息流、按过滤条件分发给处理器；
//! 取消订阅时中止该任务，连接随之关闭。连接断开导致消息流结束时，
//! 订阅从表中移除，租约管理器据此把话题恢复为无租约。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use application::{
    ChangeHandler, SubscriptionHandle, SubscriptionRequest, Transport, TransportError,
};
use async_trait::async_trait;
use domain::{ChangeEvent, ChangeFilter, Topic};
use futures_util::stream::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::redis::{RedisError, RedisResult};
use crate::retry::{retry_async, RetryConfig};

/// 默认频道前缀
pub const DEFAULT_CHANNEL_PREFIX: &str = "realtime:";

/// 订阅名到读取任务的映射
#[derive(Default, Clone)]
struct SubscriptionTable {
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl SubscriptionTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// 名字已被占用时把任务交还调用方
    fn insert(&self, name: String, task: JoinHandle<()>) -> Result<(), JoinHandle<()>> {
        let mut tasks = self.lock();
        if tasks.contains_key(&name) {
            return Err(task);
        }
        tasks.insert(name, task);
        Ok(())
    }

    fn remove(&self, name: &str) -> Option<JoinHandle<()>> {
        self.lock().remove(name)
    }

    /// 任务还在表中且没有结束
    fn is_live(&self, name: &str) -> bool {
        self.lock().get(name).is_some_and(|task| !task.is_finished())
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn abort_all(&self) {
        for (_, task) in self.lock().drain() {
            task.abort();
        }
    }
}

pub struct RedisTransport {
    client: Client,
    publisher: ConnectionManager,
    prefix: String,
    subscriptions: SubscriptionTable,
}

impl RedisTransport {
    /// 连接 Redis，失败时按 `retry` 策略重试
    pub async fn connect(url: &str, prefix: impl Into<String>, retry: &RetryConfig) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let publisher = retry_async(retry, "redis_connect", || {
            ConnectionManager::new(client.clone())
        })
        .await?;
        let prefix = prefix.into();
        info!(prefix = %prefix, "Redis 传输层已连接");

        Ok(Self {
            client,
            publisher,
            prefix,
            subscriptions: SubscriptionTable::default(),
        })
    }

    /// 话题对应的 Redis 频道名
    pub fn channel_for(&self, topic: &Topic) -> String {
        format!("{}{}", self.prefix, topic)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn encode(event: &ChangeEvent) -> RedisResult<String> {
        Ok(serde_json::to_string(event)?)
    }

    fn decode(payload: &str) -> RedisResult<ChangeEvent> {
        Ok(serde_json::from_str(payload)?)
    }

    fn dispatch(name: &str, filter: &ChangeFilter, handler: &ChangeHandler, payload: &str) {
        match Self::decode(payload) {
            Ok(event) if filter.matches(&event) => handler(event),
            Ok(_) => {}
            Err(err) => warn!(subscription = %name, error = %err, "无法解析的变更消息，已丢弃"),
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn subscribe(
        &self,
        request: SubscriptionRequest,
        handler: ChangeHandler,
    ) -> Result<SubscriptionHandle, TransportError> {
        if self.subscriptions.contains(&request.name) {
            return Err(TransportError::subscribe(
                &request.topic,
                format!("subscription name {} already in use", request.name),
            ));
        }

        let channel = self.channel_for(&request.topic);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| TransportError::subscribe(&request.topic, RedisError::from(e).to_string()))?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| TransportError::subscribe(&request.topic, RedisError::from(e).to_string()))?;

        let name = request.name.clone();
        let filter = request.filter;
        let table = self.subscriptions.clone();
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => Self::dispatch(&name, &filter, &handler, &payload),
                    Err(err) => warn!(subscription = %name, error = %err, "读取消息负载失败"),
                }
            }
            // 只有连接断开才会走到这里，主动取消订阅会直接中止任务
            warn!(subscription = %name, "Redis 订阅流意外结束，订阅已失效");
            table.remove(&name);
        });

        if let Err(task) = self.subscriptions.insert(request.name.clone(), task) {
            task.abort();
            return Err(TransportError::subscribe(
                &request.topic,
                format!("subscription name {} already in use", request.name),
            ));
        }
        debug!(subscription = %request.name, channel = %channel, "已订阅 Redis 频道");

        Ok(SubscriptionHandle {
            name: request.name,
            topic: request.topic,
        })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        if let Some(task) = self.subscriptions.remove(&handle.name) {
            task.abort();
            debug!(subscription = %handle.name, "已取消 Redis 订阅");
        }
        Ok(())
    }

    async fn publish(&self, event: ChangeEvent) -> Result<(), TransportError> {
        let channel = self.channel_for(&event.topic);
        let payload =
            Self::encode(&event).map_err(|e| TransportError::publish(&event.topic, e.to_string()))?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(&channel, payload)
            .await
            .map_err(|e| TransportError::publish(&event.topic, RedisError::from(e).to_string()))?;
        debug!(channel = %channel, receivers, "变更事件已发布");
        Ok(())
    }

    async fn is_subscribed(&self, handle: &SubscriptionHandle) -> bool {
        self.subscriptions.is_live(&handle.name)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let mut conn = self.publisher.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }
}

impl Drop for RedisTransport {
    fn drop(&mut self) {
        self.subscriptions.abort_all();
    }
}
