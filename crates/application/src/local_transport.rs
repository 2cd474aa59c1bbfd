// 进程内传输层实现，单实例部署和测试使用
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use domain::{ChangeEvent, Topic};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::transport::{
    ChangeHandler, SubscriptionHandle, SubscriptionRequest, Transport, TransportError,
};

/// 基于 tokio broadcast 的传输层。
///
/// 每个话题一条有序通道，每个订阅一个转发任务，
/// 因此同一话题的投递顺序与发布顺序一致，一个话题的突发流量不会挤掉其他话题的事件。
/// `capacity` 是单个话题的缓冲上限，处理过慢的订阅只会丢失本话题中最旧的事件。
pub struct MemoryTransport {
    capacity: usize,
    channels: Mutex<HashMap<Topic, broadcast::Sender<ChangeEvent>>>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl MemoryTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// 当前存活的订阅数量
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn receiver_for(&self, topic: &Topic) -> broadcast::Receiver<ChangeEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, task) in subscriptions.drain() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(
        &self,
        request: SubscriptionRequest,
        handler: ChangeHandler,
    ) -> Result<SubscriptionHandle, TransportError> {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscriptions.contains_key(&request.name) {
            return Err(TransportError::subscribe(
                &request.topic,
                format!("subscription name {} already in use", request.name),
            ));
        }

        let mut receiver = self.receiver_for(&request.topic);
        let filter = request.filter;
        let name = request.name.clone();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if filter.matches(&event) {
                            handler(event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(subscription = %name, skipped, "订阅处理过慢，丢弃了部分事件");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        subscriptions.insert(request.name.clone(), task);

        Ok(SubscriptionHandle {
            name: request.name,
            topic: request.topic,
        })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        let task = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.name);
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }

    async fn publish(&self, event: ChangeEvent) -> Result<(), TransportError> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = channels.get(&event.topic) else {
            return Ok(());
        };
        if sender.receiver_count() == 0 {
            // 话题上的订阅都已结束
            channels.remove(&event.topic);
            return Ok(());
        }
        sender
            .send(event)
            .map(|_| ())
            .map_err(|err| TransportError::Unavailable(err.to_string()))
    }

    async fn is_subscribed(&self, handle: &SubscriptionHandle) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.name)
            .is_some_and(|task| !task.is_finished())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
