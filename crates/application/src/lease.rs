//! 频道租约管理
//!
//! 每个话题同一时刻最多持有一个订阅。重新获取时先释放旧订阅再建立新订阅，
//! 整个过程在租约表写锁内完成，不会出现新旧订阅并存。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use domain::{ActorId, ChangeEvent, ChangeFilter, Timestamp, Topic};
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::transport::{
    ChangeHandler, SubscriptionHandle, SubscriptionRequest, Transport, TransportError,
};

/// 租约的只读描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    pub topic: Topic,
    /// 本次获取生成的唯一订阅名
    pub name: String,
    pub acquired_at: Timestamp,
}

struct Lease {
    info: LeaseInfo,
    handle: SubscriptionHandle,
    live: Arc<AtomicBool>,
}

impl Lease {
    // 释放后迟到的事件直接丢弃
    fn revoke(&self) {
        self.live.store(false, Ordering::Release);
    }
}

/// 批量释放的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: usize,
    pub failed: usize,
}

pub struct ChannelLeaseManager {
    actor: ActorId,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    leases: RwLock<HashMap<Topic, Lease>>,
}

impl ChannelLeaseManager {
    pub fn new(actor: ActorId, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            actor,
            transport,
            clock,
            leases: RwLock::new(HashMap::new()),
        }
    }

    /// 获取话题租约。
    ///
    /// 已有租约时先释放（失败只记录日志），再用 `factory` 生成处理器并订阅。
    /// 订阅失败时话题保持无租约状态，下次获取会重试。
    pub async fn acquire<F>(
        &self,
        topic: Topic,
        filter: ChangeFilter,
        factory: F,
    ) -> Result<LeaseInfo, TransportError>
    where
        F: FnOnce() -> ChangeHandler + Send,
    {
        let mut leases = self.leases.write().await;

        if let Some(previous) = leases.remove(&topic) {
            previous.revoke();
            if let Err(err) = self.transport.unsubscribe(&previous.handle).await {
                tracing::warn!(topic = %topic, lease = %previous.info.name, error = %err, "释放旧租约失败");
            } else {
                tracing::debug!(topic = %topic, lease = %previous.info.name, "替换已有租约");
            }
        }

        let acquired_at = self.clock.now();
        let name = self.lease_name(&topic, acquired_at);
        let live = Arc::new(AtomicBool::new(true));
        let handler = guarded(factory(), live.clone());

        let request = SubscriptionRequest {
            name: name.clone(),
            topic: topic.clone(),
            filter,
        };
        let handle = match self.transport.subscribe(request, handler).await {
            Ok(handle) => handle,
            Err(err) => {
                live.store(false, Ordering::Release);
                tracing::warn!(topic = %topic, error = %err, "订阅失败，话题保持无租约");
                return Err(err);
            }
        };

        let info = LeaseInfo {
            topic: topic.clone(),
            name,
            acquired_at,
        };
        leases.insert(
            topic.clone(),
            Lease {
                info: info.clone(),
                handle,
                live,
            },
        );
        tracing::info!(topic = %topic, lease = %info.name, "获取频道租约");
        Ok(info)
    }

    /// 释放租约，返回是否真的持有过。重复调用不是错误。
    pub async fn release(&self, topic: &Topic) -> Result<bool, TransportError> {
        let mut leases = self.leases.write().await;
        let Some(lease) = leases.remove(topic) else {
            return Ok(false);
        };
        lease.revoke();
        self.transport.unsubscribe(&lease.handle).await?;
        tracing::info!(topic = %topic, lease = %lease.info.name, "释放频道租约");
        Ok(true)
    }

    /// 释放全部租约，单个失败只记录日志并继续
    pub async fn release_all(&self) -> ReleaseReport {
        let mut leases = self.leases.write().await;
        let mut report = ReleaseReport::default();

        for (topic, lease) in leases.drain() {
            lease.revoke();
            match self.transport.unsubscribe(&lease.handle).await {
                Ok(()) => report.released += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(topic = %topic, lease = %lease.info.name, error = %err, "释放租约失败");
                }
            }
        }

        if report.released + report.failed > 0 {
            tracing::info!(released = report.released, failed = report.failed, "释放全部频道租约");
        }
        report
    }

    /// 移除传输层已不再投递的租约（例如连接断开），返回受影响的话题。
    /// 这些话题之后视为无租约，下次获取会重新订阅。
    pub async fn prune_dropped(&self) -> Vec<Topic> {
        let mut leases = self.leases.write().await;
        let mut dropped = Vec::new();
        for (topic, lease) in leases.iter() {
            if !self.transport.is_subscribed(&lease.handle).await {
                dropped.push(topic.clone());
            }
        }
        for topic in &dropped {
            if let Some(lease) = leases.remove(topic) {
                lease.revoke();
                // 失效订阅可能仍留在传输层的表里
                if let Err(err) = self.transport.unsubscribe(&lease.handle).await {
                    tracing::debug!(topic = %topic, error = %err, "清理失效订阅失败");
                }
                tracing::warn!(topic = %topic, lease = %lease.info.name, "订阅已失效，话题恢复为无租约");
            }
        }
        dropped.sort();
        dropped
    }

    pub async fn is_leased(&self, topic: &Topic) -> bool {
        self.leases.read().await.contains_key(topic)
    }

    pub async fn lease(&self, topic: &Topic) -> Option<LeaseInfo> {
        self.leases.read().await.get(topic).map(|l| l.info.clone())
    }

    pub async fn active_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.leases.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub async fn len(&self) -> usize {
        self.leases.read().await.len()
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    fn lease_name(&self, topic: &Topic, at: Timestamp) -> String {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        format!("{}:{}:{}:{}", topic, self.actor, at.timestamp_millis(), suffix)
    }
}

fn guarded(inner: ChangeHandler, live: Arc<AtomicBool>) -> ChangeHandler {
    Arc::new(move |event: ChangeEvent| {
        if live.load(Ordering::Acquire) {
            inner(event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::local_transport::MemoryTransport;
    use crate::transport::MockTransport;
    use chrono::Utc;
    use domain::{tables, ChangeKind};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use uuid::Uuid;

    fn counting_handler(counter: Arc<AtomicUsize>) -> impl FnOnce() -> ChangeHandler + Send {
        move || {
            Arc::new(move |_event: ChangeEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    fn manager(transport: Arc<dyn Transport>) -> ChannelLeaseManager {
        ChannelLeaseManager::new(
            ActorId::from(Uuid::new_v4()),
            transport,
            Arc::new(SystemClock),
        )
    }

    async fn publish(transport: &MemoryTransport, topic: &Topic) {
        let event = ChangeEvent::new(topic.clone(), tables::PROFILES, ChangeKind::Update, json!({}), Utc::now());
        transport.publish(event).await.unwrap();
    }

    #[tokio::test]
    async fn reacquire_replaces_previous_subscription() {
        let transport = Arc::new(MemoryTransport::default());
        let leases = manager(transport.clone());
        let topic = Topic::leaderboard();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let a = leases
            .acquire(topic.clone(), ChangeFilter::all(), counting_handler(first.clone()))
            .await
            .unwrap();
        let b = leases
            .acquire(topic.clone(), ChangeFilter::all(), counting_handler(second.clone()))
            .await
            .unwrap();

        assert_ne!(a.name, b.name);
        assert!(b.name.starts_with(&format!("leaderboard:{}:", leases.actor())));
        assert_eq!(transport.subscription_count(), 1);
        assert_eq!(leases.len().await, 1);

        publish(&transport, &topic).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let transport = Arc::new(MemoryTransport::default());
        let leases = manager(transport.clone());
        let topic = Topic::maintenance_flag();

        assert!(!leases.release(&topic).await.unwrap());

        leases
            .acquire(topic.clone(), ChangeFilter::all(), || Arc::new(|_| {}))
            .await
            .unwrap();
        assert!(leases.is_leased(&topic).await);
        assert!(leases.release(&topic).await.unwrap());
        assert!(!leases.release(&topic).await.unwrap());
        assert_eq!(transport.subscription_count(), 0);
    }

    #[tokio::test]
    async fn releasing_unheld_topic_leaves_others_alone() {
        let transport = Arc::new(MemoryTransport::default());
        let leases = manager(transport.clone());
        let held = Topic::room(Uuid::new_v4());
        let never_held = Topic::room(Uuid::new_v4());
        let delivered = Arc::new(AtomicUsize::new(0));

        let info = leases
            .acquire(held.clone(), ChangeFilter::all(), counting_handler(delivered.clone()))
            .await
            .unwrap();

        assert!(!leases.release(&never_held).await.unwrap());
        assert!(leases.is_leased(&held).await);
        assert_eq!(leases.lease(&held).await, Some(info));
        assert_eq!(transport.subscription_count(), 1);

        publish(&transport, &held).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned_and_reacquired() {
        let alive = Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));
        let mut transport = MockTransport::new();
        let subscribed = alive.clone();
        transport.expect_subscribe().returning(move |request, _| {
            subscribed.lock().unwrap().insert(request.name.clone());
            Ok(SubscriptionHandle {
                name: request.name,
                topic: request.topic,
            })
        });
        let checked = alive.clone();
        transport
            .expect_is_subscribed()
            .returning(move |handle| checked.lock().unwrap().contains(&handle.name));
        transport.expect_unsubscribe().returning(|_| Ok(()));
        let leases = manager(Arc::new(transport));

        let room = Topic::room(Uuid::new_v4());
        let first = leases
            .acquire(room.clone(), ChangeFilter::all(), || Arc::new(|_| {}))
            .await
            .unwrap();
        leases
            .acquire(Topic::leaderboard(), ChangeFilter::all(), || Arc::new(|_| {}))
            .await
            .unwrap();
        assert!(leases.prune_dropped().await.is_empty());

        // 连接断开，房间订阅失效
        alive.lock().unwrap().remove(&first.name);
        assert_eq!(leases.prune_dropped().await, vec![room.clone()]);
        assert!(!leases.is_leased(&room).await);
        assert!(leases.is_leased(&Topic::leaderboard()).await);

        let second = leases
            .acquire(room.clone(), ChangeFilter::all(), || Arc::new(|_| {}))
            .await
            .unwrap();
        assert_ne!(second.name, first.name);
        assert!(leases.prune_dropped().await.is_empty());
    }

    #[tokio::test]
    async fn failed_subscribe_leaves_topic_unleased() {
        let mut transport = MockTransport::new();
        transport
            .expect_subscribe()
            .returning(|request, _| Err(TransportError::subscribe(&request.topic, "refused")));
        let leases = manager(Arc::new(transport));

        let result = leases
            .acquire(Topic::leaderboard(), ChangeFilter::all(), || Arc::new(|_| {}))
            .await;
        assert!(result.is_err());
        assert!(!leases.is_leased(&Topic::leaderboard()).await);
        assert!(leases.active_topics().await.is_empty());
    }

    #[tokio::test]
    async fn release_all_continues_past_failures() {
        let mut transport = MockTransport::new();
        transport.expect_subscribe().returning(|request, _| {
            Ok(SubscriptionHandle {
                name: request.name,
                topic: request.topic,
            })
        });
        transport.expect_unsubscribe().returning(|handle| {
            if handle.topic == Topic::leaderboard() {
                Err(TransportError::Unavailable("socket closed".into()))
            } else {
                Ok(())
            }
        });
        let leases = manager(Arc::new(transport));

        for topic in [
            Topic::leaderboard(),
            Topic::maintenance_flag(),
            Topic::room(Uuid::new_v4()),
        ] {
            leases
                .acquire(topic, ChangeFilter::all(), || Arc::new(|_| {}))
                .await
                .unwrap();
        }

        let report = leases.release_all().await;
        assert_eq!(report, ReleaseReport { released: 2, failed: 1 });
        assert_eq!(leases.len().await, 0);
        assert_eq!(leases.release_all().await, ReleaseReport::default());
    }

    #[tokio::test]
    async fn late_delivery_after_release_is_dropped() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let captured: Arc<std::sync::Mutex<Option<ChangeHandler>>> = Arc::default();

        let mut transport = MockTransport::new();
        let slot = captured.clone();
        transport.expect_subscribe().returning(move |request, handler| {
            *slot.lock().unwrap() = Some(handler);
            Ok(SubscriptionHandle {
                name: request.name,
                topic: request.topic,
            })
        });
        transport.expect_unsubscribe().returning(|_| Ok(()));
        let leases = manager(Arc::new(transport));
        let topic = Topic::leaderboard();

        leases
            .acquire(topic.clone(), ChangeFilter::all(), counting_handler(delivered.clone()))
            .await
            .unwrap();
        let handler = captured.lock().unwrap().clone().unwrap();
        let event = ChangeEvent::new(topic.clone(), tables::PROFILES, ChangeKind::Update, json!({}), Utc::now());

        handler(event.clone());
        leases.release(&topic).await.unwrap();
        handler(event);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
