use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lease::ChannelLeaseManager;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Degraded,
}

/// 周期性探测传输层连通性，与用户操作无关。
/// 绑定租约管理器后同时清理已失效的订阅，有订阅失效的那一轮视为降级。
pub struct ConnectivityMonitor {
    transport: Arc<dyn Transport>,
    leases: Option<Arc<ChannelLeaseManager>>,
    interval: Duration,
    state: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(transport: Arc<dyn Transport>, interval: Duration) -> Self {
        let (state, _) = watch::channel(Connectivity::Connected);
        Self {
            transport,
            leases: None,
            interval,
            state,
        }
    }

    pub fn with_leases(mut self, leases: Arc<ChannelLeaseManager>) -> Self {
        self.leases = Some(leases);
        self
    }

    /// 探测一次，只在状态变化时记录日志
    pub async fn check_once(&self) -> Connectivity {
        let mut next = match self.transport.ping().await {
            Ok(()) => Connectivity::Connected,
            Err(err) => {
                tracing::debug!(error = %err, "连通性探测失败");
                Connectivity::Degraded
            }
        };
        if let Some(leases) = &self.leases {
            let dropped = leases.prune_dropped().await;
            if !dropped.is_empty() {
                tracing::warn!(topics = ?dropped, "部分订阅已失效");
                next = Connectivity::Degraded;
            }
        }

        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            match next {
                Connectivity::Connected => tracing::info!("传输层连接已恢复"),
                Connectivity::Degraded => tracing::warn!("传输层连接异常"),
            }
        }
        next
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.check_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::transport::{MockTransport, SubscriptionHandle, TransportError};
    use domain::{ActorId, ChangeFilter, Topic};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn reports_transitions() {
        let healthy = Arc::new(AtomicBool::new(true));
        let flag = healthy.clone();
        let mut transport = MockTransport::new();
        transport.expect_ping().returning(move || {
            if flag.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(TransportError::Unavailable("connection reset".into()))
            }
        });

        let monitor = ConnectivityMonitor::new(Arc::new(transport), Duration::from_secs(15));
        let mut updates = monitor.subscribe();

        assert_eq!(monitor.check_once().await, Connectivity::Connected);
        assert!(!updates.has_changed().unwrap());

        healthy.store(false, Ordering::SeqCst);
        assert_eq!(monitor.check_once().await, Connectivity::Degraded);
        assert!(updates.has_changed().unwrap());
        assert_eq!(*updates.borrow_and_update(), Connectivity::Degraded);

        healthy.store(true, Ordering::SeqCst);
        monitor.check_once().await;
        assert_eq!(monitor.current(), Connectivity::Connected);
    }

    #[tokio::test]
    async fn dropped_subscription_degrades_and_unleases_topic() {
        let alive = Arc::new(AtomicBool::new(true));
        let flag = alive.clone();
        let mut transport = MockTransport::new();
        transport.expect_ping().returning(|| Ok(()));
        transport.expect_subscribe().returning(|request, _| {
            Ok(SubscriptionHandle {
                name: request.name,
                topic: request.topic,
            })
        });
        transport
            .expect_is_subscribed()
            .returning(move |_| flag.load(Ordering::SeqCst));
        transport.expect_unsubscribe().returning(|_| Ok(()));
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let leases = Arc::new(ChannelLeaseManager::new(
            ActorId::from(uuid::Uuid::new_v4()),
            transport.clone(),
            Arc::new(SystemClock),
        ));
        leases
            .acquire(Topic::leaderboard(), ChangeFilter::all(), || Arc::new(|_| {}))
            .await
            .unwrap();
        let monitor = ConnectivityMonitor::new(transport, Duration::from_secs(15))
            .with_leases(leases.clone());

        assert_eq!(monitor.check_once().await, Connectivity::Connected);
        assert!(leases.is_leased(&Topic::leaderboard()).await);

        alive.store(false, Ordering::SeqCst);
        assert_eq!(monitor.check_once().await, Connectivity::Degraded);
        assert!(!leases.is_leased(&Topic::leaderboard()).await);

        // 失效租约已移除，下一轮恢复正常
        assert_eq!(monitor.check_once().await, Connectivity::Connected);
    }
}
