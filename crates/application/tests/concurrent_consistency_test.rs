//! 并发数据一致性测试
//!
//! 验证限流窗口和频道租约在并发访问下保持一致

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use application::{
    ChangeHandler, ChannelLeaseManager, MemoryTransport, RateKey, RateLimitStore, RateLimiter,
    SystemClock, Transport,
};
use config::RateRule;
use domain::{tables, ActionKind, ActorId, ChangeEvent, ChangeFilter, ChangeKind, Topic};
use futures::future::join_all;
use serde_json::json;
use uuid::Uuid;

/// 同一个键上的并发检查，放行次数恰好等于上限
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rate_checks_never_exceed_max() {
    let limiter = Arc::new(RateLimiter::new(Arc::new(SystemClock)));
    let key = RateKey::new(ActorId::from(Uuid::new_v4()), ActionKind::TaskSubmission);
    let rule = RateRule::new(5, 60_000);

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check(&key, rule).await })
        })
        .collect();

    let allowed = join_all(tasks)
        .await
        .into_iter()
        .filter(|result| matches!(result, Ok(Ok(decision)) if decision.allowed))
        .count();

    assert_eq!(allowed, 5);
    assert_eq!(limiter.window(&key).map(|w| w.count), Some(5));
}

/// 不同参与者互不影响
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_actors_have_independent_windows() {
    let limiter = Arc::new(RateLimiter::new(Arc::new(SystemClock)));
    let actors: Vec<ActorId> = (0..10).map(|_| ActorId::from(Uuid::new_v4())).collect();

    let tasks: Vec<_> = actors
        .iter()
        .flat_map(|&actor| {
            (0..3).map(move |_| RateKey::new(actor, ActionKind::Message))
        })
        .map(|key| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.is_allowed(&key, 3, Duration::from_secs(60)) })
        })
        .collect();

    let results = join_all(tasks).await;
    assert!(results.into_iter().all(|r| matches!(r, Ok(true))));
    assert_eq!(limiter.len(), actors.len());
}

/// 并发获取同一话题，最终只保留一个订阅
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_keeps_single_lease() {
    let transport = Arc::new(MemoryTransport::default());
    let leases = Arc::new(ChannelLeaseManager::new(
        ActorId::from(Uuid::new_v4()),
        transport.clone(),
        Arc::new(SystemClock),
    ));
    let topic = Topic::room(Uuid::new_v4());
    let delivered = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let leases = leases.clone();
            let topic = topic.clone();
            let delivered = delivered.clone();
            tokio::spawn(async move {
                leases
                    .acquire(topic, ChangeFilter::all(), move || -> ChangeHandler {
                        Arc::new(move |_event| {
                            delivered.fetch_add(1, Ordering::SeqCst);
                        })
                    })
                    .await
            })
        })
        .collect();

    let names: Vec<String> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.expect("task panicked").expect("acquire failed").name)
        .collect();
    let unique: std::collections::HashSet<&String> = names.iter().collect();
    assert_eq!(unique.len(), names.len(), "lease names must be unique");

    assert_eq!(leases.len().await, 1);
    assert_eq!(transport.subscription_count(), 1);

    let event = ChangeEvent::new(
        topic.clone(),
        tables::MESSAGES,
        ChangeKind::Insert,
        json!({}),
        chrono::Utc::now(),
    );
    transport.publish(event).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}
