//! 通过 Redis 在两个独立实例之间传播变更
//!
//! 需要本地 Redis：REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored

use std::time::Duration;

use config::{RateLimitBackend, RateRule, RealtimeConfig, TransportKind};
use domain::{tables, ActionKind, ActorId, ChangeFilter, ChangeKind, Message, NewMessage, Topic};
use infrastructure::Infrastructure;
use uuid::Uuid;

fn redis_config() -> RealtimeConfig {
    let mut config = RealtimeConfig::default();
    config.transport.kind = TransportKind::Redis;
    config.transport.redis_url =
        Some(std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()));
    config.rate_limits.backend = RateLimitBackend::Redis;
    config
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_messages_cross_instances() {
    let writer = Infrastructure::connect(redis_config()).await.unwrap();
    let reader = Infrastructure::connect(redis_config()).await.unwrap();
    let room = Topic::room(Uuid::new_v4());

    let listener = reader.session(ActorId::from(Uuid::new_v4()));
    let mut channel = listener
        .acquire_channel(
            room.clone(),
            ChangeFilter::table(tables::MESSAGES).with_kind(ChangeKind::Insert),
        )
        .await
        .unwrap();

    let author = writer.session(ActorId::from(Uuid::new_v4()));
    let posted = author
        .post_message(&room, NewMessage::text(author.actor(), "across the wire"))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(3), channel.events.recv())
        .await
        .expect("no event from redis")
        .unwrap();
    assert_eq!(event.decode::<Message>().unwrap().id, posted.id);

    listener.shutdown().await;
    author.shutdown().await;
}

#[tokio::test]
#[ignore = "requires redis"]
async fn test_rate_window_is_shared_across_instances() {
    let mut config = redis_config();
    config.rate_limits.resend = RateRule::new(1, 60_000);
    let first = Infrastructure::connect(config.clone()).await.unwrap();
    let second = Infrastructure::connect(config).await.unwrap();
    let actor = ActorId::from(Uuid::new_v4());

    let a = first.session(actor);
    let b = second.session(actor);
    assert!(a.try_submit(actor, ActionKind::Resend).await.unwrap().allowed);
    let denied = b.try_submit(actor, ActionKind::Resend).await.unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after > Duration::ZERO);
}
