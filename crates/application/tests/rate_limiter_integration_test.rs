use std::sync::Arc;
use std::time::Duration;

use application::{
    ApplicationError, ManualClock, MemoryStore, MemoryTransport, RateLimitStore, RateLimiter,
    RealtimeSession, RemoteError, RemoteInvoker, SessionDependencies,
};
use async_trait::async_trait;
use config::{RateRule, RealtimeConfig};
use domain::{ActionKind, ActorId, NewMessage, Topic};
use uuid::Uuid;

struct NoopRemote;

#[async_trait]
impl RemoteInvoker for NoopRemote {
    async fn invoke(
        &self,
        _service: &str,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, RemoteError> {
        Ok(serde_json::json!({ "risk_score": 0.0 }))
    }
}

fn session_with(
    config: RealtimeConfig,
    clock: Arc<ManualClock>,
    store: Option<Arc<dyn RateLimitStore>>,
) -> RealtimeSession {
    let transport = Arc::new(MemoryTransport::default());
    let backing = Arc::new(MemoryStore::new(transport.clone(), clock.clone()));
    RealtimeSession::new(SessionDependencies {
        actor: ActorId::from(Uuid::new_v4()),
        transport,
        message_repository: backing.clone(),
        reaction_repository: backing.clone(),
        mention_repository: backing.clone(),
        score_repository: backing,
        remote: Arc::new(NoopRemote),
        rate_limit_store: store,
        clock,
        config,
    })
}

#[tokio::test]
async fn test_task_submission_window() {
    let mut config = RealtimeConfig::default();
    config.rate_limits.task_submission = RateRule::new(3, 60_000);
    let clock = Arc::new(ManualClock::default());
    let session = session_with(config, clock.clone(), None);
    let actor = session.actor();

    for i in 0..3 {
        let decision = session
            .try_submit(actor, ActionKind::TaskSubmission)
            .await
            .unwrap();
        assert!(decision.allowed, "submission {} should be allowed", i + 1);
    }

    let denied = session
        .try_submit(actor, ActionKind::TaskSubmission)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Duration::from_secs(60));

    clock.advance(Duration::from_secs(20));
    let still_denied = session
        .try_submit(actor, ActionKind::TaskSubmission)
        .await
        .unwrap();
    assert!(!still_denied.allowed);
    assert!(still_denied.retry_after < denied.retry_after);

    clock.advance(Duration::from_secs(40));
    let reopened = session
        .try_submit(actor, ActionKind::TaskSubmission)
        .await
        .unwrap();
    assert!(reopened.allowed);
}

#[tokio::test]
async fn test_message_posts_share_the_session_limiter() {
    let mut config = RealtimeConfig::default();
    config.rate_limits.message = RateRule::new(1, 30_000);
    let clock = Arc::new(ManualClock::default());
    let session = session_with(config, clock, None);
    let room = Topic::room(Uuid::new_v4());
    let actor = session.actor();

    session
        .post_message(&room, NewMessage::text(actor, "first"))
        .await
        .unwrap();

    // 预检查和实际发送使用同一个窗口
    let decision = session.try_submit(actor, ActionKind::Message).await.unwrap();
    assert!(!decision.allowed);

    let err = session
        .post_message(&room, NewMessage::text(actor, "second"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ApplicationError::RateLimited {
            action: ActionKind::Message,
            ..
        }
    ));
}

#[tokio::test]
async fn test_injected_store_replaces_session_limiter() {
    let clock = Arc::new(ManualClock::default());
    let shared = Arc::new(RateLimiter::new(clock.clone()));
    let mut config = RealtimeConfig::default();
    config.rate_limits.resend = RateRule::new(1, 300_000);

    // 两个会话共享同一个限流存储
    let store: Arc<dyn RateLimitStore> = shared.clone();
    let first = session_with(config.clone(), clock.clone(), Some(store.clone()));
    let second = session_with(config, clock, Some(store));
    let actor = ActorId::from(Uuid::new_v4());

    assert!(first.try_submit(actor, ActionKind::Resend).await.unwrap().allowed);
    assert!(!second.try_submit(actor, ActionKind::Resend).await.unwrap().allowed);
    assert_eq!(shared.len(), 1);
}
