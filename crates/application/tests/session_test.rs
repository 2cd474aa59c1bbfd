//! 会话级端到端测试：内存传输层 + 内存存储

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use application::{
    MemoryStore, MemoryTransport, RealtimeSession, RemoteError, RemoteInvoker,
    SessionDependencies, SystemClock,
};
use async_trait::async_trait;
use config::RealtimeConfig;
use domain::{tables, ActorId, ChangeFilter, ChangeKind, Message, NewMessage, Topic};
use uuid::Uuid;

#[derive(Default)]
struct CountingRemote {
    calls: AtomicUsize,
}

#[async_trait]
impl RemoteInvoker for CountingRemote {
    async fn invoke(
        &self,
        _service: &str,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "risk_score": 0.3, "flagged": false }))
    }
}

struct Harness {
    transport: Arc<MemoryTransport>,
    store: Arc<MemoryStore>,
    remote: Arc<CountingRemote>,
    session: RealtimeSession,
}

fn harness() -> Harness {
    let clock = Arc::new(SystemClock);
    let transport = Arc::new(MemoryTransport::default());
    let store = Arc::new(MemoryStore::new(transport.clone(), clock.clone()));
    let remote = Arc::new(CountingRemote::default());
    let session = RealtimeSession::new(SessionDependencies {
        actor: ActorId::from(Uuid::new_v4()),
        transport: transport.clone(),
        message_repository: store.clone(),
        reaction_repository: store.clone(),
        mention_repository: store.clone(),
        score_repository: store.clone(),
        remote: remote.clone(),
        rate_limit_store: None,
        clock,
        config: RealtimeConfig::default(),
    });
    Harness {
        transport,
        store,
        remote,
        session,
    }
}

#[tokio::test(start_paused = true)]
async fn test_leaderboard_follows_score_changes() {
    let h = harness();
    h.session.start().await;
    let mut standings = h.leaderboard_updates();

    let low = ActorId::from(Uuid::from_u128(3));
    let tied_b = ActorId::from(Uuid::from_u128(2));
    let tied_a = ActorId::from(Uuid::from_u128(1));
    h.store.grant_points(low, 10).await;
    h.store.grant_points(tied_b, 30).await;
    h.store.grant_points(tied_a, 30).await;

    tokio::time::timeout(Duration::from_secs(5), standings.changed())
        .await
        .expect("leaderboard never republished")
        .unwrap();

    let ranked: Vec<(ActorId, u32, i64)> = h
        .session
        .current_leaderboard()
        .iter()
        .map(|e| (e.actor, e.rank, e.score))
        .collect();
    assert_eq!(
        ranked,
        vec![(tied_a, 1, 30), (tied_b, 2, 30), (low, 3, 10)]
    );
    // 首次加载一次，三次变更合并为一次
    assert_eq!(h.session.leaderboard().recompute_count(), 2);
}

impl Harness {
    fn leaderboard_updates(&self) -> tokio::sync::watch::Receiver<application::Standings> {
        let mut rx = self.session.leaderboard().subscribe();
        rx.borrow_and_update();
        rx
    }
}

#[tokio::test]
async fn test_maintenance_flag_is_mirrored() {
    let h = harness();
    h.session.start().await;
    let mut flag = h.session.maintenance();
    assert!(!h.session.is_maintenance());

    h.store.set_maintenance(true).await;
    tokio::time::timeout(Duration::from_secs(1), flag.changed())
        .await
        .expect("maintenance flag never arrived")
        .unwrap();
    assert!(*flag.borrow());
    assert!(h.session.is_maintenance());
}

#[tokio::test]
async fn test_live_channel_delivers_inserts_in_commit_order() {
    let h = harness();
    let room = Topic::room(Uuid::new_v4());
    let mut channel = h
        .session
        .acquire_channel(
            room.clone(),
            ChangeFilter::table(tables::MESSAGES).with_kind(ChangeKind::Insert),
        )
        .await
        .unwrap();

    let author = h.session.actor();
    let mut posted = Vec::new();
    for body in ["one", "two", "three"] {
        let message = h
            .session
            .post_message(&room, NewMessage::text(author, body))
            .await
            .unwrap();
        posted.push(message.id);
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(1), channel.events.recv())
            .await
            .unwrap()
            .unwrap();
        received.push(event.decode::<Message>().unwrap().id);
    }
    assert_eq!(received, posted);
}

#[tokio::test]
async fn test_replies_and_reactions_through_session() {
    let h = harness();
    let room = Topic::room(Uuid::new_v4());
    let author = h.session.actor();

    let parent = h
        .session
        .post_message(&room, NewMessage::text(author, "gm"))
        .await
        .unwrap();
    let other = ActorId::from(Uuid::new_v4());
    for body in ["a", "b"] {
        h.session
            .post_message(&room, NewMessage::text(other, body).reply_to(parent.id))
            .await
            .unwrap();
    }

    let history = h.session.messages().history(&room, 10).await.unwrap();
    assert_eq!(history[0].reply_count, 2);
    let thread = h.session.messages().thread(parent.id).await.unwrap();
    assert_eq!(
        thread.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
        vec!["a", "b"]
    );

    h.session.react_to_message(parent.id, "🎉").await.unwrap();
    h.session.react_to_message(parent.id, "🎉").await.unwrap();
    let summary = h.session.messages().reaction_summary(parent.id).await.unwrap();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].count, 1);

    h.session.mention_actor(parent.id, other).await.unwrap();
    assert_eq!(h.session.messages().unread_mentions(other).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_own_post_stops_typing() {
    let h = harness();
    let room = Topic::room(Uuid::new_v4());
    let actor = h.session.actor();

    h.session.presence().enter(&room, None).await.unwrap();
    h.session.presence().keystroke(&room).await.unwrap();
    assert_eq!(h.session.presence().typing_actors(&room), vec![actor]);

    h.session
        .post_message(&room, NewMessage::text(actor, "done typing"))
        .await
        .unwrap();
    assert!(h.session.presence().typing_actors(&room).is_empty());
    assert_eq!(h.session.current_presence(&room).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fraud_triggers_are_fire_and_forget() {
    let h = harness();

    assert!(h.session.signup_completed());
    assert!(!h.session.signup_completed());
    let task_id = Uuid::new_v4();
    assert!(h.session.task_submitted(task_id, Uuid::new_v4()));

    // 调用方不等待评分结果
    assert_eq!(h.remote.calls.load(Ordering::SeqCst), 0);

    h.session.fraud().wait_idle().await;
    assert_eq!(h.remote.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let h = harness();
    h.session.start().await;
    let room = Topic::room(Uuid::new_v4());
    h.session.presence().enter(&room, None).await.unwrap();
    let _channel = h
        .session
        .acquire_channel(room.clone(), ChangeFilter::all())
        .await
        .unwrap();

    // 排行榜、维护开关、房间频道、房间在线状态
    assert_eq!(h.session.leases().len().await, 4);
    assert_eq!(h.transport.subscription_count(), 4);

    let report = h.session.shutdown().await;
    assert_eq!(report.released, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(h.session.leases().len().await, 0);
    assert_eq!(h.transport.subscription_count(), 0);

    // 释放不存在的租约不是错误
    assert!(!h.session.release_channel(&room).await.unwrap());
    assert!(!h.session.signup_completed());
}
