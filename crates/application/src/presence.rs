//! 在线状态与输入状态广播
//!
//! 事件只在 `presence:<room>` 话题上广播，不落库。本地发出的事件会先写入
//! [`PresenceBoard`]，订阅回来的同一事件再次应用时是幂等的。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use config::PresenceConfig;
use domain::{
    tables, ActorId, ChangeEvent, ChangeFilter, ChangeKind, PresenceEvent, PresenceRecord,
    PresenceStatus, Timestamp, Topic,
};
use tokio::task::JoinHandle;

use crate::clock::{to_chrono, Clock};
use crate::debounce::Debouncer;
use crate::lease::ChannelLeaseManager;
use crate::transport::{ChangeHandler, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub typing_debounce: Duration,
    pub typing_idle: Duration,
    pub typing_max: Duration,
}

impl From<&PresenceConfig> for PresenceSettings {
    fn from(config: &PresenceConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
            typing_debounce: Duration::from_millis(config.typing_debounce_ms),
            typing_idle: Duration::from_millis(config.typing_idle_ms),
            typing_max: Duration::from_millis(config.typing_max_ms),
        }
    }
}

/// 读取端看到的在线状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub actor: ActorId,
    pub status: PresenceStatus,
    pub custom_status: Option<String>,
    pub last_seen: Timestamp,
}

/// 按房间聚合的在线记录和输入指示
#[derive(Debug, Default)]
pub struct PresenceBoard {
    records: RwLock<HashMap<Topic, HashMap<ActorId, PresenceRecord>>>,
    typing: RwLock<HashMap<Topic, HashMap<ActorId, Timestamp>>>,
}

impl PresenceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// 应用一条事件，过期事件返回 false
    pub fn apply(&self, room: &Topic, event: &PresenceEvent) -> bool {
        let actor = event.actor();
        let at = event.at();

        let applied = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            records
                .entry(room.clone())
                .or_default()
                .entry(actor)
                .or_insert_with(|| PresenceRecord::new(actor, room.clone(), at))
                .apply(event)
        };
        if !applied {
            return false;
        }

        let mut typing = self.typing.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            PresenceEvent::TypingStarted { .. } => {
                typing.entry(room.clone()).or_default().insert(actor, at);
            }
            PresenceEvent::TypingStopped { .. } | PresenceEvent::Offline { .. } => {
                if let Some(actors) = typing.get_mut(room) {
                    actors.remove(&actor);
                }
            }
            _ => {}
        }
        true
    }

    /// 每个参与者一条，按参与者排序
    pub fn snapshot(&self, room: &Topic, now: Timestamp, timeout: Duration) -> Vec<PresenceSnapshot> {
        let timeout = to_chrono(timeout);
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot: Vec<PresenceSnapshot> = records
            .get(room)
            .map(|actors| {
                actors
                    .values()
                    .map(|record| PresenceSnapshot {
                        actor: record.actor,
                        status: record.effective_status(now, timeout),
                        custom_status: record.custom_status.clone(),
                        last_seen: record.last_seen,
                    })
                    .collect()
            })
            .unwrap_or_default();
        snapshot.sort_by_key(|entry| entry.actor);
        snapshot
    }

    /// 正在输入的参与者，超过 `max_age` 的指示视为失效
    pub fn typing(&self, room: &Topic, now: Timestamp, max_age: Duration) -> Vec<ActorId> {
        let max_age = to_chrono(max_age);
        let typing = self.typing.read().unwrap_or_else(PoisonError::into_inner);
        let mut actors: Vec<ActorId> = typing
            .get(room)
            .map(|actors| {
                actors
                    .iter()
                    .filter(|(_, started)| now - **started <= max_age)
                    .map(|(actor, _)| *actor)
                    .collect()
            })
            .unwrap_or_default();
        actors.sort();
        actors
    }

    pub fn clear(&self, room: &Topic) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(room);
        self.typing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(room);
    }
}

#[derive(Clone)]
struct PresencePublisher {
    actor: ActorId,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    board: Arc<PresenceBoard>,
}

impl PresencePublisher {
    async fn publish(&self, room: &Topic, event: PresenceEvent) -> Result<(), TransportError> {
        self.board.apply(room, &event);
        let topic = room.presence();
        let change = ChangeEvent::for_row(
            topic.clone(),
            tables::PRESENCE,
            ChangeKind::Broadcast,
            &event,
            event.at(),
        )
        .map_err(|err| TransportError::publish(&topic, err.to_string()))?;
        self.transport.publish(change).await
    }

    async fn publish_logged(&self, room: &Topic, event: PresenceEvent) {
        if let Err(err) = self.publish(room, event).await {
            tracing::warn!(room = %room, actor = %self.actor, error = %err, "在线状态广播失败");
        }
    }
}

// 最近一次发出 TypingStarted 的时间；None 表示当前没有在输入
#[derive(Debug, Default)]
struct TypingTrack {
    started: Mutex<Option<Timestamp>>,
}

impl TypingTrack {
    fn start(&self, now: Timestamp, debounce: Duration) -> bool {
        let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        match *started {
            Some(last) if now - last < to_chrono(debounce) => false,
            _ => {
                *started = Some(now);
                true
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn stop(&self) -> bool {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}

struct RoomState {
    heartbeat: Option<JoinHandle<()>>,
    idle: Debouncer,
    typing: Arc<TypingTrack>,
}

impl RoomState {
    fn new(typing_idle: Duration) -> Self {
        Self {
            heartbeat: None,
            idle: Debouncer::new(typing_idle),
            typing: Arc::default(),
        }
    }

    // 只输入过、没有进入过的房间
    fn is_typing_only(&self) -> bool {
        self.heartbeat.is_none()
    }
}

type Rooms = Mutex<HashMap<Topic, RoomState>>;

impl Drop for RoomState {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

/// 单个会话的在线状态广播器
pub struct PresenceBroadcaster {
    publisher: PresencePublisher,
    leases: Arc<ChannelLeaseManager>,
    settings: PresenceSettings,
    rooms: Arc<Rooms>,
}

impl PresenceBroadcaster {
    pub fn new(
        actor: ActorId,
        transport: Arc<dyn Transport>,
        leases: Arc<ChannelLeaseManager>,
        clock: Arc<dyn Clock>,
        settings: PresenceSettings,
    ) -> Self {
        Self {
            publisher: PresencePublisher {
                actor,
                transport,
                clock,
                board: Arc::new(PresenceBoard::new()),
            },
            leases,
            settings,
            rooms: Arc::default(),
        }
    }

    pub fn board(&self) -> &Arc<PresenceBoard> {
        &self.publisher.board
    }

    /// 进入房间：订阅 presence 话题、广播上线并启动心跳
    pub async fn enter(&self, room: &Topic, custom_status: Option<String>) -> Result<(), TransportError> {
        let board = self.publisher.board.clone();
        let target = room.clone();
        self.leases
            .acquire(
                room.presence(),
                ChangeFilter::table(tables::PRESENCE).with_kind(ChangeKind::Broadcast),
                move || -> ChangeHandler {
                    Arc::new(move |change: ChangeEvent| match change.decode::<PresenceEvent>() {
                        Ok(event) => {
                            board.apply(&target, &event);
                        }
                        Err(err) => {
                            tracing::debug!(room = %target, error = %err, "忽略无法解析的在线状态事件");
                        }
                    })
                },
            )
            .await?;

        let now = self.publisher.clock.now();
        self.publisher
            .publish(
                room,
                PresenceEvent::Online {
                    actor: self.publisher.actor,
                    custom_status,
                    at: now,
                },
            )
            .await?;

        let heartbeat = self.spawn_heartbeat(room.clone());
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let state = rooms
            .entry(room.clone())
            .or_insert_with(|| RoomState::new(self.settings.typing_idle));
        if let Some(previous) = state.heartbeat.replace(heartbeat) {
            previous.abort();
        }
        tracing::info!(room = %room, actor = %self.publisher.actor, "进入房间");
        Ok(())
    }

    pub async fn heartbeat(&self, room: &Topic) -> Result<(), TransportError> {
        let event = PresenceEvent::Heartbeat {
            actor: self.publisher.actor,
            at: self.publisher.clock.now(),
        };
        self.publisher.publish(room, event).await
    }

    pub async fn set_status(&self, room: &Topic, custom_status: Option<String>) -> Result<(), TransportError> {
        let event = PresenceEvent::Status {
            actor: self.publisher.actor,
            custom_status,
            at: self.publisher.clock.now(),
        };
        self.publisher.publish(room, event).await
    }

    /// 记录一次按键：节流广播 TypingStarted，并重置空闲计时
    pub async fn keystroke(&self, room: &Topic) -> Result<(), TransportError> {
        let now = self.publisher.clock.now();
        let emit = {
            let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
            let state = rooms
                .entry(room.clone())
                .or_insert_with(|| RoomState::new(self.settings.typing_idle));

            let publisher = self.publisher.clone();
            let track = state.typing.clone();
            let target = room.clone();
            let rooms_ref: Weak<Rooms> = Arc::downgrade(&self.rooms);
            state.idle.schedule(async move {
                if track.stop() {
                    let event = PresenceEvent::TypingStopped {
                        actor: publisher.actor,
                        at: publisher.clock.now(),
                    };
                    publisher.publish_logged(&target, event).await;
                }
                if let Some(rooms) = rooms_ref.upgrade() {
                    forget_typing_only(&rooms, &target);
                }
            });

            state.typing.start(now, self.settings.typing_debounce)
        };

        if emit {
            let event = PresenceEvent::TypingStarted {
                actor: self.publisher.actor,
                at: now,
            };
            self.publisher.publish(room, event).await?;
        }
        Ok(())
    }

    /// 消息已发出，立即结束输入状态
    pub async fn message_sent(&self, room: &Topic) -> Result<(), TransportError> {
        let (known, forgotten) = {
            let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
            match rooms.get(room) {
                Some(state) => {
                    state.idle.cancel();
                    state.typing.stop();
                    let forgotten = if state.is_typing_only() { rooms.remove(room) } else { None };
                    (true, forgotten)
                }
                None => (false, None),
            }
        };
        drop(forgotten);
        // 没进入过也没输入过的房间不需要广播
        if !known {
            return Ok(());
        }
        let event = PresenceEvent::TypingStopped {
            actor: self.publisher.actor,
            at: self.publisher.clock.now(),
        };
        self.publisher.publish(room, event).await
    }

    /// 离开房间：广播下线，停止心跳和输入计时，释放订阅
    pub async fn leave(&self, room: &Topic) -> Result<(), TransportError> {
        let state = self
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(room);
        drop(state);

        let event = PresenceEvent::Offline {
            actor: self.publisher.actor,
            at: self.publisher.clock.now(),
        };
        self.publisher.publish_logged(room, event).await;

        let released = self.leases.release(&room.presence()).await;
        self.publisher.board.clear(room);
        released?;
        tracing::info!(room = %room, actor = %self.publisher.actor, "离开房间");
        Ok(())
    }

    /// 离开所有已进入的房间，返回失败数量。
    /// 只输入过的房间不广播下线，仍在输入时只结束输入状态。
    pub async fn leave_all(&self) -> usize {
        let typing_only: Vec<(Topic, RoomState)> = {
            let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<Topic> = rooms
                .iter()
                .filter(|(_, state)| state.is_typing_only())
                .map(|(room, _)| room.clone())
                .collect();
            keys.into_iter()
                .filter_map(|room| rooms.remove(&room).map(|state| (room, state)))
                .collect()
        };
        for (room, state) in typing_only {
            if state.typing.stop() {
                let event = PresenceEvent::TypingStopped {
                    actor: self.publisher.actor,
                    at: self.publisher.clock.now(),
                };
                self.publisher.publish_logged(&room, event).await;
            }
        }

        let rooms = self.entered_rooms();
        let mut failed = 0;
        for room in rooms {
            if let Err(err) = self.leave(&room).await {
                failed += 1;
                tracing::warn!(room = %room, error = %err, "离开房间失败");
            }
        }
        failed
    }

    pub fn current_presence(&self, room: &Topic) -> Vec<PresenceSnapshot> {
        self.publisher.board.snapshot(
            room,
            self.publisher.clock.now(),
            self.settings.heartbeat_timeout,
        )
    }

    pub fn typing_actors(&self, room: &Topic) -> Vec<ActorId> {
        self.publisher
            .board
            .typing(room, self.publisher.clock.now(), self.settings.typing_max)
    }

    pub fn entered_rooms(&self) -> Vec<Topic> {
        let mut rooms: Vec<Topic> = self
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, state)| state.heartbeat.is_some())
            .map(|(room, _)| room.clone())
            .collect();
        rooms.sort();
        rooms
    }

    fn spawn_heartbeat(&self, room: Topic) -> JoinHandle<()> {
        let publisher = self.publisher.clone();
        let every = self.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即返回，上线事件已经覆盖
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let event = PresenceEvent::Heartbeat {
                    actor: publisher.actor,
                    at: publisher.clock.now(),
                };
                publisher.publish_logged(&room, event).await;
            }
        })
    }
}

// 空闲计时触发后，丢弃没有进入过且已停止输入的房间状态
fn forget_typing_only(rooms: &Rooms, room: &Topic) {
    let removed = {
        let mut rooms = rooms.lock().unwrap_or_else(PoisonError::into_inner);
        match rooms.get(room) {
            Some(state) if state.is_typing_only() && state.typing.is_idle() => rooms.remove(room),
            _ => None,
        }
    };
    drop(removed);
}

impl Drop for PresenceBroadcaster {
    fn drop(&mut self) {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
