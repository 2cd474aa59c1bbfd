//! 单个客户端会话
//!
//! 会话持有全部组件的唯一实例：租约、限流、在线状态、消息、排行榜、风控管道和健康检查。
//! 登出或销毁时调用 [`RealtimeSession::shutdown`]，释放所有订阅并停止后台任务。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use config::RealtimeConfig;
use domain::{
    tables, ActionKind, ActorId, ChangeEvent, ChangeFilter, Mention, Message, MessageId,
    NewMessage, Reaction, Topic,
};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::health::{Connectivity, ConnectivityMonitor};
use crate::lease::{ChannelLeaseManager, LeaseInfo, ReleaseReport};
use crate::presence::{PresenceBroadcaster, PresenceSettings, PresenceSnapshot};
use crate::rate_limiter::{rule_for, RateKey, RateLimitStore, RateLimiter};
use crate::remote::RemoteInvoker;
use crate::repository::{
    MentionRepository, MessageRepository, ReactionRepository, ScoreRepository,
};
use crate::services::{
    FraudSettings, FraudSignalPipeline, FraudTrigger, LeaderboardProjector, MessageService,
    MessageServiceDependencies, Standings,
};
use crate::transport::{ChangeHandler, Transport};

pub struct SessionDependencies {
    pub actor: ActorId,
    pub transport: Arc<dyn Transport>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub reaction_repository: Arc<dyn ReactionRepository>,
    pub mention_repository: Arc<dyn MentionRepository>,
    pub score_repository: Arc<dyn ScoreRepository>,
    pub remote: Arc<dyn RemoteInvoker>,
    /// 为空时使用会话内的限流器
    pub rate_limit_store: Option<Arc<dyn RateLimitStore>>,
    pub clock: Arc<dyn Clock>,
    pub config: RealtimeConfig,
}

/// 已获取的频道：租约信息和按提交顺序到达的事件
pub struct LiveChannel {
    pub lease: LeaseInfo,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitDecision {
    pub allowed: bool,
    pub retry_after: Duration,
}

#[derive(Debug, Deserialize)]
struct MaintenanceFlag {
    enabled: bool,
}

pub struct RealtimeSession {
    actor: ActorId,
    config: RealtimeConfig,
    transport: Arc<dyn Transport>,
    leases: Arc<ChannelLeaseManager>,
    local_limiter: Arc<RateLimiter>,
    rate_limiter: Arc<dyn RateLimitStore>,
    presence: PresenceBroadcaster,
    messages: MessageService,
    leaderboard: Arc<LeaderboardProjector>,
    fraud: FraudSignalPipeline,
    connectivity: Arc<ConnectivityMonitor>,
    maintenance: Arc<watch::Sender<bool>>,
    started: AtomicBool,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RealtimeSession {
    pub fn new(deps: SessionDependencies) -> Self {
        let SessionDependencies {
            actor,
            transport,
            message_repository,
            reaction_repository,
            mention_repository,
            score_repository,
            remote,
            rate_limit_store,
            clock,
            config,
        } = deps;

        let leases = Arc::new(ChannelLeaseManager::new(
            actor,
            transport.clone(),
            clock.clone(),
        ));
        let local_limiter = Arc::new(RateLimiter::new(clock.clone()));
        let rate_limiter: Arc<dyn RateLimitStore> = match rate_limit_store {
            Some(store) => store,
            None => local_limiter.clone(),
        };

        let presence = PresenceBroadcaster::new(
            actor,
            transport.clone(),
            leases.clone(),
            clock.clone(),
            PresenceSettings::from(&config.presence),
        );
        let messages = MessageService::new(MessageServiceDependencies {
            message_repository,
            reaction_repository,
            mention_repository,
            rate_limiter: rate_limiter.clone(),
            rate_limits: config.rate_limits.clone(),
            clock,
        });
        let leaderboard = Arc::new(LeaderboardProjector::new(
            score_repository,
            &config.leaderboard,
        ));
        let fraud = FraudSignalPipeline::new(remote, FraudSettings::from(&config.fraud));
        let connectivity = Arc::new(
            ConnectivityMonitor::new(
                transport.clone(),
                Duration::from_millis(config.health.poll_interval_ms),
            )
            .with_leases(leases.clone()),
        );
        let (maintenance, _) = watch::channel(false);
        let maintenance = Arc::new(maintenance);

        Self {
            actor,
            config,
            transport,
            leases,
            local_limiter,
            rate_limiter,
            presence,
            messages,
            leaderboard,
            fraud,
            connectivity,
            maintenance,
            started: AtomicBool::new(false),
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// 订阅全局话题并启动后台任务。重复调用无效果。
    ///
    /// 订阅失败只记录日志，对应话题保持无租约，之后可以再次获取。
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(err) = self.leaderboard.attach(&self.leases).await {
            tracing::warn!(error = %err, "排行榜订阅失败");
        }
        if let Err(err) = self.leaderboard.recompute().await {
            tracing::warn!(error = %err, "排行榜首次加载失败");
        }
        if let Err(err) = self.watch_maintenance().await {
            tracing::warn!(error = %err, "维护开关订阅失败");
        }

        let sweeper = self.local_limiter.spawn_sweeper(
            Duration::from_millis(self.config.rate_limits.sweep_interval_ms),
            self.background.child_token(),
        );
        let health = self.connectivity.spawn(self.background.child_token());
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([sweeper, health]);

        tracing::info!(actor = %self.actor, "实时会话已启动");
    }

    async fn watch_maintenance(&self) -> Result<LeaseInfo, ApplicationError> {
        let flag = self.maintenance.clone();
        let lease = self
            .leases
            .acquire(
                Topic::maintenance_flag(),
                ChangeFilter::table(tables::APP_SETTINGS),
                move || -> ChangeHandler {
                    Arc::new(move |event: ChangeEvent| match event.decode::<MaintenanceFlag>() {
                        Ok(update) => {
                            if flag.send_replace(update.enabled) != update.enabled {
                                tracing::info!(enabled = update.enabled, "维护模式切换");
                            }
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "忽略无法解析的维护开关事件");
                        }
                    })
                },
            )
            .await?;
        Ok(lease)
    }

    /// 获取话题租约，事件通过返回的通道送出
    pub async fn acquire_channel(
        &self,
        topic: Topic,
        filter: ChangeFilter,
    ) -> Result<LiveChannel, ApplicationError> {
        let (sender, events) = mpsc::unbounded_channel();
        let lease = self
            .leases
            .acquire(topic, filter, move || -> ChangeHandler {
                Arc::new(move |event: ChangeEvent| {
                    // 接收端已丢弃时忽略
                    let _ = sender.send(event);
                })
            })
            .await?;
        Ok(LiveChannel { lease, events })
    }

    pub async fn release_channel(&self, topic: &Topic) -> Result<bool, ApplicationError> {
        Ok(self.leases.release(topic).await?)
    }

    /// 客户端限流检查，拒绝时给出需要等待的时长
    pub async fn try_submit(
        &self,
        actor: ActorId,
        action: ActionKind,
    ) -> Result<SubmitDecision, ApplicationError> {
        let rule = rule_for(&self.config.rate_limits, action);
        let decision = self
            .rate_limiter
            .check(&RateKey::new(actor, action), rule)
            .await?;
        Ok(SubmitDecision {
            allowed: decision.allowed,
            retry_after: decision.retry_after,
        })
    }

    pub async fn post_message(
        &self,
        topic: &Topic,
        new: NewMessage,
    ) -> Result<Message, ApplicationError> {
        let own = new.author == self.actor;
        let message = self.messages.post(topic, new).await?;
        if own {
            if let Err(err) = self.presence.message_sent(topic).await {
                tracing::debug!(topic = %topic, error = %err, "停止输入广播失败");
            }
        }
        Ok(message)
    }

    pub async fn react_to_message(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Reaction, ApplicationError> {
        self.messages.react(message_id, emoji, self.actor).await
    }

    pub async fn mention_actor(
        &self,
        message_id: MessageId,
        actor: ActorId,
    ) -> Result<Mention, ApplicationError> {
        self.messages.mention(message_id, actor).await
    }

    pub fn current_presence(&self, room: &Topic) -> Vec<PresenceSnapshot> {
        self.presence.current_presence(room)
    }

    pub fn current_leaderboard(&self) -> Standings {
        self.leaderboard.current()
    }

    pub fn task_submitted(&self, task_id: Uuid, submission_id: Uuid) -> bool {
        self.fraud.trigger(FraudTrigger::TaskSubmission {
            actor: self.actor,
            task_id,
            submission_id,
        })
    }

    pub fn signup_completed(&self) -> bool {
        self.fraud.trigger(FraudTrigger::Signup { actor: self.actor })
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    pub fn presence(&self) -> &PresenceBroadcaster {
        &self.presence
    }

    pub fn messages(&self) -> &MessageService {
        &self.messages
    }

    pub fn leaderboard(&self) -> &Arc<LeaderboardProjector> {
        &self.leaderboard
    }

    pub fn leases(&self) -> &Arc<ChannelLeaseManager> {
        &self.leases
    }

    pub fn fraud(&self) -> &FraudSignalPipeline {
        &self.fraud
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    pub fn maintenance(&self) -> watch::Receiver<bool> {
        self.maintenance.subscribe()
    }

    pub fn is_maintenance(&self) -> bool {
        *self.maintenance.borrow()
    }

    /// 会话销毁：离开房间、取消风控评估和后台任务、释放全部租约
    pub async fn shutdown(&self) -> ReleaseReport {
        let failed_rooms = self.presence.leave_all().await;
        self.fraud.shutdown().await;

        self.background.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::debug!(error = %err, "后台任务退出异常");
            }
        }

        let mut report = self.leases.release_all().await;
        report.failed += failed_rooms;
        tracing::info!(
            actor = %self.actor,
            released = report.released,
            failed = report.failed,
            "实时会话已关闭"
        );
        report
    }
}
