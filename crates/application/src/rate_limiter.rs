use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use config::{RateLimitConfig, RateRule};
use domain::{ActionKind, ActorId, Timestamp};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{remaining, to_chrono, Clock};

/// 限流键：参与者 + 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub actor: ActorId,
    pub action: ActionKind,
}

impl RateKey {
    pub fn new(actor: ActorId, action: ActionKind) -> Self {
        Self { actor, action }
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.action, self.actor)
    }
}

/// 固定窗口计数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    /// 当前窗口内已放行的次数
    pub count: u32,
    /// 窗口结束时间
    pub reset_at: Timestamp,
}

impl RateWindow {
    fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.reset_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// 被拒绝时距离窗口重置的时长，放行时为零
    pub retry_after: Duration,
}

impl RateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    pub fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// 限流错误类型
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit backend failed: {0}")]
    Backend(String),
}

/// 限流状态存储。进程内实现为默认，Redis 实现可跨会话共享窗口。
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn check(&self, key: &RateKey, rule: RateRule) -> Result<RateDecision, RateLimitError>;

    async fn time_until_reset(&self, key: &RateKey) -> Result<Duration, RateLimitError>;
}

/// 按操作类型取对应的限流规则
pub fn rule_for(config: &RateLimitConfig, action: ActionKind) -> RateRule {
    match action {
        ActionKind::TaskSubmission => config.task_submission,
        ActionKind::Message => config.message,
        ActionKind::Reaction => config.reaction,
        ActionKind::Resend => config.resend,
    }
}

/// 进程内固定窗口限流器
///
/// 只在当前会话内生效，属于建议性限流，服务端仍需做权威校验。
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    windows: RwLock<HashMap<RateKey, RateWindow>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// 检查并计数。读改写在同一把写锁内完成。
    pub fn is_allowed(&self, key: &RateKey, max_requests: u32, window: Duration) -> bool {
        let now = self.clock.now();
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);

        match windows.get_mut(key) {
            Some(current) if !current.is_expired(now) => {
                if current.count < max_requests {
                    current.count += 1;
                    true
                } else {
                    false
                }
            }
            _ => {
                windows.insert(
                    *key,
                    RateWindow {
                        count: 1,
                        reset_at: now + to_chrono(window),
                    },
                );
                true
            }
        }
    }

    /// 距离窗口重置的时长；没有窗口或已过期返回零
    pub fn time_until_reset(&self, key: &RateKey) -> Duration {
        let now = self.clock.now();
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|w| remaining(now, w.reset_at))
            .unwrap_or(Duration::ZERO)
    }

    pub fn window(&self, key: &RateKey) -> Option<RateWindow> {
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// 重置某个键（管理员功能）
    pub fn reset(&self, key: &RateKey) {
        self.windows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// 清理过期窗口，返回清理数量
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, w| !w.is_expired(now));
        before - windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 启动周期清理任务，token 取消后退出
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.sweep_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "清理过期限流窗口");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl RateLimitStore for RateLimiter {
    async fn check(&self, key: &RateKey, rule: RateRule) -> Result<RateDecision, RateLimitError> {
        if self.is_allowed(key, rule.max_requests, rule.window()) {
            Ok(RateDecision::allow())
        } else {
            Ok(RateDecision::deny(RateLimiter::time_until_reset(self, key)))
        }
    }

    async fn time_until_reset(&self, key: &RateKey) -> Result<Duration, RateLimitError> {
        Ok(RateLimiter::time_until_reset(self, key))
    }
}
