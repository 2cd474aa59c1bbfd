//! 统一配置中心
//!
//! 提供实时互动引擎的配置管理，包括：
//! - 传输层（内存 / Redis）
//! - 各类写操作的限流窗口
//! - 在线状态与输入状态的时间参数
//! - 排行榜投影与风控管道
//!
//! 加载优先级：默认值 -> 可选配置文件（REALTIME_CONFIG_FILE）-> 环境变量（REALTIME_*）

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 配置文件路径的环境变量
pub const CONFIG_FILE_ENV: &str = "REALTIME_CONFIG_FILE";
/// 环境变量前缀
pub const ENV_PREFIX: &str = "REALTIME_";

/// 传输层实现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// 进程内广播，单实例或测试使用
    Memory,
    /// Redis Pub/Sub
    Redis,
}

/// 限流状态的存放位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBackend {
    /// 会话内存，建议性限流
    Local,
    /// Redis，跨会话共享
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TransportConfig {
    pub kind: TransportKind,
    #[validate(url)]
    pub redis_url: Option<String>,
    /// 内存传输每个话题的广播通道容量
    #[validate(range(min = 1))]
    pub channel_capacity: usize,
}

/// 单个写操作的固定窗口规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RateRule {
    #[validate(range(min = 1))]
    pub max_requests: u32,
    #[validate(range(min = 1))]
    pub window_ms: u64,
}

impl RateRule {
    pub const fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RateLimitConfig {
    pub backend: RateLimitBackend,
    #[validate(nested)]
    pub task_submission: RateRule,
    #[validate(nested)]
    pub message: RateRule,
    #[validate(nested)]
    pub reaction: RateRule,
    #[validate(nested)]
    pub resend: RateRule,
    /// 过期窗口清理周期
    #[validate(range(min = 100))]
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PresenceConfig {
    #[validate(range(min = 100))]
    pub heartbeat_interval_ms: u64,
    #[validate(range(min = 100))]
    pub heartbeat_timeout_ms: u64,
    /// 两次“正在输入”广播之间的最小间隔
    pub typing_debounce_ms: u64,
    /// 无按键多久后自动发送“停止输入”
    #[validate(range(min = 100))]
    pub typing_idle_ms: u64,
    /// 未收到停止信号时输入指示的最长存活时间
    #[validate(range(min = 100))]
    pub typing_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LeaderboardConfig {
    #[validate(range(min = 1, max = 1000))]
    pub top_n: usize,
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FraudConfig {
    pub enabled: bool,
    #[validate(length(min = 1))]
    pub service_name: String,
    #[validate(url)]
    pub base_url: String,
    pub api_key: Option<String>,
    pub settle_delay_ms: u64,
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HealthConfig {
    #[validate(range(min = 100))]
    pub poll_interval_ms: u64,
}

/// 全局配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RealtimeConfig {
    #[validate(nested)]
    pub transport: TransportConfig,
    #[validate(nested)]
    pub rate_limits: RateLimitConfig,
    #[validate(nested)]
    pub presence: PresenceConfig,
    #[validate(nested)]
    pub leaderboard: LeaderboardConfig,
    #[validate(nested)]
    pub fraud: FraudConfig,
    #[validate(nested)]
    pub health: HealthConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig {
                kind: TransportKind::Memory,
                redis_url: None,
                channel_capacity: 1024,
            },
            rate_limits: RateLimitConfig {
                backend: RateLimitBackend::Local,
                task_submission: RateRule::new(5, 60_000),
                message: RateRule::new(30, 60_000),
                reaction: RateRule::new(60, 60_000),
                resend: RateRule::new(3, 300_000),
                sweep_interval_ms: 60_000,
            },
            presence: PresenceConfig {
                heartbeat_interval_ms: 10_000,
                heartbeat_timeout_ms: 30_000,
                typing_debounce_ms: 1_000,
                typing_idle_ms: 4_000,
                typing_max_ms: 8_000,
            },
            leaderboard: LeaderboardConfig {
                top_n: 50,
                debounce_ms: 500,
            },
            fraud: FraudConfig {
                enabled: true,
                service_name: "fraud-detection".into(),
                base_url: "http://127.0.0.1:54321".into(),
                api_key: None,
                settle_delay_ms: 2_000,
                timeout_ms: 10_000,
            },
            health: HealthConfig {
                poll_interval_ms: 15_000,
            },
        }
    }
}

impl RealtimeConfig {
    /// 按优先级加载：默认值 -> 可选配置文件 -> 环境变量
    pub fn load() -> Result<Self, ConfigError> {
        let mut fig = Self::figment();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig = fig.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(fig)
    }

    /// 只包含默认值的 Figment，调用方可以继续合并其他来源
    pub fn figment() -> Figment {
        Figment::new().merge(Serialized::defaults(RealtimeConfig::default()))
    }

    pub fn from_figment(fig: Figment) -> Result<Self, ConfigError> {
        let config: RealtimeConfig = fig.extract().map_err(Box::new)?;
        config.check()?;
        Ok(config)
    }

    /// 字段级校验之外的跨字段约束
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.transport.kind == TransportKind::Redis && self.transport.redis_url.is_none() {
            return Err(ConfigError::Invalid(
                "transport.redis_url is required for the redis transport".into(),
            ));
        }
        if self.rate_limits.backend == RateLimitBackend::Redis && self.transport.redis_url.is_none() {
            return Err(ConfigError::Invalid(
                "transport.redis_url is required for the redis rate limit backend".into(),
            ));
        }
        if self.presence.heartbeat_timeout_ms <= self.presence.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "presence.heartbeat_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.presence.typing_max_ms < self.presence.typing_idle_ms {
            return Err(ConfigError::Invalid(
                "presence.typing_max_ms must not be shorter than typing_idle_ms".into(),
            ));
        }
        Ok(())
    }

    /// 用于日志输出的脱敏文本
    pub fn sanitize(&self) -> String {
        let mut copy = self.clone();
        if copy.fraud.api_key.is_some() {
            copy.fraud.api_key = Some("[REDACTED]".into());
        }
        if let Some(url) = copy.transport.redis_url.as_mut() {
            if let Some(at) = url.rfind('@') {
                let scheme_end = url.find("://").map(|i| i + 3).unwrap_or(0);
                url.replace_range(scheme_end..at, "[REDACTED]");
            }
        }
        format!("{copy:?}")
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Figment(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
