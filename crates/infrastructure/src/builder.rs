use std::sync::Arc;

use application::{
    Clock, MemoryStore, MemoryTransport, RateLimitStore, RealtimeSession, RemoteInvoker,
    SessionDependencies, SystemClock, Transport,
};
use config::{RateLimitBackend, RealtimeConfig, TransportKind};
use domain::ActorId;
use thiserror::Error;
use tracing::info;

use crate::redis::{RedisError, RedisRateLimiter, RedisTransport, DEFAULT_CHANNEL_PREFIX};
use crate::remote::HttpRemoteInvoker;
use crate::retry::RetryConfig;

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// 按配置装配好的外部协作方
#[derive(Clone)]
pub struct Infrastructure {
    pub config: RealtimeConfig,
    pub transport: Arc<dyn Transport>,
    pub store: Arc<MemoryStore>,
    pub remote: Arc<dyn RemoteInvoker>,
    pub rate_limit_store: Option<Arc<dyn RateLimitStore>>,
    pub clock: Arc<dyn Clock>,
}

impl Infrastructure {
    pub async fn connect(config: RealtimeConfig) -> Result<Self, InfrastructureError> {
        let retry = RetryConfig::connect();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let transport: Arc<dyn Transport> = match config.transport.kind {
            TransportKind::Memory => Arc::new(MemoryTransport::new(config.transport.channel_capacity)),
            TransportKind::Redis => {
                let url = redis_url(&config)?;
                Arc::new(RedisTransport::connect(url, DEFAULT_CHANNEL_PREFIX, &retry).await?)
            }
        };

        let rate_limit_store: Option<Arc<dyn RateLimitStore>> = match config.rate_limits.backend {
            RateLimitBackend::Local => None,
            RateLimitBackend::Redis => {
                let url = redis_url(&config)?;
                Some(Arc::new(
                    RedisRateLimiter::connect(url, DEFAULT_CHANNEL_PREFIX, &retry).await?,
                ))
            }
        };

        let remote: Arc<dyn RemoteInvoker> = Arc::new(HttpRemoteInvoker::from_config(&config.fraud)?);
        let store = Arc::new(MemoryStore::new(transport.clone(), clock.clone()));

        info!(
            transport = ?config.transport.kind,
            rate_limit_backend = ?config.rate_limits.backend,
            "基础设施已就绪"
        );

        Ok(Self {
            config,
            transport,
            store,
            remote,
            rate_limit_store,
            clock,
        })
    }

    /// 为指定参与者创建会话
    pub fn session(&self, actor: ActorId) -> RealtimeSession {
        RealtimeSession::new(SessionDependencies {
            actor,
            transport: self.transport.clone(),
            message_repository: self.store.clone(),
            reaction_repository: self.store.clone(),
            mention_repository: self.store.clone(),
            score_repository: self.store.clone(),
            remote: self.remote.clone(),
            rate_limit_store: self.rate_limit_store.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
        })
    }
}

fn redis_url(config: &RealtimeConfig) -> Result<&str, InfrastructureError> {
    config
        .transport
        .redis_url
        .as_deref()
        .ok_or_else(|| InfrastructureError::Config("transport.redis_url is not set".into()))
}
