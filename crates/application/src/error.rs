use std::time::Duration;

use domain::{ActionKind, DomainError};
use thiserror::Error;

use crate::rate_limiter::RateLimitError;
use crate::repository::RepositoryError;
use crate::services::ProjectionError;
use crate::transport::TransportError;

/// 对外暴露的错误。风控评分错误只在管道内部记录，不会出现在这里。
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("rate limit exceeded for {action}, retry after {retry_after:?}")]
    RateLimited {
        action: ActionKind,
        retry_after: Duration,
    },
    #[error("rate limiter unavailable: {0}")]
    RateLimiter(#[from] RateLimitError),
    #[error("projection error: {0}")]
    Projection(#[from] ProjectionError),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }

    /// 被限流时需要等待的时长
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApplicationError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// 调用方可以稍后重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApplicationError::Transport(_)
                | ApplicationError::RateLimited { .. }
                | ApplicationError::RateLimiter(_)
                | ApplicationError::Projection(_)
        )
    }
}
