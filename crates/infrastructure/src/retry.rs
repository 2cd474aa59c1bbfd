//! 带退避的异步重试

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    Fixed { delay: Duration },
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed { delay }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    /// 第 `attempt` 次失败之后的等待时间（从 1 开始）
    pub fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential { base, max } => {
                let exp = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u32 << exp).min(*max)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// 错误文本中包含任一片段才重试；为空表示所有错误都重试
    pub retryable_errors: Vec<String>,
}

impl RetryConfig {
    /// 建立 Redis 连接时使用的默认策略
    pub fn connect() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::exponential(Duration::from_millis(200), Duration::from_secs(5)),
            retryable_errors: Vec::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn only_on(mut self, fragments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.retryable_errors = fragments.into_iter().map(Into::into).collect();
        self
    }

    fn is_retryable<E: std::fmt::Display>(&self, err: &E) -> bool {
        if self.retryable_errors.is_empty() {
            return true;
        }
        let text = err.to_string();
        self.retryable_errors
            .iter()
            .any(|fragment| text.contains(fragment.as_str()))
    }
}

pub async fn retry_async<F, Fut, T, E>(config: &RetryConfig, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts || !config.is_retryable(&err) {
                    return Err(err);
                }
                let delay = config.backoff.delay_at(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "操作失败，稍后重试"
                );
                sleep(delay).await;
            }
        }
    }
}
