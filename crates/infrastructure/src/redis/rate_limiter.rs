//! Redis 固定窗口限流
//!
//! 窗口状态保存在 Redis 中，多个会话（或多个进程）共享同一个计数。
//! 检查与计数在一个 Lua 脚本里原子完成，拒绝时不增加计数。

use std::time::Duration;

use application::{RateDecision, RateKey, RateLimitError, RateLimitStore};
use async_trait::async_trait;
use config::RateRule;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::debug;

use crate::redis::{RedisError, RedisResult};
use crate::retry::{retry_async, RetryConfig};

/// 返回 {是否放行, 剩余毫秒}
const CHECK_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
  return {0, redis.call('PTTL', KEYS[1])}
end
current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return {1, redis.call('PTTL', KEYS[1])}
"#;

pub struct RedisRateLimiter {
    conn: ConnectionManager,
    script: Script,
    prefix: String,
}

impl RedisRateLimiter {
    pub async fn connect(url: &str, prefix: impl Into<String>, retry: &RetryConfig) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let conn = retry_async(retry, "redis_rate_limit_connect", || {
            ConnectionManager::new(client.clone())
        })
        .await?;
        Ok(Self::with_connection(conn, prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            script: Script::new(CHECK_SCRIPT),
            prefix: prefix.into(),
        }
    }

    pub fn redis_key(&self, key: &RateKey) -> String {
        format!("{}rate:{}", self.prefix, key)
    }
}

/// PTTL 返回负数表示键不存在或没有过期时间
fn remaining(pttl_ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(pttl_ms).unwrap_or(0))
}

#[async_trait]
impl RateLimitStore for RedisRateLimiter {
    async fn check(&self, key: &RateKey, rule: RateRule) -> Result<RateDecision, RateLimitError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();
        let (allowed, pttl): (i64, i64) = self
            .script
            .key(&redis_key)
            .arg(rule.max_requests)
            .arg(rule.window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;

        if allowed == 1 {
            Ok(RateDecision::allow())
        } else {
            let retry_after = remaining(pttl);
            debug!(key = %redis_key, retry_after_ms = retry_after.as_millis() as u64, "限流拒绝");
            Ok(RateDecision::deny(retry_after))
        }
    }

    async fn time_until_reset(&self, key: &RateKey) -> Result<Duration, RateLimitError> {
        let mut conn = self.conn.clone();
        let pttl: i64 = conn
            .pttl(self.redis_key(key))
            .await
            .map_err(RedisError::from)?;
        Ok(remaining(pttl))
    }
}
