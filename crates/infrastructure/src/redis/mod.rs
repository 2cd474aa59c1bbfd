//! Redis 后端
//!
//! 提供基于 Pub/Sub 的传输层和共享窗口的限流存储。

pub mod error;
pub mod rate_limiter;
pub mod transport;

// 重新导出
pub use error::*;
pub use rate_limiter::RedisRateLimiter;
pub use transport::{RedisTransport, DEFAULT_CHANNEL_PREFIX};
