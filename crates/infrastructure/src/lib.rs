//! 基础设施层实现。
//!
//! 提供 Redis 传输层与限流存储、HTTP 远程函数调用等适配器，
//! 实现应用层定义的接口，并按配置装配成可用的会话。

pub mod builder;
pub mod redis;
pub mod remote;
pub mod retry;

pub use builder::{Infrastructure, InfrastructureError};
pub use redis::{RedisError, RedisRateLimiter, RedisTransport};
pub use remote::HttpRemoteInvoker;
pub use retry::{retry_async, Backoff, RetryConfig};
