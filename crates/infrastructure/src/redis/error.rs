//! Redis 错误类型定义

use application::{RateLimitError, TransportError};
use thiserror::Error;

/// Redis 操作错误
#[derive(Error, Debug)]
pub enum RedisError {
    /// 连接错误
    #[error("Redis 连接错误: {message}")]
    ConnectionError { message: String },

    /// 命令执行错误
    #[error("Redis 命令错误: {message}")]
    CommandError { message: String },

    /// 序列化错误
    #[error("序列化错误: {message}")]
    SerializationError { message: String },

    /// 配置错误
    #[error("配置错误: {message}")]
    ConfigError { message: String },
}

/// Redis 结果类型
pub type RedisResult<T> = Result<T, RedisError>;

impl From<redis::RedisError> for RedisError {
    fn from(err: redis::RedisError) -> Self {
        let message = err.to_string();
        if err.kind() == redis::ErrorKind::InvalidClientConfig {
            RedisError::ConfigError { message }
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            RedisError::ConnectionError { message }
        } else {
            RedisError::CommandError { message }
        }
    }
}

impl From<serde_json::Error> for RedisError {
    fn from(err: serde_json::Error) -> Self {
        RedisError::SerializationError {
            message: err.to_string(),
        }
    }
}

impl From<RedisError> for RateLimitError {
    fn from(err: RedisError) -> Self {
        RateLimitError::Backend(err.to_string())
    }
}

impl From<RedisError> for TransportError {
    fn from(err: RedisError) -> Self {
        TransportError::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_url_maps_to_config_error() {
        let err = redis::Client::open("not a url").err().map(RedisError::from);
        assert!(matches!(err, Some(RedisError::ConfigError { .. })));
    }

    #[test]
    fn converts_into_port_errors() {
        let err = RedisError::ConnectionError {
            message: "refused".into(),
        };
        let transport: TransportError = err.into();
        assert!(matches!(transport, TransportError::Unavailable(msg) if msg.contains("refused")));
    }
}
