use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote service {service} failed: {message}")]
    Failed { service: String, message: String },
    #[error("remote service {service} returned status {status}")]
    Status { service: String, status: u16 },
    #[error("invalid response from {service}: {message}")]
    InvalidResponse { service: String, message: String },
}

/// 远程函数调用（例如风控评分服务）
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke(
        &self,
        service: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, RemoteError>;
}
