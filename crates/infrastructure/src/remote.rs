//! 通过 HTTP 调用后端托管的远程函数

use std::time::Duration;

use application::{RemoteError, RemoteInvoker};
use async_trait::async_trait;
use config::FraudConfig;
use serde_json::Value;
use tracing::debug;

#[derive(Clone)]
pub struct HttpRemoteInvoker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRemoteInvoker {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &FraudConfig) -> Result<Self, reqwest::Error> {
        Self::new(
            config.base_url.clone(),
            config.api_key.clone(),
            Duration::from_millis(config.timeout_ms),
        )
    }

    pub fn endpoint(&self, service: &str) -> String {
        format!("{}/functions/v1/{}", self.base_url, service)
    }
}

#[async_trait]
impl RemoteInvoker for HttpRemoteInvoker {
    async fn invoke(&self, service: &str, payload: Value) -> Result<Value, RemoteError> {
        let url = self.endpoint(service);
        let mut request = self.client.post(&url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| RemoteError::Failed {
            service: service.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        debug!(service, status = status.as_u16(), "远程函数已返回");
        if !status.is_success() {
            return Err(RemoteError::Status {
                service: service.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::InvalidResponse {
                service: service.to_string(),
                message: e.to_string(),
            })
    }
}
