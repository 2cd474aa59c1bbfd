//! 风控信号管道
//!
//! 注册、提交任务等事件发生后异步调用远程评分服务。调用方不等待结果，
//! 评分失败只记录日志，不重试，也不会影响触发它的业务操作。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use config::FraudConfig;
use domain::ActorId;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::remote::{RemoteError, RemoteInvoker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FraudTrigger {
    Signup {
        actor: ActorId,
    },
    TaskSubmission {
        actor: ActorId,
        task_id: Uuid,
        submission_id: Uuid,
    },
}

impl FraudTrigger {
    /// 同一会话内同一个键只评估一次
    pub fn dedupe_key(&self) -> String {
        match self {
            FraudTrigger::Signup { actor } => format!("signup:{actor}"),
            FraudTrigger::TaskSubmission {
                actor,
                submission_id,
                ..
            } => format!("task_submission:{actor}:{submission_id}"),
        }
    }

    pub fn actor(&self) -> ActorId {
        match self {
            FraudTrigger::Signup { actor } | FraudTrigger::TaskSubmission { actor, .. } => *actor,
        }
    }

    fn payload(&self) -> serde_json::Value {
        match self {
            FraudTrigger::Signup { actor } => json!({
                "trigger": "signup",
                "user_id": actor,
            }),
            FraudTrigger::TaskSubmission {
                actor,
                task_id,
                submission_id,
            } => json!({
                "trigger": "task_submission",
                "user_id": actor,
                "task_id": task_id,
                "submission_id": submission_id,
            }),
        }
    }
}

/// 评分服务的响应
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FraudScore {
    pub risk_score: f64,
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
}

#[derive(Debug, Error)]
pub enum RemoteScoringError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("scoring timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed score: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct FraudSettings {
    pub enabled: bool,
    pub service_name: String,
    pub settle_delay: Duration,
    pub timeout: Duration,
}

impl From<&FraudConfig> for FraudSettings {
    fn from(config: &FraudConfig) -> Self {
        Self {
            enabled: config.enabled,
            service_name: config.service_name.clone(),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

pub struct FraudSignalPipeline {
    remote: Arc<dyn RemoteInvoker>,
    settings: FraudSettings,
    tracker: TaskTracker,
    cancel: CancellationToken,
    seen: Mutex<HashSet<String>>,
}

impl FraudSignalPipeline {
    pub fn new(remote: Arc<dyn RemoteInvoker>, settings: FraudSettings) -> Self {
        Self {
            remote,
            settings,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// 派发一次评估，返回是否真的派发了
    pub fn trigger(&self, trigger: FraudTrigger) -> bool {
        if !self.settings.enabled || self.cancel.is_cancelled() {
            return false;
        }
        let key = trigger.dedupe_key();
        if !self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone())
        {
            tracing::debug!(key = %key, "重复的风控触发，已忽略");
            return false;
        }

        let remote = self.remote.clone();
        let settings = self.settings.clone();
        let token = self.cancel.child_token();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(key = %key, "风控评估已取消");
                }
                result = evaluate(remote.as_ref(), &settings, &trigger) => match result {
                    Ok(score) if score.flagged => {
                        tracing::warn!(
                            actor = %trigger.actor(),
                            key = %key,
                            risk_score = score.risk_score,
                            reasons = ?score.reasons,
                            "风控评分命中"
                        );
                    }
                    Ok(score) => {
                        tracing::debug!(key = %key, risk_score = score.risk_score, "风控评分完成");
                    }
                    Err(err) => {
                        tracing::warn!(actor = %trigger.actor(), key = %key, error = %err, "风控评分失败");
                    }
                },
            }
        });
        true
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// 等待已派发的评估全部结束
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// 取消尚未完成的评估，之后的触发全部忽略
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn evaluate(
    remote: &dyn RemoteInvoker,
    settings: &FraudSettings,
    trigger: &FraudTrigger,
) -> Result<FraudScore, RemoteScoringError> {
    // 等待触发它的写入落库
    tokio::time::sleep(settings.settle_delay).await;

    let response = tokio::time::timeout(
        settings.timeout,
        remote.invoke(&settings.service_name, trigger.payload()),
    )
    .await
    .map_err(|_| RemoteScoringError::Timeout(settings.timeout))??;

    Ok(serde_json::from_value(response)?)
}
