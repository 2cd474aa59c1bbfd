//! 排行榜投影
//!
//! 分数变更通知触发一次去抖后的完整重算。重算失败时保留上一次的结果，
//! 等下一次通知再试。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use config::LeaderboardConfig;
use domain::{rank_scores, tables, ChangeEvent, ChangeFilter, LeaderboardEntry, Topic};
use thiserror::Error;
use tokio::sync::watch;

use crate::debounce::Debouncer;
use crate::lease::{ChannelLeaseManager, LeaseInfo};
use crate::repository::{RepositoryError, ScoreRepository};
use crate::transport::{ChangeHandler, TransportError};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to load scores: {0}")]
    Load(#[from] RepositoryError),
}

pub type Standings = Arc<Vec<LeaderboardEntry>>;

pub struct LeaderboardProjector {
    scores: Arc<dyn ScoreRepository>,
    top_n: usize,
    debouncer: Debouncer,
    current: watch::Sender<Standings>,
    recomputes: AtomicU64,
}

impl LeaderboardProjector {
    pub fn new(scores: Arc<dyn ScoreRepository>, config: &LeaderboardConfig) -> Self {
        let (current, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            scores,
            top_n: config.top_n,
            debouncer: Debouncer::new(Duration::from_millis(config.debounce_ms)),
            current,
            recomputes: AtomicU64::new(0),
        }
    }

    /// 立即重算并替换当前投影
    pub async fn recompute(&self) -> Result<Standings, ProjectionError> {
        let rows = match self.scores.top_scores(self.top_n).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "排行榜重算失败，保留上一次结果");
                return Err(err.into());
            }
        };

        let standings = Arc::new(rank_scores(rows, self.top_n));
        self.current.send_replace(standings.clone());
        self.recomputes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(entries = standings.len(), "排行榜已更新");
        Ok(standings)
    }

    /// 收到变更通知：取消尚未触发的重算并重新计时
    pub fn notify(self: &Arc<Self>) {
        let projector = Arc::downgrade(self);
        self.debouncer.schedule(async move {
            if let Some(projector) = projector.upgrade() {
                // 错误已在 recompute 内记录
                let _ = projector.recompute().await;
            }
        });
    }

    pub fn current(&self) -> Standings {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Standings> {
        self.current.subscribe()
    }

    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(Ordering::Relaxed)
    }

    /// 订阅排行榜话题上的分数变更
    pub async fn attach(self: &Arc<Self>, leases: &ChannelLeaseManager) -> Result<LeaseInfo, TransportError> {
        let projector = Arc::downgrade(self);
        leases
            .acquire(
                Topic::leaderboard(),
                ChangeFilter::table(tables::PROFILES),
                move || -> ChangeHandler {
                    Arc::new(move |_event: ChangeEvent| {
                        if let Some(projector) = projector.upgrade() {
                            projector.notify();
                        }
                    })
                },
            )
            .await
    }
}
