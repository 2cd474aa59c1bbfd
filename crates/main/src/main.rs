//! 主应用程序入口
//!
//! 按配置装配基础设施，启动一个实时会话并持续输出排行榜、
//! 维护开关和连通性的变化，收到 Ctrl+C 后释放全部订阅退出。

use std::env;

use application::{Connectivity, RealtimeSession};
use config::RealtimeConfig;
use domain::ActorId;
use infrastructure::Infrastructure;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RealtimeConfig::load()?;
    tracing::info!(config = %config.sanitize(), "配置已加载");

    let actor = match env::var("REALTIME_ACTOR_ID") {
        Ok(raw) => ActorId::from(Uuid::parse_str(&raw)?),
        Err(_) => ActorId::from(Uuid::new_v4()),
    };

    let infra = Infrastructure::connect(config).await?;
    let session = infra.session(actor);
    session.start().await;
    tracing::info!(actor = %actor, "实时会话已启动");

    let token = CancellationToken::new();
    let watchers = spawn_watchers(&session, token.clone());

    tokio::signal::ctrl_c().await?;
    tracing::info!("收到退出信号，正在关闭");

    token.cancel();
    for watcher in watchers {
        let _ = watcher.await;
    }
    let report = session.shutdown().await;
    tracing::info!(
        released = report.released,
        failed = report.failed,
        "会话已关闭"
    );
    Ok(())
}

fn spawn_watchers(session: &RealtimeSession, token: CancellationToken) -> Vec<JoinHandle<()>> {
    let mut standings = session.leaderboard().subscribe();
    let mut maintenance = session.maintenance();
    let mut connectivity = session.connectivity();

    let leaderboard_token = token.clone();
    let leaderboard = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = leaderboard_token.cancelled() => break,
                changed = standings.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let top = standings.borrow_and_update().clone();
                    match top.first() {
                        Some(leader) => tracing::info!(
                            entries = top.len(),
                            leader = %leader.actor,
                            score = leader.score,
                            "排行榜已更新"
                        ),
                        None => tracing::info!("排行榜为空"),
                    }
                }
            }
        }
    });

    let status_token = token;
    let status = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = status_token.cancelled() => break,
                changed = maintenance.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let enabled = *maintenance.borrow_and_update();
                    tracing::warn!(enabled, "维护模式变更");
                }
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    match *connectivity.borrow_and_update() {
                        Connectivity::Connected => tracing::info!("传输层已连接"),
                        Connectivity::Degraded => tracing::warn!("传输层连接降级"),
                    }
                }
            }
        }
    });

    vec![leaderboard, status]
}
