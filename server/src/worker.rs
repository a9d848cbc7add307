//! Worker loop: registers with the executor registry, heartbeats, and
//! claims pending matches up to its configured concurrency.

use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::executor_registry::{ExecutorRegistry, run_heartbeat_loop};
use crate::match_runner::MatchRunner;

const CLAIM_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

pub fn worker_id() -> String {
    let hostname = gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{hostname}-{}", Uuid::new_v4().simple())
}

/// Run a worker: membership, heartbeat, and the claim loop. Returns when
/// cancelled, after deregistering.
pub async fn run_worker(
    db: Arc<dyn Database>,
    mut registry: ExecutorRegistry,
    runner: MatchRunner,
    cfg: Arc<Config>,
    cancellation_token: CancellationToken,
) -> Result<()> {
    let worker_id: Arc<str> = worker_id().into();
    registry
        .register(&worker_id, cfg.executor_concurrency, cfg.matches_per_executor, false)
        .await?;

    let heartbeat = tokio::spawn(run_heartbeat_loop(
        registry.clone(),
        worker_id.clone(),
        cfg.heartbeat_interval_secs,
        cancellation_token.clone(),
    ));

    let mut interval = tokio::time::interval(CLAIM_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut running: JoinSet<()> = JoinSet::new();

    info!(worker_id = %worker_id, concurrency = cfg.executor_concurrency, "Worker started");

    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                info!(worker_id = %worker_id, "Worker received shutdown signal");
                break;
            }
            Some(_) = running.join_next(), if !running.is_empty() => {}
            _ = interval.tick() => {
                let free = cfg.executor_concurrency as usize - running.len().min(cfg.executor_concurrency as usize);
                if free == 0 {
                    continue;
                }
                match db.claim_pending_matches(free as i64).await {
                    Ok(claimed) => {
                        for match_id in claimed {
                            let runner = runner.clone();
                            running.spawn(async move {
                                if let Err(e) = runner.run_match(match_id).await {
                                    error!(%match_id, error = %e, "Match task failed");
                                }
                            });
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to claim pending matches");
                    }
                }
            }
        }
    }

    // Let in-flight matches finish, then leave the registry.
    while running.join_next().await.is_some() {}
    let _ = heartbeat.await;
    registry.deregister(&worker_id).await?;
    Ok(())
}
