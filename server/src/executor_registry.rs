//! Executor registry: heartbeat-based membership of worker processes on the
//! bus, and the dynamic match-capacity ceiling derived from it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::config::Config;
use crate::redis_keys::RedisKeys;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorInfo {
    pub worker_id: String,
    pub hostname: String,
    pub concurrency: u32,
    pub matches_per_executor: u32,
    pub is_external: bool,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ExecutorRegistry {
    conn: ConnectionManager,
    keys: RedisKeys,
    stale_threshold: chrono::Duration,
    record_ttl_secs: u64,
    fallback_capacity: u32,
}

impl ExecutorRegistry {
    pub fn new(conn: ConnectionManager, cfg: &Config) -> Self {
        Self {
            conn,
            keys: RedisKeys::new(),
            stale_threshold: cfg.stale_threshold(),
            record_ttl_secs: cfg.executor_record_ttl_secs(),
            fallback_capacity: cfg.fallback_capacity,
        }
    }

    /// Register this executor. Idempotent: re-registering overwrites the
    /// record and refreshes the TTL.
    pub async fn register(
        &mut self,
        worker_id: &str,
        concurrency: u32,
        matches_per_executor: u32,
        is_external: bool,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let hostname = gethostname::gethostname()
            .into_string()
            .unwrap_or_else(|_| "unknown".to_string());
        let key = self.keys.executor_record(worker_id);

        let fields: Vec<(&str, String)> = vec![
            ("hostname", hostname),
            ("concurrency", concurrency.to_string()),
            ("matches_per_executor", matches_per_executor.to_string()),
            ("last_heartbeat", now.clone()),
            ("started_at", now),
            ("is_external", is_external.to_string()),
        ];
        let _: () = self
            .conn
            .hset_multiple(&key, &fields)
            .await
            .context("Failed to write executor record")?;
        let _: () = self
            .conn
            .expire(&key, self.record_ttl_secs as i64)
            .await
            .context("Failed to set executor record TTL")?;
        let _: () = self
            .conn
            .sadd(self.keys.executors_active(), worker_id)
            .await
            .context("Failed to add executor to active set")?;

        info!(worker_id, concurrency, matches_per_executor, is_external, "Executor registered");
        Ok(())
    }

    /// Refresh this executor's heartbeat and TTL. Safe to call concurrently.
    pub async fn heartbeat(&mut self, worker_id: &str) -> Result<()> {
        let key = self.keys.executor_record(worker_id);
        let now = Utc::now().to_rfc3339();
        let _: () = self
            .conn
            .hset(&key, "last_heartbeat", now)
            .await
            .context("Failed to update executor heartbeat")?;
        let _: () = self
            .conn
            .expire(&key, self.record_ttl_secs as i64)
            .await
            .context("Failed to refresh executor record TTL")?;
        let _: () = self
            .conn
            .sadd(self.keys.executors_active(), worker_id)
            .await
            .context("Failed to re-add executor to active set")?;
        Ok(())
    }

    /// Remove this executor. Idempotent.
    pub async fn deregister(&mut self, worker_id: &str) -> Result<()> {
        let _: () = self
            .conn
            .del(self.keys.executor_record(worker_id))
            .await
            .context("Failed to delete executor record")?;
        let _: () = self
            .conn
            .srem(self.keys.executors_active(), worker_id)
            .await
            .context("Failed to remove executor from active set")?;
        info!(worker_id, "Executor deregistered");
        Ok(())
    }

    /// Members whose heartbeat is within the stale threshold. Stale entries
    /// found during the scan are evicted from both the hash and the set.
    pub async fn active_executors(&mut self) -> Result<Vec<ExecutorInfo>> {
        let members: Vec<String> = self
            .conn
            .smembers(self.keys.executors_active())
            .await
            .context("Failed to read active executor set")?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut records = Vec::new();
        for worker_id in members {
            let fields: HashMap<String, String> = self
                .conn
                .hgetall(self.keys.executor_record(&worker_id))
                .await
                .context("Failed to read executor record")?;
            records.push((worker_id, fields));
        }

        let (live, stale) = partition_stale(records, now, self.stale_threshold);

        if !stale.is_empty() {
            for worker_id in &stale {
                let _: () = self.conn.srem(self.keys.executors_active(), worker_id).await?;
                let _: () = self.conn.del(self.keys.executor_record(worker_id)).await?;
            }
            info!(count = stale.len(), "Evicted stale executors");
        }

        Ok(live)
    }

    /// Total concurrent match capacity over the live executor set. Falls
    /// back to the configured constant when the set is empty or the bus
    /// errors; never raises to the scheduler.
    pub async fn match_capacity(&mut self) -> u32 {
        match self.active_executors().await {
            Ok(executors) if executors.is_empty() => {
                info!(fallback = self.fallback_capacity, "No active executors, using fallback capacity");
                self.fallback_capacity
            }
            Ok(executors) => {
                let capacity = total_capacity(&executors);
                trace!(executors = executors.len(), capacity, "Computed match capacity");
                capacity
            }
            Err(e) => {
                warn!(error = %e, fallback = self.fallback_capacity, "Bus error reading executors, using fallback capacity");
                self.fallback_capacity
            }
        }
    }
}

/// Split raw records into live executors and stale worker ids. Records with
/// missing or unparsable fields count as stale.
fn partition_stale(
    records: Vec<(String, HashMap<String, String>)>,
    now: DateTime<Utc>,
    stale_threshold: chrono::Duration,
) -> (Vec<ExecutorInfo>, Vec<String>) {
    let mut live = Vec::new();
    let mut stale = Vec::new();

    for (worker_id, fields) in records {
        if fields.is_empty() {
            stale.push(worker_id);
            continue;
        }
        let heartbeat = fields
            .get("last_heartbeat")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let Some(last_heartbeat) = heartbeat else {
            stale.push(worker_id);
            continue;
        };
        if now - last_heartbeat > stale_threshold {
            stale.push(worker_id);
            continue;
        }
        live.push(ExecutorInfo {
            hostname: fields.get("hostname").cloned().unwrap_or_else(|| "unknown".into()),
            concurrency: fields
                .get("concurrency")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            matches_per_executor: fields
                .get("matches_per_executor")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            is_external: fields.get("is_external").map(|v| v == "true").unwrap_or(false),
            last_heartbeat,
            worker_id,
        });
    }

    (live, stale)
}

fn total_capacity(executors: &[ExecutorInfo]) -> u32 {
    executors.iter().map(|e| e.matches_per_executor).sum()
}

/// Periodic heartbeat loop run by every worker process.
pub async fn run_heartbeat_loop(
    mut registry: ExecutorRegistry,
    worker_id: Arc<str>,
    interval_secs: u64,
    cancellation_token: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(worker_id = %worker_id, "Starting executor heartbeat loop");

    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                info!(worker_id = %worker_id, "Executor heartbeat shutdown received");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = registry.heartbeat(&worker_id).await {
                    error!(worker_id = %worker_id, error = %e, "Failed to send executor heartbeat");
                }
            }
        }
    }
}
