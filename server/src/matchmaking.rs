//! Matchmaking scheduler: a periodic control loop that pairs eligible
//! agents under the live capacity ceiling, plus the stuck-match sweep.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::db::Database;
use crate::db::models::{CandidateAgent, ExecutionMode, MatchType};
use crate::executor_registry::ExecutorRegistry;
use crate::redis_keys::RedisKeys;
use crate::tournament;

/// Expanding Elo windows tried when pairing; if none matches, the two
/// front-runners are paired anyway.
const RATING_WINDOWS: [i32; 3] = [200, 400, 600];

/// Max pairings emitted per tick, bounding the race window against
/// concurrent schedulers.
const MAX_PAIRINGS_PER_TICK: i64 = 3;

const LOCAL_HEARTBEAT_WINDOW_SECS: i64 = 30;

/// Immediate re-kick signal: match completion publishes here so the next
/// tick doesn't wait out the interval. Trait-shaped so tests can observe
/// kicks without a bus.
#[async_trait]
pub trait SchedulerKick: Send + Sync {
    async fn kick(&self);
}

pub struct BusSchedulerKick {
    conn: ConnectionManager,
    keys: RedisKeys,
}

impl BusSchedulerKick {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn, keys: RedisKeys::new() }
    }
}

#[async_trait]
impl SchedulerKick for BusSchedulerKick {
    async fn kick(&self) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.publish::<_, _, ()>(self.keys.scheduler_kick(), b"kick".as_slice()).await {
            warn!(error = %e, "Failed to publish scheduler kick");
        }
    }
}

/// Fairness ordering: fewest active matches first, random tiebreak inside
/// equal counts.
fn order_candidates(candidates: &mut [CandidateAgent], rng: &mut StdRng) {
    candidates.shuffle(rng);
    candidates.sort_by_key(|c| c.active_matches);
}

/// Pick opponents for the front-runner: the smallest rating gap within an
/// expanding window, falling back to the two front-runners.
fn select_pair(candidates: &[CandidateAgent]) -> Option<(usize, usize)> {
    if candidates.len() < 2 {
        return None;
    }
    let anchor = &candidates[0];
    for window in RATING_WINDOWS {
        let best = candidates
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, c)| (i, (c.rating - anchor.rating).abs()))
            .filter(|(_, gap)| *gap <= window)
            .min_by_key(|(_, gap)| *gap);
        if let Some((idx, _)) = best {
            return Some((0, idx));
        }
    }
    Some((0, 1))
}

fn both_local(a: &CandidateAgent, b: &CandidateAgent) -> bool {
    a.execution_mode == ExecutionMode::Local && b.execution_mode == ExecutionMode::Local
}

/// One matchmaking pass. Returns the number of matches created.
pub async fn run_tick(
    db: &dyn Database,
    registry: &mut ExecutorRegistry,
    cfg: &Config,
    rng: &mut StdRng,
) -> Result<usize> {
    if tournament::is_tournament_time(cfg) {
        trace!("Tournament mode active, matchmaking idle");
        return Ok(0);
    }
    let capacity = registry.match_capacity().await;
    run_tick_with_capacity(db, capacity, cfg, rng).await
}

/// The pairing pass, with the capacity ceiling already resolved.
pub async fn run_tick_with_capacity(
    db: &dyn Database,
    capacity: u32,
    cfg: &Config,
    rng: &mut StdRng,
) -> Result<usize> {
    let capacity = capacity as i64;
    let current = db.count_active_matches(MatchType::Matchmaking).await?;
    let mut slots = capacity - current;
    if slots <= 0 {
        trace!(capacity, current, "No matchmaking slots available");
        return Ok(0);
    }

    let mut candidates = db
        .matchmaking_candidates(
            chrono::Duration::seconds(LOCAL_HEARTBEAT_WINDOW_SECS),
            cfg.per_local_cap,
        )
        .await?;
    if candidates.len() < 2 {
        debug!(count = candidates.len(), "Not enough agents for matchmaking");
        return Ok(0);
    }

    let attempts = MAX_PAIRINGS_PER_TICK.min(slots);
    let mut created = 0usize;
    let mut paired_this_tick: std::collections::HashSet<uuid::Uuid> = Default::default();

    for _ in 0..attempts {
        order_candidates(&mut candidates, rng);
        // An agent gets at most one new game per tick.
        let pool: Vec<CandidateAgent> = candidates
            .iter()
            .filter(|c| !paired_this_tick.contains(&c.id))
            .cloned()
            .collect();
        if pool.len() < 2 {
            break;
        }
        let Some((a, b)) = select_pair(&pool) else { break };

        let free_ride = both_local(&pool[a], &pool[b]);
        if !free_ride && slots <= 0 {
            break;
        }

        // Colors are always a coin flip.
        let (white, black) = if rng.gen_bool(0.5) { (&pool[a], &pool[b]) } else { (&pool[b], &pool[a]) };
        let row = db.create_match(white.id, black.id, MatchType::Matchmaking).await?;

        if !free_ride {
            slots -= 1;
        }
        for picked in [&pool[a], &pool[b]] {
            paired_this_tick.insert(picked.id);
            if let Some(c) = candidates.iter_mut().find(|c| c.id == picked.id) {
                c.active_matches += 1;
            }
        }
        created += 1;

        info!(
            match_id = %row.id,
            white = %white.name,
            black = %black.name,
            rating_gap = (pool[a].rating - pool[b].rating).abs(),
            "Scheduled matchmaking game"
        );
    }

    if created > 0 {
        info!(created, "Matchmaking tick complete");
    }
    Ok(created)
}

/// Main matchmaking loop: periodic ticks plus immediate re-kicks published
/// on match completion.
pub async fn run_matchmaking_loop(
    db: Arc<dyn Database>,
    mut registry: ExecutorRegistry,
    cfg: Arc<Config>,
    cancellation_token: CancellationToken,
) {
    info!("Starting matchmaking loop");
    let keys = RedisKeys::new();
    let mut kick_rx = crate::bus::subscribe(cfg.redis_url.clone(), vec![keys.scheduler_kick().to_string()]);

    let mut tick_interval = tokio::time::interval(cfg.matchmaking_tick);
    tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut rng = StdRng::from_entropy();

    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                info!("Matchmaking loop received shutdown signal");
                break;
            }
            _ = tick_interval.tick() => {}
            msg = kick_rx.recv() => {
                if msg.is_none() {
                    warn!("Scheduler kick subscription closed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
                debug!("Matchmaking re-kicked");
            }
        }

        if let Err(e) = run_tick(db.as_ref(), &mut registry, &cfg, &mut rng).await {
            error!(error = %e, "Matchmaking tick failed");
        }
    }
}

/// Stuck-match sweep: converts matches stuck in progress past the age limit
/// to error(stuck_timeout) and re-kicks matchmaking.
pub async fn run_stuck_sweep(
    db: Arc<dyn Database>,
    kick: Arc<dyn SchedulerKick>,
    cfg: Arc<Config>,
    cancellation_token: CancellationToken,
) {
    info!("Starting stuck-match sweep");
    let mut interval = tokio::time::interval(cfg.stuck_sweep_tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                info!("Stuck-match sweep shutting down");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = sweep_stuck_matches(db.as_ref(), kick.as_ref(), &cfg).await {
                    error!(error = %e, "Stuck-match sweep failed");
                }
            }
        }
    }
}

pub async fn sweep_stuck_matches(
    db: &dyn Database,
    kick: &dyn SchedulerKick,
    cfg: &Config,
) -> Result<usize> {
    let cutoff = Utc::now() - cfg.stuck_match_age;
    let stuck = db.stuck_matches(cutoff).await?;
    if stuck.is_empty() {
        return Ok(0);
    }

    let ids: Vec<_> = stuck.iter().map(|(id, _)| *id).collect();
    let updated = db.fail_stuck_matches(&ids).await?;
    warn!(count = updated, "Converted stuck matches to error(stuck_timeout)");

    if stuck.iter().any(|(_, t)| *t == MatchType::Matchmaking) {
        kick.kick().await;
    }
    Ok(stuck.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn candidate(rating: i32, active: i64, mode: ExecutionMode) -> CandidateAgent {
        CandidateAgent {
            id: Uuid::new_v4(),
            name: format!("agent-{rating}"),
            execution_mode: mode,
            rating,
            games_played: 10,
            active_matches: active,
        }
    }

    #[test]
    fn pairs_closest_rating_within_first_window() {
        let candidates = vec![
            candidate(1500, 0, ExecutionMode::Server),
            candidate(1490, 0, ExecutionMode::Server),
            candidate(1520, 0, ExecutionMode::Server),
            candidate(2500, 0, ExecutionMode::Server),
        ];
        let (a, b) = select_pair(&candidates).unwrap();
        assert_eq!(a, 0);
        assert_eq!(candidates[b].rating, 1490);
    }

    #[test]
    fn window_expands_when_nothing_is_close() {
        let candidates = vec![
            candidate(1500, 0, ExecutionMode::Server),
            candidate(1890, 0, ExecutionMode::Server),
            candidate(2080, 0, ExecutionMode::Server),
        ];
        // Nothing within 200; 1890 lands in the 400 window.
        let (_, b) = select_pair(&candidates).unwrap();
        assert_eq!(candidates[b].rating, 1890);
    }

    #[test]
    fn falls_back_to_front_runners() {
        let candidates = vec![
            candidate(1000, 0, ExecutionMode::Server),
            candidate(2500, 0, ExecutionMode::Server),
            candidate(2600, 0, ExecutionMode::Server),
        ];
        assert_eq!(select_pair(&candidates), Some((0, 1)));
    }

    #[test]
    fn single_candidate_yields_no_pair() {
        let candidates = vec![candidate(1500, 0, ExecutionMode::Server)];
        assert_eq!(select_pair(&candidates), None);
    }

    #[test]
    fn ordering_prefers_fewest_active_matches() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut candidates = vec![
            candidate(1500, 2, ExecutionMode::Server),
            candidate(1600, 0, ExecutionMode::Server),
            candidate(1700, 1, ExecutionMode::Server),
        ];
        order_candidates(&mut candidates, &mut rng);
        let counts: Vec<i64> = candidates.iter().map(|c| c.active_matches).collect();
        assert_eq!(counts, vec![0, 1, 2]);
    }

    #[test]
    fn local_local_pairs_ride_free() {
        let a = candidate(1500, 0, ExecutionMode::Local);
        let b = candidate(1510, 0, ExecutionMode::Local);
        let c = candidate(1520, 0, ExecutionMode::Server);
        assert!(both_local(&a, &b));
        assert!(!both_local(&a, &c));
    }
}
