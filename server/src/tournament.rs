//! Swiss tournament controller: bracket snapshot at a fixed instant,
//! standings projected from completed matches each tick, stateless pairing
//! emission one round at a time.

use anyhow::{Context, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::db::models::{CandidateAgent, MatchType, Winner};
use crate::redis_keys::RedisKeys;

const BRACKET_SNAPSHOT_TTL_SECS: u64 = 24 * 60 * 60;
const SMALL_FIELD_CUTOFF: usize = 8;

/// Tournament mode is a pure function of wall clock against the configured
/// start; no flag is stored anywhere.
pub fn is_tournament_time(cfg: &Config) -> bool {
    match cfg.tournament_start {
        Some(start) => Utc::now() >= start,
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bracket {
    Challenger,
    Contender,
    Elite,
}

impl Bracket {
    pub const ALL: [Bracket; 3] = [Bracket::Challenger, Bracket::Contender, Bracket::Elite];

    pub fn as_str(self) -> &'static str {
        match self {
            Bracket::Challenger => "challenger",
            Bracket::Contender => "contender",
            Bracket::Elite => "elite",
        }
    }

    /// Concurrency ceiling: the wide middle bracket gets one extra slot.
    pub fn max_concurrent(self) -> i64 {
        match self {
            Bracket::Contender => 3,
            Bracket::Challenger | Bracket::Elite => 2,
        }
    }
}

/// Bracket membership snapshot, fixed for the whole tournament.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BracketAssignments {
    pub challenger: Vec<Uuid>,
    pub contender: Vec<Uuid>,
    pub elite: Vec<Uuid>,
}

impl BracketAssignments {
    pub fn members(&self, bracket: Bracket) -> &[Uuid] {
        match bracket {
            Bracket::Challenger => &self.challenger,
            Bracket::Contender => &self.contender,
            Bracket::Elite => &self.elite,
        }
    }
}

/// Split agents (already sorted by rating ascending) into brackets: bottom
/// 25% challenger, middle 50% contender, top 25% elite. Small fields all go
/// to contender.
pub fn split_brackets(ranked_ids: &[Uuid]) -> BracketAssignments {
    let total = ranked_ids.len();
    if total == 0 {
        return BracketAssignments::default();
    }
    if total < SMALL_FIELD_CUTOFF {
        return BracketAssignments {
            contender: ranked_ids.to_vec(),
            ..Default::default()
        };
    }
    let bottom_end = ((total as f64) * 0.25).round().max(1.0) as usize;
    let top_start = (((total as f64) * 0.75).round() as usize).max(bottom_end);
    BracketAssignments {
        challenger: ranked_ids[..bottom_end].to_vec(),
        contender: ranked_ids[bottom_end..top_start].to_vec(),
        elite: ranked_ids[top_start..].to_vec(),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Standing {
    pub points: f64,
    pub matches_played: u32,
    pub opponents: Vec<Uuid>,
    pub buchholz: f64,
}

/// Project Swiss standings for one bracket from its completed tournament
/// matches: +1 for a win, +0.5 each for a draw, Buchholz as the sum of
/// opponents' points.
pub fn compute_standings(
    bracket_ids: &[Uuid],
    matches: &[crate::db::models::MatchOutcome],
) -> HashMap<Uuid, Standing> {
    let mut standings: HashMap<Uuid, Standing> =
        bracket_ids.iter().map(|id| (*id, Standing::default())).collect();

    for m in matches {
        if !standings.contains_key(&m.white_agent_id) || !standings.contains_key(&m.black_agent_id)
        {
            continue;
        }
        for (me, opp) in [
            (m.white_agent_id, m.black_agent_id),
            (m.black_agent_id, m.white_agent_id),
        ] {
            let entry = standings.get_mut(&me).expect("bracket member");
            if !entry.opponents.contains(&opp) {
                entry.opponents.push(opp);
                entry.matches_played += 1;
            }
        }
        match m.winner {
            Some(Winner::White) => standings.get_mut(&m.white_agent_id).unwrap().points += 1.0,
            Some(Winner::Black) => standings.get_mut(&m.black_agent_id).unwrap().points += 1.0,
            _ => {
                standings.get_mut(&m.white_agent_id).unwrap().points += 0.5;
                standings.get_mut(&m.black_agent_id).unwrap().points += 0.5;
            }
        }
    }

    let points: HashMap<Uuid, f64> = standings.iter().map(|(id, s)| (*id, s.points)).collect();
    for standing in standings.values_mut() {
        standing.buchholz = standing
            .opponents
            .iter()
            .filter_map(|opp| points.get(opp))
            .sum();
    }
    standings
}

/// Number of Swiss rounds: at least 3 when the field allows, never more
/// than n-1.
pub fn total_rounds(num_agents: usize) -> u32 {
    if num_agents < 2 {
        return 0;
    }
    let log_rounds = (num_agents as f64).log2().ceil() as u32;
    log_rounds.max(3).min(num_agents as u32 - 1)
}

pub fn current_round(standings: &HashMap<Uuid, Standing>, total_rounds: u32) -> u32 {
    if standings.is_empty() {
        return 1;
    }
    let max_played = standings.values().map(|s| s.matches_played).max().unwrap_or(0);
    let min_played = standings.values().map(|s| s.matches_played).min().unwrap_or(0);
    if min_played == max_played {
        (max_played + 1).min(total_rounds)
    } else {
        max_played.min(total_rounds)
    }
}

pub fn bracket_complete(standings: &HashMap<Uuid, Standing>, total_rounds: u32) -> bool {
    match standings.values().map(|s| s.matches_played).min() {
        Some(min_played) => min_played >= total_rounds,
        None => false,
    }
}

/// Swiss pairing for one round: order by (-points, -buchholz, -rating) with
/// a shuffle inside equal-score groups, then a greedy sweep pairing each
/// player with the nearest-score opponent they have not played.
pub fn swiss_pairing(
    agents: &[CandidateAgent],
    standings: &HashMap<Uuid, Standing>,
    rng: &mut StdRng,
) -> Vec<(Uuid, Uuid)> {
    if agents.len() < 2 {
        return Vec::new();
    }

    // Drop players who have already faced every possible opponent.
    let max_opponents = agents.len() - 1;
    let mut eligible: Vec<&CandidateAgent> = agents
        .iter()
        .filter(|a| {
            standings
                .get(&a.id)
                .map(|s| s.opponents.len() < max_opponents)
                .unwrap_or(true)
        })
        .collect();
    if eligible.len() < 2 {
        return Vec::new();
    }

    let score = |id: Uuid| -> (f64, f64) {
        standings
            .get(&id)
            .map(|s| (s.points, s.buchholz))
            .unwrap_or((0.0, 0.0))
    };

    eligible.sort_by(|a, b| {
        let (pa, ba) = score(a.id);
        let (pb, bb) = score(b.id);
        pb.total_cmp(&pa)
            .then(bb.total_cmp(&ba))
            .then(b.rating.cmp(&a.rating))
    });

    // Shuffle within equal-score groups, preserving the score order.
    let mut ordered: Vec<&CandidateAgent> = Vec::with_capacity(eligible.len());
    let mut group: Vec<&CandidateAgent> = Vec::new();
    let mut group_points: Option<f64> = None;
    for agent in eligible {
        let points = score(agent.id).0;
        if group_points.map(|g| g != points).unwrap_or(false) {
            group.shuffle(rng);
            ordered.append(&mut group);
        }
        group_points = Some(points);
        group.push(agent);
    }
    group.shuffle(rng);
    ordered.append(&mut group);

    let played = |a: Uuid, b: Uuid| -> bool {
        standings.get(&a).map(|s| s.opponents.contains(&b)).unwrap_or(false)
    };

    let mut pairings = Vec::new();
    let mut paired = std::collections::HashSet::new();
    for (i, first) in ordered.iter().enumerate() {
        if paired.contains(&first.id) {
            continue;
        }
        let mut best: Option<(usize, f64)> = None;
        for (j, second) in ordered.iter().enumerate().skip(i + 1) {
            if paired.contains(&second.id) || played(first.id, second.id) {
                continue;
            }
            let gap = (score(first.id).0 - score(second.id).0).abs();
            if best.map(|(_, g)| gap < g).unwrap_or(true) {
                best = Some((j, gap));
            }
        }
        if let Some((j, _)) = best {
            paired.insert(first.id);
            paired.insert(ordered[j].id);
            // Colors are a coin flip.
            if rng.gen_bool(0.5) {
                pairings.push((first.id, ordered[j].id));
            } else {
                pairings.push((ordered[j].id, first.id));
            }
        }
    }
    pairings
}

pub struct TournamentController {
    db: Arc<dyn Database>,
    conn: ConnectionManager,
    keys: RedisKeys,
    cfg: Arc<Config>,
}

impl TournamentController {
    pub fn new(db: Arc<dyn Database>, conn: ConnectionManager, cfg: Arc<Config>) -> Self {
        Self { db, conn, keys: RedisKeys::new(), cfg }
    }

    async fn load_snapshot(&self) -> Result<Option<BracketAssignments>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.keys.tournament_brackets())
            .await
            .context("Failed to read bracket snapshot")?;
        match raw {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("Corrupt bracket snapshot")?,
            )),
            None => Ok(None),
        }
    }

    async fn store_snapshot(&self, brackets: &BracketAssignments) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(brackets)?;
        let _: () = conn
            .set_ex(self.keys.tournament_brackets(), json, BRACKET_SNAPSHOT_TTL_SECS)
            .await
            .context("Failed to store bracket snapshot")?;
        Ok(())
    }

    /// One-shot, idempotent tournament initialization: cancel every live
    /// non-tournament match, deactivate local agents, snapshot brackets.
    /// All later bracket lookups read the snapshot, never recompute.
    pub async fn initialize(&self) -> Result<BracketAssignments> {
        if let Some(existing) = self.load_snapshot().await? {
            return Ok(existing);
        }

        let cancelled = self.db.cancel_non_tournament_matches().await?;
        let deactivated = self.db.deactivate_local_agents().await?;
        info!(cancelled, deactivated, "Tournament initialization: cleared the field");

        let ranked = self.db.ranked_server_agents().await?;
        let ids: Vec<Uuid> = ranked.iter().map(|(id, _)| *id).collect();
        let brackets = split_brackets(&ids);
        self.store_snapshot(&brackets).await?;
        info!(
            challenger = brackets.challenger.len(),
            contender = brackets.contender.len(),
            elite = brackets.elite.len(),
            "Tournament brackets snapshot stored"
        );
        Ok(brackets)
    }

    pub async fn tick(&self, rng: &mut StdRng) -> Result<usize> {
        let brackets = self.initialize().await?;
        let mut created = 0;
        for bracket in Bracket::ALL {
            created +=
                schedule_bracket(self.db.as_ref(), bracket, brackets.members(bracket), rng).await?;
        }
        Ok(created)
    }
}

/// Schedule one bracket for one tick. Rounds are barriers: while any
/// bracket match is in flight, nothing new is paired.
pub async fn schedule_bracket(
    db: &dyn Database,
    bracket: Bracket,
    members: &[Uuid],
    rng: &mut StdRng,
) -> Result<usize> {
    if members.len() < 2 {
        debug!(bracket = bracket.as_str(), count = members.len(), "Bracket too small");
        return Ok(0);
    }

    let agents = db.bracket_agents(members).await?;
    let outcomes = db.completed_tournament_matches(members).await?;
    let standings = compute_standings(members, &outcomes);

    let rounds = total_rounds(agents.len());
    if bracket_complete(&standings, rounds) {
        debug!(bracket = bracket.as_str(), rounds, "Bracket complete");
        return Ok(0);
    }

    let active = db.count_active_tournament_matches(members).await?;
    if active > 0 {
        debug!(bracket = bracket.as_str(), active, "Waiting for round to finish");
        return Ok(0);
    }

    let round = current_round(&standings, rounds);
    let pairings = swiss_pairing(&agents, &standings, rng);
    if pairings.is_empty() {
        debug!(bracket = bracket.as_str(), round, "No valid pairings");
        return Ok(0);
    }

    let ceiling = bracket.max_concurrent();
    let mut created = 0i64;
    for (white, black) in pairings {
        if created >= ceiling {
            break;
        }
        // Re-check against the store in case a concurrent tick got here
        // first.
        if db.tournament_pair_exists(white, black).await? {
            continue;
        }
        let row = db.create_match(white, black, MatchType::Tournament).await?;
        created += 1;
        info!(
            bracket = bracket.as_str(),
            round,
            match_id = %row.id,
            %white,
            %black,
            "Scheduled tournament game"
        );
    }
    Ok(created as usize)
}

/// Tournament loop: idles until the configured start instant, then runs
/// the Swiss scheduler every tick.
pub async fn run_tournament_loop(
    controller: TournamentController,
    cfg: Arc<Config>,
    cancellation_token: CancellationToken,
) {
    info!("Starting tournament loop");
    let mut interval = tokio::time::interval(cfg.tournament_tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut rng = StdRng::from_entropy();

    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                info!("Tournament loop received shutdown signal");
                break;
            }
            _ = interval.tick() => {
                if !is_tournament_time(&cfg) {
                    continue;
                }
                if let Err(e) = controller.tick(&mut rng).await {
                    error!(error = %e, "Tournament tick failed");
                }
            }
        }
    }
}
