//! Shared test fixtures: an in-memory Database, a scripted local-agent
//! bridge driven by the reconstruction cache, and a recording scheduler
//! kick.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use common::frames::MovePayload;
use common::{Board, Color};
use server::bridge::{BridgeError, GameContextCache, LiveAgentClient, MoveResponse};
use server::config::Config;
use server::db::Database;
use server::db::models::*;
use server::matchmaking::SchedulerKick;

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://unused".to_string(),
        redis_url: "redis://unused".to_string(),
        agent_timeout_secs: 16.0,
        dispatch_buffer_secs: 5.0,
        check_buffer_secs: 1.0,
        heartbeat_interval_secs: 10,
        stale_threshold_secs: 30,
        matches_per_executor: 4,
        executor_concurrency: 8,
        fallback_capacity: 8,
        per_local_cap: 4,
        max_connections_total: 100,
        max_message_bytes: 100 * 1024,
        game_time_budget_secs: 300,
        max_moves: 500,
        exhibition_move_delay: std::time::Duration::from_millis(0),
        tournament_start: None,
        ws_port: 0,
        tcp_port: 0,
        matchmaking_tick: std::time::Duration::from_secs(5),
        stuck_sweep_tick: std::time::Duration::from_secs(60),
        stuck_match_age: chrono::Duration::minutes(5),
        tournament_tick: std::time::Duration::from_secs(5),
        validation_tick: std::time::Duration::from_secs(10),
    }
}

#[derive(Default)]
struct Store {
    agents: HashMap<Uuid, Agent>,
    rankings: HashMap<Uuid, Ranking>,
    matches: HashMap<Uuid, MatchRow>,
    game_states: Vec<GameStateRow>,
    connections: Vec<LocalAgentConnection>,
    validation: HashMap<Uuid, ValidationEntry>,
}

/// In-memory Database implementation mirroring the Postgres semantics the
/// core relies on.
#[derive(Default)]
pub struct MemoryDatabase {
    store: Mutex<Store>,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_agent(&self, execution_mode: ExecutionMode, code_blob: &str, rating: i32) -> Uuid {
        let id = Uuid::new_v4();
        let mut store = self.store.lock().unwrap();
        let name = format!("agent-{}", store.agents.len());
        store.agents.insert(
            id,
            Agent {
                id,
                owner_id: Uuid::new_v4(),
                name,
                version: 1,
                code_blob: code_blob.to_string(),
                code_hash: format!("hash-{id}"),
                execution_mode,
                active: true,
                connection_token_hash: None,
                created_at: Utc::now(),
            },
        );
        store.rankings.insert(
            id,
            Ranking {
                agent_id: id,
                rating,
                games_played: 1,
                wins: 1,
                losses: 0,
                draws: 0,
                avg_move_time_ms: None,
                last_updated: Utc::now(),
            },
        );
        id
    }

    pub fn connect_agent(&self, agent_id: Uuid) {
        let mut store = self.store.lock().unwrap();
        store.connections.push(LocalAgentConnection {
            id: Uuid::new_v4(),
            agent_id,
            transport: Transport::Ws,
            status: ConnectionStatus::Connected,
            connected_at: Utc::now(),
            disconnected_at: None,
            last_heartbeat: Utc::now(),
            remote_addr: None,
        });
    }

    pub fn set_games_played(&self, agent_id: Uuid, games: i32) {
        let mut store = self.store.lock().unwrap();
        if let Some(r) = store.rankings.get_mut(&agent_id) {
            r.games_played = games;
        }
    }

    pub fn backdate_match_start(&self, match_id: Uuid, minutes: i64) {
        let mut store = self.store.lock().unwrap();
        if let Some(m) = store.matches.get_mut(&match_id) {
            m.started_at = Some(Utc::now() - chrono::Duration::minutes(minutes));
        }
    }

    pub fn push_validation_entry(&self, code_blob: &str, code_hash: &str) -> Uuid {
        let id = Uuid::new_v4();
        let mut store = self.store.lock().unwrap();
        store.validation.insert(
            id,
            ValidationEntry {
                id,
                owner_id: Uuid::new_v4(),
                code_blob: code_blob.to_string(),
                name: "candidate".to_string(),
                version: 1,
                code_hash: code_hash.to_string(),
                status: ValidationStatus::Pending,
                error: None,
                test_duration_ms: None,
                agent_id: None,
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn validation_entry(&self, id: Uuid) -> Option<ValidationEntry> {
        self.store.lock().unwrap().validation.get(&id).cloned()
    }

    pub fn agent_count(&self) -> usize {
        self.store.lock().unwrap().agents.len()
    }

    pub fn matches_of_type(&self, match_type: MatchType) -> Vec<MatchRow> {
        self.store
            .lock()
            .unwrap()
            .matches
            .values()
            .filter(|m| m.match_type == match_type)
            .cloned()
            .collect()
    }

    fn active_matchmaking_count(store: &Store, agent_id: Uuid) -> i64 {
        store
            .matches
            .values()
            .filter(|m| {
                m.match_type == MatchType::Matchmaking
                    && matches!(m.status, MatchStatus::Pending | MatchStatus::InProgress)
                    && (m.white_agent_id == agent_id || m.black_agent_id == agent_id)
            })
            .count() as i64
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<Agent>> {
        Ok(self.store.lock().unwrap().agents.get(&agent_id).cloned())
    }

    async fn get_agent_by_code_hash(&self, code_hash: &str) -> Result<Option<Agent>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .agents
            .values()
            .find(|a| a.code_hash == code_hash)
            .cloned())
    }

    async fn create_agent(&self, agent: NewAgent) -> Result<Agent> {
        let id = Uuid::new_v4();
        let row = Agent {
            id,
            owner_id: agent.owner_id,
            name: agent.name,
            version: agent.version,
            code_blob: agent.code_blob,
            code_hash: agent.code_hash,
            execution_mode: agent.execution_mode,
            active: true,
            connection_token_hash: agent.connection_token_hash,
            created_at: Utc::now(),
        };
        self.store.lock().unwrap().agents.insert(id, row.clone());
        Ok(row)
    }

    async fn deactivate_local_agents(&self) -> Result<u64> {
        let mut store = self.store.lock().unwrap();
        let mut count = 0;
        for agent in store.agents.values_mut() {
            if agent.execution_mode == ExecutionMode::Local && agent.active {
                agent.active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn authenticate_local_agent(
        &self,
        agent_id: Uuid,
        token_hash: &str,
    ) -> Result<Option<Agent>> {
        Ok(self.store.lock().unwrap().agents.get(&agent_id).cloned().filter(|a| {
            a.execution_mode == ExecutionMode::Local
                && a.active
                && a.connection_token_hash.as_deref() == Some(token_hash)
        }))
    }

    async fn create_ranking(&self, agent_id: Uuid) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        store.rankings.entry(agent_id).or_insert(Ranking {
            agent_id,
            rating: 1500,
            games_played: 0,
            wins: 0,
            losses: 0,
            draws: 0,
            avg_move_time_ms: None,
            last_updated: Utc::now(),
        });
        Ok(())
    }

    async fn get_ranking(&self, agent_id: Uuid) -> Result<Option<Ranking>> {
        Ok(self.store.lock().unwrap().rankings.get(&agent_id).cloned())
    }

    async fn rating_context(&self, match_id: Uuid) -> Result<Option<RatingContext>> {
        let store = self.store.lock().unwrap();
        let Some(m) = store.matches.get(&match_id) else { return Ok(None) };
        if m.status != MatchStatus::Completed {
            return Ok(None);
        }
        let (Some(white), Some(black)) = (
            store.rankings.get(&m.white_agent_id),
            store.rankings.get(&m.black_agent_id),
        ) else {
            return Ok(None);
        };
        Ok(Some(RatingContext {
            white_agent_id: m.white_agent_id,
            black_agent_id: m.black_agent_id,
            winner: m.winner,
            white_rating: white.rating,
            white_games: white.games_played,
            black_rating: black.rating,
            black_games: black.games_played,
        }))
    }

    async fn apply_rating_updates(&self, updates: &[RatingUpdate]) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        for update in updates {
            if let Some(r) = store.rankings.get_mut(&update.agent_id) {
                r.rating += update.change;
                match update.outcome {
                    GameOutcome::Win => r.wins += 1,
                    GameOutcome::Loss => r.losses += 1,
                    GameOutcome::Draw => r.draws += 1,
                }
                if let Some(avg) = update.avg_move_time_ms {
                    r.avg_move_time_ms = Some(match r.avg_move_time_ms {
                        None => avg,
                        Some(prev) => {
                            (prev * r.games_played as i64 + avg) / (r.games_played as i64 + 1)
                        }
                    });
                }
                r.games_played += 1;
                r.last_updated = Utc::now();
            }
        }
        Ok(())
    }

    async fn create_match(
        &self,
        white_agent_id: Uuid,
        black_agent_id: Uuid,
        match_type: MatchType,
    ) -> Result<MatchRow> {
        let id = Uuid::new_v4();
        let row = MatchRow {
            id,
            white_agent_id,
            black_agent_id,
            match_type,
            status: MatchStatus::Pending,
            winner: None,
            moves: 0,
            termination: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.store.lock().unwrap().matches.insert(id, row.clone());
        Ok(row)
    }

    async fn get_match(&self, match_id: Uuid) -> Result<Option<MatchRow>> {
        Ok(self.store.lock().unwrap().matches.get(&match_id).cloned())
    }

    async fn match_status(&self, match_id: Uuid) -> Result<Option<MatchStatus>> {
        Ok(self.store.lock().unwrap().matches.get(&match_id).map(|m| m.status))
    }

    async fn mark_match_started(&self, match_id: Uuid) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(m) = store.matches.get_mut(&match_id) {
            if !m.status.is_terminal() {
                m.status = MatchStatus::InProgress;
                m.started_at.get_or_insert_with(Utc::now);
            }
        }
        Ok(())
    }

    async fn complete_match(
        &self,
        match_id: Uuid,
        winner: Option<Winner>,
        moves: i32,
        termination: Termination,
    ) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(m) = store.matches.get_mut(&match_id) {
            m.status = MatchStatus::Completed;
            m.winner = winner;
            m.moves = moves;
            m.termination = Some(termination.as_str().to_string());
            m.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn fail_match(&self, match_id: Uuid, termination: Termination) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(m) = store.matches.get_mut(&match_id) {
            m.status = MatchStatus::Error;
            m.termination = Some(termination.as_str().to_string());
            m.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn delete_match(&self, match_id: Uuid) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        store.game_states.retain(|s| s.match_id != match_id);
        store.matches.remove(&match_id);
        Ok(())
    }

    async fn claim_pending_matches(&self, limit: i64) -> Result<Vec<Uuid>> {
        let mut store = self.store.lock().unwrap();
        let ids: Vec<Uuid> = store
            .matches
            .values()
            .filter(|m| m.status == MatchStatus::Pending)
            .map(|m| m.id)
            .take(limit as usize)
            .collect();
        for id in &ids {
            if let Some(m) = store.matches.get_mut(id) {
                m.status = MatchStatus::InProgress;
                m.started_at = Some(Utc::now());
            }
        }
        Ok(ids)
    }

    async fn count_active_matches(&self, match_type: MatchType) -> Result<i64> {
        let store = self.store.lock().unwrap();
        Ok(store
            .matches
            .values()
            .filter(|m| {
                m.match_type == match_type
                    && matches!(m.status, MatchStatus::Pending | MatchStatus::InProgress)
            })
            .count() as i64)
    }

    async fn cancel_non_tournament_matches(&self) -> Result<u64> {
        let mut store = self.store.lock().unwrap();
        let mut count = 0;
        for m in store.matches.values_mut() {
            if m.match_type != MatchType::Tournament
                && matches!(m.status, MatchStatus::Pending | MatchStatus::InProgress)
            {
                m.status = MatchStatus::Cancelled;
                m.completed_at = Some(Utc::now());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn stuck_matches(&self, cutoff: DateTime<Utc>) -> Result<Vec<(Uuid, MatchType)>> {
        let store = self.store.lock().unwrap();
        Ok(store
            .matches
            .values()
            .filter(|m| {
                m.status == MatchStatus::InProgress
                    && m.started_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|m| (m.id, m.match_type))
            .collect())
    }

    async fn fail_stuck_matches(&self, match_ids: &[Uuid]) -> Result<u64> {
        let mut store = self.store.lock().unwrap();
        let mut count = 0;
        for id in match_ids {
            if let Some(m) = store.matches.get_mut(id) {
                m.status = MatchStatus::Error;
                m.termination = Some(Termination::StuckTimeout.as_str().to_string());
                m.completed_at = Some(Utc::now());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn completed_tournament_matches(&self, agent_ids: &[Uuid]) -> Result<Vec<MatchOutcome>> {
        let store = self.store.lock().unwrap();
        Ok(store
            .matches
            .values()
            .filter(|m| {
                m.match_type == MatchType::Tournament
                    && m.status == MatchStatus::Completed
                    && agent_ids.contains(&m.white_agent_id)
                    && agent_ids.contains(&m.black_agent_id)
            })
            .map(|m| MatchOutcome {
                white_agent_id: m.white_agent_id,
                black_agent_id: m.black_agent_id,
                winner: m.winner,
            })
            .collect())
    }

    async fn count_active_tournament_matches(&self, agent_ids: &[Uuid]) -> Result<i64> {
        let store = self.store.lock().unwrap();
        Ok(store
            .matches
            .values()
            .filter(|m| {
                m.match_type == MatchType::Tournament
                    && matches!(m.status, MatchStatus::Pending | MatchStatus::InProgress)
                    && agent_ids.contains(&m.white_agent_id)
                    && agent_ids.contains(&m.black_agent_id)
            })
            .count() as i64)
    }

    async fn tournament_pair_exists(&self, a: Uuid, b: Uuid) -> Result<bool> {
        let store = self.store.lock().unwrap();
        Ok(store.matches.values().any(|m| {
            m.match_type == MatchType::Tournament
                && ((m.white_agent_id == a && m.black_agent_id == b)
                    || (m.white_agent_id == b && m.black_agent_id == a))
        }))
    }

    async fn insert_game_state(&self, state: &GameStateRow) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        // Unique on (match_id, move_number), first write wins.
        let exists = store
            .game_states
            .iter()
            .any(|s| s.match_id == state.match_id && s.move_number == state.move_number);
        if !exists {
            store.game_states.push(state.clone());
        }
        Ok(())
    }

    async fn game_states(&self, match_id: Uuid) -> Result<Vec<GameStateRow>> {
        let mut states: Vec<GameStateRow> = self
            .store
            .lock()
            .unwrap()
            .game_states
            .iter()
            .filter(|s| s.match_id == match_id)
            .cloned()
            .collect();
        states.sort_by_key(|s| s.move_number);
        Ok(states)
    }

    async fn delete_game_states(&self, match_id: Uuid) -> Result<u64> {
        let mut store = self.store.lock().unwrap();
        let before = store.game_states.len();
        store.game_states.retain(|s| s.match_id != match_id);
        Ok((before - store.game_states.len()) as u64)
    }

    async fn move_time_averages(&self, match_id: Uuid) -> Result<(Option<i64>, Option<i64>)> {
        let store = self.store.lock().unwrap();
        let avg = |parity: i32| -> Option<i64> {
            let times: Vec<i64> = store
                .game_states
                .iter()
                .filter(|s| {
                    s.match_id == match_id && s.move_number > 0 && s.move_number % 2 == parity
                })
                .map(|s| s.move_time_ms)
                .collect();
            if times.is_empty() {
                None
            } else {
                Some(times.iter().sum::<i64>() / times.len() as i64)
            }
        };
        Ok((avg(1), avg(0)))
    }

    async fn open_connection(
        &self,
        agent_id: Uuid,
        transport: Transport,
        remote_addr: Option<&str>,
    ) -> Result<Uuid> {
        let mut store = self.store.lock().unwrap();
        for conn in store.connections.iter_mut() {
            if conn.agent_id == agent_id && conn.status != ConnectionStatus::Disconnected {
                conn.status = ConnectionStatus::Disconnected;
                conn.disconnected_at = Some(Utc::now());
            }
        }
        let id = Uuid::new_v4();
        store.connections.push(LocalAgentConnection {
            id,
            agent_id,
            transport,
            status: ConnectionStatus::Connected,
            connected_at: Utc::now(),
            disconnected_at: None,
            last_heartbeat: Utc::now(),
            remote_addr: remote_addr.map(|s| s.to_string()),
        });
        Ok(id)
    }

    async fn close_connections(&self, agent_id: Uuid) -> Result<u64> {
        let mut store = self.store.lock().unwrap();
        let mut count = 0;
        for conn in store.connections.iter_mut() {
            if conn.agent_id == agent_id && conn.status != ConnectionStatus::Disconnected {
                conn.status = ConnectionStatus::Disconnected;
                conn.disconnected_at = Some(Utc::now());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn set_connection_status(&self, agent_id: Uuid, status: ConnectionStatus) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        for conn in store.connections.iter_mut() {
            if conn.agent_id == agent_id && conn.status != ConnectionStatus::Disconnected {
                conn.status = status;
                conn.last_heartbeat = Utc::now();
            }
        }
        Ok(())
    }

    async fn touch_connection_heartbeat(&self, agent_id: Uuid) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        for conn in store.connections.iter_mut() {
            if conn.agent_id == agent_id && conn.status != ConnectionStatus::Disconnected {
                conn.last_heartbeat = Utc::now();
            }
        }
        Ok(())
    }

    async fn open_connection_count(&self, agent_id: Uuid) -> Result<i64> {
        let store = self.store.lock().unwrap();
        Ok(store
            .connections
            .iter()
            .filter(|c| c.agent_id == agent_id && c.status != ConnectionStatus::Disconnected)
            .count() as i64)
    }

    async fn matchmaking_candidates(
        &self,
        heartbeat_window: chrono::Duration,
        per_local_cap: i64,
    ) -> Result<Vec<CandidateAgent>> {
        let store = self.store.lock().unwrap();
        let cutoff = Utc::now() - heartbeat_window;
        let mut out = Vec::new();
        for agent in store.agents.values().filter(|a| a.active) {
            let active = Self::active_matchmaking_count(&store, agent.id);
            let eligible = match agent.execution_mode {
                ExecutionMode::Server => true,
                ExecutionMode::Local => {
                    let latest = store
                        .connections
                        .iter()
                        .filter(|c| c.agent_id == agent.id)
                        .max_by_key(|c| c.connected_at);
                    match latest {
                        Some(conn) => {
                            !matches!(
                                conn.status,
                                ConnectionStatus::Draining | ConnectionStatus::Disconnected
                            ) && conn.last_heartbeat > cutoff
                                && active < per_local_cap
                        }
                        None => false,
                    }
                }
            };
            if eligible {
                let ranking = store.rankings.get(&agent.id);
                out.push(CandidateAgent {
                    id: agent.id,
                    name: agent.name.clone(),
                    execution_mode: agent.execution_mode,
                    rating: ranking.map(|r| r.rating).unwrap_or(1500),
                    games_played: ranking.map(|r| r.games_played).unwrap_or(0),
                    active_matches: active,
                });
            }
        }
        Ok(out)
    }

    async fn ranked_server_agents(&self) -> Result<Vec<(Uuid, i32)>> {
        let store = self.store.lock().unwrap();
        let mut out: Vec<(Uuid, i32)> = store
            .agents
            .values()
            .filter(|a| a.active && a.execution_mode == ExecutionMode::Server)
            .filter_map(|a| {
                let r = store.rankings.get(&a.id)?;
                (r.games_played > 0).then_some((a.id, r.rating))
            })
            .collect();
        out.sort_by_key(|(_, rating)| *rating);
        Ok(out)
    }

    async fn bracket_agents(&self, agent_ids: &[Uuid]) -> Result<Vec<CandidateAgent>> {
        let store = self.store.lock().unwrap();
        let mut out: Vec<CandidateAgent> = agent_ids
            .iter()
            .filter_map(|id| {
                let agent = store.agents.get(id)?;
                let ranking = store.rankings.get(id);
                Some(CandidateAgent {
                    id: *id,
                    name: agent.name.clone(),
                    execution_mode: agent.execution_mode,
                    rating: ranking.map(|r| r.rating).unwrap_or(1500),
                    games_played: ranking.map(|r| r.games_played).unwrap_or(0),
                    active_matches: 0,
                })
            })
            .collect();
        out.sort_by_key(|c| c.rating);
        Ok(out)
    }

    async fn pending_validation_entries(&self, limit: i64) -> Result<Vec<ValidationEntry>> {
        let store = self.store.lock().unwrap();
        let mut entries: Vec<ValidationEntry> = store
            .validation
            .values()
            .filter(|e| e.status == ValidationStatus::Pending)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn mark_validation_testing(&self, entry_id: Uuid) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(e) = store.validation.get_mut(&entry_id) {
            e.status = ValidationStatus::Testing;
        }
        Ok(())
    }

    async fn pass_validation(&self, entry_id: Uuid, agent_id: Uuid, duration_ms: i64) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(e) = store.validation.get_mut(&entry_id) {
            e.status = ValidationStatus::Passed;
            e.agent_id = Some(agent_id);
            e.test_duration_ms = Some(duration_ms);
        }
        Ok(())
    }

    async fn fail_validation(&self, entry_id: Uuid, error: &str, duration_ms: i64) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(e) = store.validation.get_mut(&entry_id) {
            e.status = ValidationStatus::Failed;
            e.error = Some(error.to_string());
            e.test_duration_ms = Some(duration_ms);
        }
        Ok(())
    }
}

/// One scripted behavior for a local agent's next move request.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Reconstruct the board from the cache payload and play the first
    /// legal move, like a well-behaved client.
    Play,
    /// Report an explicit timeout.
    Timeout,
    /// Report an agent-side error.
    Error(String),
    /// Return a move for a square the agent does not own.
    ForeignPiece,
    /// Drop the session mid-move.
    Disconnect(String),
}

/// Scripted bridge standing in for the bus + gateway pair in runner tests.
pub struct ScriptedBridge {
    cache: Arc<GameContextCache>,
    scripts: Mutex<HashMap<Uuid, VecDeque<ScriptedReply>>>,
    pub game_end_notices: Mutex<Vec<(Uuid, String)>>,
}

impl ScriptedBridge {
    pub fn new(cache: Arc<GameContextCache>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            scripts: Mutex::new(HashMap::new()),
            game_end_notices: Mutex::new(Vec::new()),
        })
    }

    pub fn script(&self, agent_id: Uuid, replies: Vec<ScriptedReply>) {
        self.scripts.lock().unwrap().insert(agent_id, replies.into());
    }

    fn next_reply(&self, agent_id: Uuid) -> ScriptedReply {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&agent_id)
            .and_then(|q| q.pop_front())
            .unwrap_or(ScriptedReply::Play)
    }

    fn reconstructed(&self, game_id: Uuid) -> Option<Board> {
        let (initial, moves) = self.cache.payload(game_id)?;
        Board::replay(&initial, &moves).ok()
    }
}

#[async_trait]
impl LiveAgentClient for ScriptedBridge {
    async fn request_move(
        &self,
        agent_id: Uuid,
        game_id: Uuid,
        player: Color,
        _var: serde_json::Value,
    ) -> Result<MoveResponse, BridgeError> {
        match self.next_reply(agent_id) {
            ScriptedReply::Play => {
                let board = self.reconstructed(game_id).expect("cache payload available");
                let mv = common::legal_moves(&board, player)
                    .into_iter()
                    .next()
                    .expect("scripted agent has a legal move");
                Ok(MoveResponse::Move {
                    mv: MovePayload {
                        piece_position: mv.from,
                        move_position: mv.to,
                        piece_type: None,
                    },
                    elapsed_secs: 0.05,
                })
            }
            ScriptedReply::Timeout => Ok(MoveResponse::Timeout { elapsed_secs: 21.0 }),
            ScriptedReply::Error(message) => {
                Ok(MoveResponse::AgentError { message, elapsed_secs: 0.05 })
            }
            ScriptedReply::ForeignPiece => {
                let board = self.reconstructed(game_id).expect("cache payload available");
                let foreign = board
                    .pieces_of(player.opponent())
                    .next()
                    .expect("opponent has pieces");
                Ok(MoveResponse::Move {
                    mv: MovePayload {
                        piece_position: foreign.position(),
                        move_position: foreign.position(),
                        piece_type: None,
                    },
                    elapsed_secs: 0.05,
                })
            }
            ScriptedReply::Disconnect(reason) => Err(BridgeError::AgentDisconnected {
                agent_id,
                game_id: Some(game_id),
                reason,
            }),
        }
    }

    async fn notify_game_start(&self, _agent_id: Uuid, _game_id: Uuid, _white: &str, _black: &str) {}

    async fn notify_game_end(
        &self,
        agent_id: Uuid,
        _game_id: Uuid,
        termination: &str,
        _winner: Option<Color>,
    ) {
        self.game_end_notices
            .lock()
            .unwrap()
            .push((agent_id, termination.to_string()));
    }
}

/// Records kicks instead of publishing them.
#[derive(Default)]
pub struct RecordingKick {
    count: AtomicUsize,
}

impl RecordingKick {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kicks(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchedulerKick for RecordingKick {
    async fn kick(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}
