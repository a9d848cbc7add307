pub mod models;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use models::*;

#[async_trait]
pub trait Database: Send + Sync {
    // Agent operations
    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<Agent>>;
    async fn get_agent_by_code_hash(&self, code_hash: &str) -> Result<Option<Agent>>;
    async fn create_agent(&self, agent: NewAgent) -> Result<Agent>;
    async fn deactivate_local_agents(&self) -> Result<u64>;
    /// Lookup used by gateway auth: id + token digest + local mode + active.
    async fn authenticate_local_agent(&self, agent_id: Uuid, token_hash: &str)
    -> Result<Option<Agent>>;

    // Ranking operations
    async fn create_ranking(&self, agent_id: Uuid) -> Result<()>;
    async fn get_ranking(&self, agent_id: Uuid) -> Result<Option<Ranking>>;
    async fn rating_context(&self, match_id: Uuid) -> Result<Option<RatingContext>>;
    /// Applies both updates in one transaction, taking ranking locks in
    /// canonical agent-id order.
    async fn apply_rating_updates(&self, updates: &[RatingUpdate]) -> Result<()>;

    // Match operations
    async fn create_match(
        &self,
        white_agent_id: Uuid,
        black_agent_id: Uuid,
        match_type: MatchType,
    ) -> Result<MatchRow>;
    async fn get_match(&self, match_id: Uuid) -> Result<Option<MatchRow>>;
    async fn match_status(&self, match_id: Uuid) -> Result<Option<MatchStatus>>;
    async fn mark_match_started(&self, match_id: Uuid) -> Result<()>;
    async fn complete_match(
        &self,
        match_id: Uuid,
        winner: Option<Winner>,
        moves: i32,
        termination: Termination,
    ) -> Result<()>;
    async fn fail_match(&self, match_id: Uuid, termination: Termination) -> Result<()>;
    /// Deletes the match row and its game states (states first).
    async fn delete_match(&self, match_id: Uuid) -> Result<()>;
    /// Atomically claims up to `limit` pending matches for this worker,
    /// promoting them to in_progress.
    async fn claim_pending_matches(&self, limit: i64) -> Result<Vec<Uuid>>;
    async fn count_active_matches(&self, match_type: MatchType) -> Result<i64>;
    async fn cancel_non_tournament_matches(&self) -> Result<u64>;
    async fn stuck_matches(&self, cutoff: DateTime<Utc>) -> Result<Vec<(Uuid, MatchType)>>;
    async fn fail_stuck_matches(&self, match_ids: &[Uuid]) -> Result<u64>;
    async fn completed_tournament_matches(&self, agent_ids: &[Uuid]) -> Result<Vec<MatchOutcome>>;
    async fn count_active_tournament_matches(&self, agent_ids: &[Uuid]) -> Result<i64>;
    async fn tournament_pair_exists(&self, a: Uuid, b: Uuid) -> Result<bool>;

    // Game state operations
    async fn insert_game_state(&self, state: &GameStateRow) -> Result<()>;
    async fn game_states(&self, match_id: Uuid) -> Result<Vec<GameStateRow>>;
    async fn delete_game_states(&self, match_id: Uuid) -> Result<u64>;
    /// (white, black) average move times; white moved the odd plies.
    async fn move_time_averages(&self, match_id: Uuid) -> Result<(Option<i64>, Option<i64>)>;

    // Local agent connection operations
    /// Forces any live connection rows for the agent to disconnected, then
    /// inserts the new row.
    async fn open_connection(
        &self,
        agent_id: Uuid,
        transport: Transport,
        remote_addr: Option<&str>,
    ) -> Result<Uuid>;
    async fn close_connections(&self, agent_id: Uuid) -> Result<u64>;
    async fn set_connection_status(&self, agent_id: Uuid, status: ConnectionStatus) -> Result<()>;
    async fn touch_connection_heartbeat(&self, agent_id: Uuid) -> Result<()>;
    async fn open_connection_count(&self, agent_id: Uuid) -> Result<i64>;

    // Scheduler snapshots
    async fn matchmaking_candidates(
        &self,
        heartbeat_window: chrono::Duration,
        per_local_cap: i64,
    ) -> Result<Vec<CandidateAgent>>;
    /// Active server agents with at least one completed game, rating
    /// ascending. Feeds the tournament bracket snapshot.
    async fn ranked_server_agents(&self) -> Result<Vec<(Uuid, i32)>>;
    async fn bracket_agents(&self, agent_ids: &[Uuid]) -> Result<Vec<CandidateAgent>>;

    // Validation queue operations
    async fn pending_validation_entries(&self, limit: i64) -> Result<Vec<ValidationEntry>>;
    async fn mark_validation_testing(&self, entry_id: Uuid) -> Result<()>;
    async fn pass_validation(&self, entry_id: Uuid, agent_id: Uuid, duration_ms: i64) -> Result<()>;
    async fn fail_validation(&self, entry_id: Uuid, error: &str, duration_ms: i64) -> Result<()>;
}
