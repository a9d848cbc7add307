use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::Database;
use super::models::*;

pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn agent_from_row(row: &PgRow) -> Result<Agent> {
    let mode: String = row.try_get("execution_mode")?;
    Ok(Agent {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        code_blob: row.try_get("code_blob")?,
        code_hash: row.try_get("code_hash")?,
        execution_mode: ExecutionMode::parse(&mode)
            .ok_or_else(|| anyhow!("unknown execution_mode: {mode}"))?,
        active: row.try_get("active")?,
        connection_token_hash: row.try_get("connection_token_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

fn match_from_row(row: &PgRow) -> Result<MatchRow> {
    let match_type: String = row.try_get("match_type")?;
    let status: String = row.try_get("status")?;
    let winner: Option<String> = row.try_get("winner")?;
    Ok(MatchRow {
        id: row.try_get("id")?,
        white_agent_id: row.try_get("white_agent_id")?,
        black_agent_id: row.try_get("black_agent_id")?,
        match_type: MatchType::parse(&match_type)
            .ok_or_else(|| anyhow!("unknown match_type: {match_type}"))?,
        status: MatchStatus::parse(&status).ok_or_else(|| anyhow!("unknown status: {status}"))?,
        winner: winner.as_deref().and_then(Winner::parse),
        moves: row.try_get("moves")?,
        termination: row.try_get("termination")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn candidate_from_row(row: &PgRow) -> Result<CandidateAgent> {
    let mode: String = row.try_get("execution_mode")?;
    Ok(CandidateAgent {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        execution_mode: ExecutionMode::parse(&mode)
            .ok_or_else(|| anyhow!("unknown execution_mode: {mode}"))?,
        rating: row.try_get("rating")?,
        games_played: row.try_get("games_played")?,
        active_matches: row.try_get("active_matches")?,
    })
}

const AGENT_COLUMNS: &str = "id, owner_id, name, version, code_blob, code_hash, execution_mode, \
                             active, connection_token_hash, created_at";
const MATCH_COLUMNS: &str = "id, white_agent_id, black_agent_id, match_type, status, winner, \
                             moves, termination, created_at, started_at, completed_at";

#[async_trait]
impl Database for PostgresDatabase {
    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<Agent>> {
        let row = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = $1"))
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch agent")?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn get_agent_by_code_hash(&self, code_hash: &str) -> Result<Option<Agent>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE code_hash = $1 ORDER BY created_at ASC LIMIT 1"
        ))
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch agent by code hash")?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn create_agent(&self, agent: NewAgent) -> Result<Agent> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO agents (id, owner_id, name, version, code_blob, code_hash,
                                execution_mode, active, connection_token_hash, created_at)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, true, $7, NOW())
            RETURNING {AGENT_COLUMNS}
            "#
        ))
        .bind(agent.owner_id)
        .bind(&agent.name)
        .bind(agent.version)
        .bind(&agent.code_blob)
        .bind(&agent.code_hash)
        .bind(agent.execution_mode.as_str())
        .bind(&agent.connection_token_hash)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create agent")?;
        agent_from_row(&row)
    }

    async fn deactivate_local_agents(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE agents SET active = false WHERE execution_mode = 'local' AND active = true",
        )
        .execute(&self.pool)
        .await
        .context("Failed to deactivate local agents")?;
        Ok(result.rows_affected())
    }

    async fn authenticate_local_agent(
        &self,
        agent_id: Uuid,
        token_hash: &str,
    ) -> Result<Option<Agent>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {AGENT_COLUMNS} FROM agents
            WHERE id = $1 AND connection_token_hash = $2
              AND execution_mode = 'local' AND active = true
            "#
        ))
        .bind(agent_id)
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to authenticate agent")?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn create_ranking(&self, agent_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rankings (agent_id, rating, games_played, wins, losses, draws, last_updated)
            VALUES ($1, 1500, 0, 0, 0, 0, NOW())
            ON CONFLICT (agent_id) DO NOTHING
            "#,
        )
        .bind(agent_id)
        .execute(&self.pool)
        .await
        .context("Failed to create ranking")?;
        Ok(())
    }

    async fn get_ranking(&self, agent_id: Uuid) -> Result<Option<Ranking>> {
        let row = sqlx::query(
            r#"
            SELECT agent_id, rating, games_played, wins, losses, draws, avg_move_time_ms, last_updated
            FROM rankings WHERE agent_id = $1
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch ranking")?;
        row.map(|r| {
            Ok(Ranking {
                agent_id: r.try_get("agent_id")?,
                rating: r.try_get("rating")?,
                games_played: r.try_get("games_played")?,
                wins: r.try_get("wins")?,
                losses: r.try_get("losses")?,
                draws: r.try_get("draws")?,
                avg_move_time_ms: r.try_get("avg_move_time_ms")?,
                last_updated: r.try_get("last_updated")?,
            })
        })
        .transpose()
    }

    async fn rating_context(&self, match_id: Uuid) -> Result<Option<RatingContext>> {
        let row = sqlx::query(
            r#"
            SELECT m.white_agent_id, m.black_agent_id, m.winner,
                   wr.rating AS white_rating, wr.games_played AS white_games,
                   br.rating AS black_rating, br.games_played AS black_games
            FROM matches m
            JOIN rankings wr ON m.white_agent_id = wr.agent_id
            JOIN rankings br ON m.black_agent_id = br.agent_id
            WHERE m.id = $1 AND m.status = 'completed'
            "#,
        )
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch rating context")?;
        row.map(|r| {
            let winner: Option<String> = r.try_get("winner")?;
            Ok(RatingContext {
                white_agent_id: r.try_get("white_agent_id")?,
                black_agent_id: r.try_get("black_agent_id")?,
                winner: winner.as_deref().and_then(Winner::parse),
                white_rating: r.try_get("white_rating")?,
                white_games: r.try_get("white_games")?,
                black_rating: r.try_get("black_rating")?,
                black_games: r.try_get("black_games")?,
            })
        })
        .transpose()
    }

    async fn apply_rating_updates(&self, updates: &[RatingUpdate]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Lock ranking rows in canonical order to avoid deadlocks on
        // concurrent pair updates.
        let mut ids: Vec<Uuid> = updates.iter().map(|u| u.agent_id).collect();
        ids.sort();
        sqlx::query("SELECT agent_id FROM rankings WHERE agent_id = ANY($1) ORDER BY agent_id FOR UPDATE")
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to lock ranking rows")?;

        for update in updates {
            let (wins, losses, draws) = match update.outcome {
                GameOutcome::Win => (1, 0, 0),
                GameOutcome::Loss => (0, 1, 0),
                GameOutcome::Draw => (0, 0, 1),
            };
            sqlx::query(
                r#"
                UPDATE rankings
                SET rating = rating + $1,
                    wins = wins + $2,
                    losses = losses + $3,
                    draws = draws + $4,
                    avg_move_time_ms = CASE
                        WHEN $5::bigint IS NULL THEN avg_move_time_ms
                        WHEN avg_move_time_ms IS NULL THEN $5
                        ELSE (avg_move_time_ms * games_played + $5) / (games_played + 1)
                    END,
                    games_played = games_played + 1,
                    last_updated = NOW()
                WHERE agent_id = $6
                "#,
            )
            .bind(update.change)
            .bind(wins)
            .bind(losses)
            .bind(draws)
            .bind(update.avg_move_time_ms)
            .bind(update.agent_id)
            .execute(&mut *tx)
            .await
            .context("Failed to update ranking")?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_match(
        &self,
        white_agent_id: Uuid,
        black_agent_id: Uuid,
        match_type: MatchType,
    ) -> Result<MatchRow> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO matches (id, white_agent_id, black_agent_id, match_type, status, moves, created_at)
            VALUES (gen_random_uuid(), $1, $2, $3, 'pending', 0, NOW())
            RETURNING {MATCH_COLUMNS}
            "#
        ))
        .bind(white_agent_id)
        .bind(black_agent_id)
        .bind(match_type.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to create match")?;
        match_from_row(&row)
    }

    async fn get_match(&self, match_id: Uuid) -> Result<Option<MatchRow>> {
        let row = sqlx::query(&format!("SELECT {MATCH_COLUMNS} FROM matches WHERE id = $1"))
            .bind(match_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch match")?;
        row.as_ref().map(match_from_row).transpose()
    }

    async fn match_status(&self, match_id: Uuid) -> Result<Option<MatchStatus>> {
        let row = sqlx::query("SELECT status FROM matches WHERE id = $1")
            .bind(match_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch match status")?;
        Ok(row.and_then(|r| {
            let status: String = r.try_get("status").ok()?;
            MatchStatus::parse(&status)
        }))
    }

    async fn mark_match_started(&self, match_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE matches
            SET status = 'in_progress', started_at = COALESCE(started_at, NOW())
            WHERE id = $1 AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(match_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark match started")?;
        Ok(())
    }

    async fn complete_match(
        &self,
        match_id: Uuid,
        winner: Option<Winner>,
        moves: i32,
        termination: Termination,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE matches
            SET status = 'completed', winner = $1, moves = $2, termination = $3, completed_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(winner.map(|w| w.as_str()))
        .bind(moves)
        .bind(termination.as_str())
        .bind(match_id)
        .execute(&self.pool)
        .await
        .context("Failed to complete match")?;
        Ok(())
    }

    async fn fail_match(&self, match_id: Uuid, termination: Termination) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE matches
            SET status = 'error', termination = $1, completed_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(termination.as_str())
        .bind(match_id)
        .execute(&self.pool)
        .await
        .context("Failed to fail match")?;
        Ok(())
    }

    async fn delete_match(&self, match_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM game_states WHERE match_id = $1")
            .bind(match_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete game states")?;
        sqlx::query("DELETE FROM matches WHERE id = $1")
            .bind(match_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete match")?;
        tx.commit().await?;
        Ok(())
    }

    async fn claim_pending_matches(&self, limit: i64) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            UPDATE matches
            SET status = 'in_progress', started_at = NOW()
            WHERE id IN (
                SELECT id FROM matches
                WHERE status = 'pending'
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim pending matches")?;
        rows.iter().map(|r| Ok(r.try_get("id")?)).collect()
    }

    async fn count_active_matches(&self, match_type: MatchType) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM matches
            WHERE match_type = $1 AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(match_type.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count active matches")?;
        Ok(row.try_get("count")?)
    }

    async fn cancel_non_tournament_matches(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE matches
            SET status = 'cancelled', completed_at = NOW()
            WHERE status IN ('pending', 'in_progress') AND match_type != 'tournament'
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to cancel non-tournament matches")?;
        Ok(result.rows_affected())
    }

    async fn stuck_matches(&self, cutoff: DateTime<Utc>) -> Result<Vec<(Uuid, MatchType)>> {
        let rows = sqlx::query(
            "SELECT id, match_type FROM matches WHERE status = 'in_progress' AND started_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to find stuck matches")?;
        rows.iter()
            .map(|r| {
                let match_type: String = r.try_get("match_type")?;
                Ok((
                    r.try_get("id")?,
                    MatchType::parse(&match_type)
                        .ok_or_else(|| anyhow!("unknown match_type: {match_type}"))?,
                ))
            })
            .collect()
    }

    async fn fail_stuck_matches(&self, match_ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE matches
            SET status = 'error', termination = 'stuck_timeout', completed_at = NOW()
            WHERE id = ANY($1)
            "#,
        )
        .bind(match_ids)
        .execute(&self.pool)
        .await
        .context("Failed to fail stuck matches")?;
        Ok(result.rows_affected())
    }

    async fn completed_tournament_matches(&self, agent_ids: &[Uuid]) -> Result<Vec<MatchOutcome>> {
        let rows = sqlx::query(
            r#"
            SELECT white_agent_id, black_agent_id, winner
            FROM matches
            WHERE match_type = 'tournament' AND status = 'completed'
              AND white_agent_id = ANY($1) AND black_agent_id = ANY($1)
            ORDER BY completed_at ASC
            "#,
        )
        .bind(agent_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch tournament matches")?;
        rows.iter()
            .map(|r| {
                let winner: Option<String> = r.try_get("winner")?;
                Ok(MatchOutcome {
                    white_agent_id: r.try_get("white_agent_id")?,
                    black_agent_id: r.try_get("black_agent_id")?,
                    winner: winner.as_deref().and_then(Winner::parse),
                })
            })
            .collect()
    }

    async fn count_active_tournament_matches(&self, agent_ids: &[Uuid]) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM matches
            WHERE match_type = 'tournament' AND status IN ('pending', 'in_progress')
              AND white_agent_id = ANY($1) AND black_agent_id = ANY($1)
            "#,
        )
        .bind(agent_ids)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count active tournament matches")?;
        Ok(row.try_get("count")?)
    }

    async fn tournament_pair_exists(&self, a: Uuid, b: Uuid) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM matches
            WHERE match_type = 'tournament'
              AND ((white_agent_id = $1 AND black_agent_id = $2)
                OR (white_agent_id = $2 AND black_agent_id = $1))
            "#,
        )
        .bind(a)
        .bind(b)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check tournament pair")?;
        let count: i64 = row.try_get("count")?;
        Ok(count > 0)
    }

    async fn insert_game_state(&self, state: &GameStateRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO game_states (id, match_id, move_number, board_state, move_time_ms, move_notation, evaluation)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6)
            ON CONFLICT (match_id, move_number) DO NOTHING
            "#,
        )
        .bind(state.match_id)
        .bind(state.move_number)
        .bind(&state.board_state)
        .bind(state.move_time_ms)
        .bind(&state.notation)
        .bind(state.evaluation)
        .execute(&self.pool)
        .await
        .context("Failed to insert game state")?;
        Ok(())
    }

    async fn game_states(&self, match_id: Uuid) -> Result<Vec<GameStateRow>> {
        let rows = sqlx::query(
            r#"
            SELECT match_id, move_number, board_state, move_time_ms, move_notation, evaluation
            FROM game_states WHERE match_id = $1 ORDER BY move_number ASC
            "#,
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch game states")?;
        rows.iter()
            .map(|r| {
                Ok(GameStateRow {
                    match_id: r.try_get("match_id")?,
                    move_number: r.try_get("move_number")?,
                    board_state: r.try_get("board_state")?,
                    move_time_ms: r.try_get("move_time_ms")?,
                    notation: r.try_get("move_notation")?,
                    evaluation: r.try_get("evaluation")?,
                })
            })
            .collect()
    }

    async fn delete_game_states(&self, match_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM game_states WHERE match_id = $1")
            .bind(match_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete game states")?;
        Ok(result.rows_affected())
    }

    async fn move_time_averages(&self, match_id: Uuid) -> Result<(Option<i64>, Option<i64>)> {
        let row = sqlx::query(
            r#"
            SELECT
                AVG(CASE WHEN move_number % 2 = 1 THEN move_time_ms END)::bigint AS white_avg,
                AVG(CASE WHEN move_number % 2 = 0 AND move_number > 0 THEN move_time_ms END)::bigint AS black_avg
            FROM game_states
            WHERE match_id = $1 AND move_time_ms IS NOT NULL
            "#,
        )
        .bind(match_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute move time averages")?;
        Ok((row.try_get("white_avg")?, row.try_get("black_avg")?))
    }

    async fn open_connection(
        &self,
        agent_id: Uuid,
        transport: Transport,
        remote_addr: Option<&str>,
    ) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE local_agent_connections
            SET status = 'disconnected', disconnected_at = NOW()
            WHERE agent_id = $1 AND status != 'disconnected'
            "#,
        )
        .bind(agent_id)
        .execute(&mut *tx)
        .await
        .context("Failed to force-disconnect prior connections")?;

        let row = sqlx::query(
            r#"
            INSERT INTO local_agent_connections
                (id, agent_id, transport, status, connected_at, last_heartbeat, remote_addr)
            VALUES (gen_random_uuid(), $1, $2, 'connected', NOW(), NOW(), $3)
            RETURNING id
            "#,
        )
        .bind(agent_id)
        .bind(transport.as_str())
        .bind(remote_addr)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to insert connection")?;
        tx.commit().await?;
        Ok(row.try_get("id")?)
    }

    async fn close_connections(&self, agent_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE local_agent_connections
            SET status = 'disconnected', disconnected_at = NOW()
            WHERE agent_id = $1 AND status != 'disconnected'
            "#,
        )
        .bind(agent_id)
        .execute(&self.pool)
        .await
        .context("Failed to close connections")?;
        Ok(result.rows_affected())
    }

    async fn set_connection_status(&self, agent_id: Uuid, status: ConnectionStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE local_agent_connections
            SET status = $1, last_heartbeat = NOW()
            WHERE agent_id = $2 AND status != 'disconnected'
            "#,
        )
        .bind(status.as_str())
        .bind(agent_id)
        .execute(&self.pool)
        .await
        .context("Failed to set connection status")?;
        Ok(())
    }

    async fn touch_connection_heartbeat(&self, agent_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE local_agent_connections
            SET last_heartbeat = NOW()
            WHERE agent_id = $1 AND status != 'disconnected'
            "#,
        )
        .bind(agent_id)
        .execute(&self.pool)
        .await
        .context("Failed to update connection heartbeat")?;
        Ok(())
    }

    async fn open_connection_count(&self, agent_id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM local_agent_connections
            WHERE agent_id = $1 AND status != 'disconnected'
            "#,
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count connections")?;
        Ok(row.try_get("count")?)
    }

    async fn matchmaking_candidates(
        &self,
        heartbeat_window: chrono::Duration,
        per_local_cap: i64,
    ) -> Result<Vec<CandidateAgent>> {
        let heartbeat_cutoff = Utc::now() - heartbeat_window;
        let rows = sqlx::query(
            r#"
            WITH active_matches AS (
                SELECT agent_id, COUNT(*) AS active_count
                FROM (
                    SELECT white_agent_id AS agent_id FROM matches
                    WHERE match_type = 'matchmaking' AND status IN ('pending', 'in_progress')
                    UNION ALL
                    SELECT black_agent_id AS agent_id FROM matches
                    WHERE match_type = 'matchmaking' AND status IN ('pending', 'in_progress')
                ) active_games
                GROUP BY agent_id
            ),
            latest_connections AS (
                SELECT DISTINCT ON (agent_id) agent_id, status, last_heartbeat
                FROM local_agent_connections
                ORDER BY agent_id, connected_at DESC
            )
            SELECT a.id, a.name, a.execution_mode,
                   COALESCE(r.rating, 1500) AS rating,
                   COALESCE(r.games_played, 0) AS games_played,
                   COALESCE(am.active_count, 0) AS active_matches
            FROM agents a
            LEFT JOIN rankings r ON a.id = r.agent_id
            LEFT JOIN active_matches am ON a.id = am.agent_id
            LEFT JOIN latest_connections lac ON a.id = lac.agent_id
            WHERE a.active = true
            AND (
                a.execution_mode = 'server'
                OR (
                    a.execution_mode = 'local'
                    AND lac.status NOT IN ('draining', 'disconnected')
                    AND lac.last_heartbeat > $1
                    AND COALESCE(am.active_count, 0) < $2
                )
            )
            "#,
        )
        .bind(heartbeat_cutoff)
        .bind(per_local_cap)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch matchmaking candidates")?;
        rows.iter().map(candidate_from_row).collect()
    }

    async fn ranked_server_agents(&self) -> Result<Vec<(Uuid, i32)>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, COALESCE(r.rating, 1500) AS rating
            FROM agents a
            LEFT JOIN rankings r ON a.id = r.agent_id
            WHERE a.active = true
              AND a.execution_mode = 'server'
              AND COALESCE(r.games_played, 0) > 0
            ORDER BY rating ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch ranked server agents")?;
        rows.iter()
            .map(|r| Ok((r.try_get("id")?, r.try_get("rating")?)))
            .collect()
    }

    async fn bracket_agents(&self, agent_ids: &[Uuid]) -> Result<Vec<CandidateAgent>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.name, a.execution_mode,
                   COALESCE(r.rating, 1500) AS rating,
                   COALESCE(r.games_played, 0) AS games_played,
                   0::bigint AS active_matches
            FROM agents a
            LEFT JOIN rankings r ON a.id = r.agent_id
            WHERE a.id = ANY($1)
            ORDER BY rating ASC
            "#,
        )
        .bind(agent_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch bracket agents")?;
        rows.iter().map(candidate_from_row).collect()
    }

    async fn pending_validation_entries(&self, limit: i64) -> Result<Vec<ValidationEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, code_blob, name, version, code_hash, status, error,
                   test_duration_ms, agent_id, created_at
            FROM validation_queue
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch validation entries")?;
        rows.iter()
            .map(|r| {
                let status: String = r.try_get("status")?;
                Ok(ValidationEntry {
                    id: r.try_get("id")?,
                    owner_id: r.try_get("owner_id")?,
                    code_blob: r.try_get("code_blob")?,
                    name: r.try_get("name")?,
                    version: r.try_get("version")?,
                    code_hash: r.try_get("code_hash")?,
                    status: ValidationStatus::parse(&status)
                        .ok_or_else(|| anyhow!("unknown validation status: {status}"))?,
                    error: r.try_get("error")?,
                    test_duration_ms: r.try_get("test_duration_ms")?,
                    agent_id: r.try_get("agent_id")?,
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn mark_validation_testing(&self, entry_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE validation_queue SET status = 'testing', started_at = NOW() WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark validation entry testing")?;
        Ok(())
    }

    async fn pass_validation(&self, entry_id: Uuid, agent_id: Uuid, duration_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE validation_queue
            SET status = 'passed', agent_id = $1, test_duration_ms = $2, completed_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(agent_id)
        .bind(duration_ms)
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark validation entry passed")?;
        Ok(())
    }

    async fn fail_validation(&self, entry_id: Uuid, error: &str, duration_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE validation_queue
            SET status = 'failed', error = $1, test_duration_ms = $2, completed_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(error)
        .bind(duration_ms)
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark validation entry failed")?;
        Ok(())
    }
}
