//! Per-match state machine: loads the agents, drives plies, persists game
//! states, and applies the outcome.

use anyhow::{Context, Result};
use common::{AppliedMove, Board, Color, GameResult, Move, boards};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bridge::{BridgeError, GameContextCache, LiveAgentClient, MoveResponse, router};
use crate::config::Config;
use crate::db::Database;
use crate::db::models::{
    Agent, ExecutionMode, GameStateRow, MatchRow, MatchType, Termination, Winner,
};
use crate::matchmaking::SchedulerKick;
use crate::rating;
use crate::sandbox::AgentSandbox;
use crate::tournament;

#[derive(Clone)]
pub struct MatchRunner {
    db: Arc<dyn Database>,
    sandbox: Arc<dyn AgentSandbox>,
    bridge: Arc<dyn LiveAgentClient>,
    cache: Arc<GameContextCache>,
    kick: Arc<dyn SchedulerKick>,
    cfg: Arc<Config>,
}

/// How a game concluded, before persistence decisions are applied.
#[derive(Debug, Clone, PartialEq)]
enum Ending {
    Finished { winner: Option<Winner>, termination: Termination },
    Cancelled { reason: String },
    SystemError { message: String },
}

/// One agent's reply to a move request, normalized across server and local
/// execution.
struct PlyReply {
    chosen: Option<Move>,
    elapsed_secs: f64,
    explicit_timeout: bool,
    agent_error: Option<String>,
}

pub fn mover_for_ply(ply_number: u32) -> Color {
    if ply_number % 2 == 1 { Color::White } else { Color::Black }
}

fn hash_match_id(match_id: Uuid) -> u64 {
    let mut hasher = DefaultHasher::new();
    match_id.as_bytes().hash(&mut hasher);
    hasher.finish()
}

impl MatchRunner {
    pub fn new(
        db: Arc<dyn Database>,
        sandbox: Arc<dyn AgentSandbox>,
        bridge: Arc<dyn LiveAgentClient>,
        cache: Arc<GameContextCache>,
        kick: Arc<dyn SchedulerKick>,
        cfg: Arc<Config>,
    ) -> Self {
        Self { db, sandbox, bridge, cache, kick, cfg }
    }

    /// Drive a single match from pending to a terminal state. Agent-side and
    /// bus-side failures never escape: they are mapped to terminations.
    pub async fn run_match(&self, match_id: Uuid) -> Result<()> {
        let Some(row) = self.db.get_match(match_id).await? else {
            warn!(%match_id, "Match does not exist, skipping");
            return Ok(());
        };
        if row.status.is_terminal() {
            info!(%match_id, status = row.status.as_str(), "Match already terminal, skipping");
            return Ok(());
        }
        let (Some(white), Some(black)) = (
            self.db.get_agent(row.white_agent_id).await?,
            self.db.get_agent(row.black_agent_id).await?,
        ) else {
            warn!(%match_id, "Match is missing agents, skipping");
            return Ok(());
        };

        match self.drive(&row, &white, &black).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(%match_id, error = %e, "Match failed with system error");
                self.finish_system_error(&row, &white, &black).await;
                Ok(())
            }
        }
    }

    async fn drive(&self, row: &MatchRow, white: &Agent, black: &Agent) -> Result<()> {
        let match_id = row.id;
        self.db.mark_match_started(match_id).await?;

        let mut rng = StdRng::from_entropy();
        let board = self.choose_board(row, &mut rng);

        self.db
            .insert_game_state(&GameStateRow {
                match_id,
                move_number: 0,
                board_state: serde_json::to_value(&board)?,
                move_time_ms: 0,
                notation: "Starting position".to_string(),
                evaluation: common::evaluate(&board),
            })
            .await
            .context("Failed to persist starting position")?;

        let has_local = white.execution_mode == ExecutionMode::Local
            || black.execution_mode == ExecutionMode::Local;
        if has_local {
            self.cache.init_game(match_id, board.clone());
        }
        for agent in [white, black] {
            if agent.execution_mode == ExecutionMode::Local {
                self.bridge
                    .notify_game_start(agent.id, match_id, &white.name, &black.name)
                    .await;
            }
        }

        let mut game = board;
        let mut pending_states: Vec<GameStateRow> = Vec::new();
        let mut moves: u32 = 0;
        let mut white_ply: u32 = 1;
        let mut black_ply: u32 = 1;
        let wall_clock = Instant::now();

        let ending = loop {
            if moves >= self.cfg.max_moves {
                break Ending::Finished {
                    winner: Some(Winner::Draw),
                    termination: Termination::MaxMoves,
                };
            }
            moves += 1;
            let mover = mover_for_ply(moves);
            let (agent, opponent_color) = match mover {
                Color::White => (white, Color::Black),
                Color::Black => (black, Color::White),
            };

            let legal = common::legal_moves(&game, mover);
            if legal.is_empty() {
                moves -= 1;
                break Ending::Finished {
                    winner: Some(Winner::from_color(opponent_color)),
                    termination: Termination::Stalemate,
                };
            }

            if wall_clock.elapsed().as_secs() > self.cfg.game_time_budget_secs {
                moves -= 1;
                warn!(%match_id, "Game exceeded wall-clock budget, terminating as draw");
                break Ending::Finished {
                    winner: Some(Winner::Draw),
                    termination: Termination::StuckTimeout,
                };
            }

            let ply = match mover {
                Color::White => &mut white_ply,
                Color::Black => &mut black_ply,
            };
            let var = common::agent_var(*ply);
            *ply += 1;

            let reply = match agent.execution_mode {
                ExecutionMode::Server => self.server_reply(agent, &game, mover, var).await,
                ExecutionMode::Local => match self.local_reply(agent, match_id, mover, var).await {
                    Ok(reply) => reply,
                    Err(BridgeError::AgentDisconnected { reason, .. }) => {
                        break Ending::Cancelled { reason };
                    }
                    Err(BridgeError::Bus(e)) => {
                        break Ending::SystemError { message: e.to_string() };
                    }
                },
            };

            if let Some(message) = reply.agent_error {
                info!(%match_id, moves, mover = %mover, message, "Agent error, forfeiting");
                break Ending::Finished {
                    winner: Some(Winner::from_color(opponent_color)),
                    termination: Termination::error_for(mover),
                };
            }

            let timed_out = reply.explicit_timeout
                || reply.elapsed_secs > self.cfg.agent_timeout_secs + self.cfg.check_buffer_secs;
            if timed_out {
                info!(%match_id, moves, mover = %mover, elapsed = reply.elapsed_secs, "Agent timeout, forfeiting");
                let state = GameStateRow {
                    match_id,
                    move_number: moves as i32,
                    board_state: serde_json::to_value(&game)?,
                    move_time_ms: (self.cfg.agent_timeout_secs * 1000.0) as i64,
                    notation: format!("TIMEOUT({mover})"),
                    evaluation: common::evaluate(&game),
                };
                self.persist_ply(row, state, &mut pending_states).await?;
                break Ending::Finished {
                    winner: Some(Winner::from_color(opponent_color)),
                    termination: Termination::Timeout,
                };
            }

            let valid = reply.chosen.filter(|mv| legal.contains(mv));
            let Some(mv) = valid else {
                info!(%match_id, moves, mover = %mover, "Invalid move, forfeiting");
                let state = GameStateRow {
                    match_id,
                    move_number: moves as i32,
                    board_state: serde_json::to_value(&game)?,
                    move_time_ms: (reply.elapsed_secs * 1000.0) as i64,
                    notation: format!("INVALID({mover})"),
                    evaluation: common::evaluate(&game),
                };
                self.persist_ply(row, state, &mut pending_states).await?;
                break Ending::Finished {
                    winner: Some(Winner::from_color(opponent_color)),
                    termination: Termination::invalid_for(mover),
                };
            };

            // Capture origin before mutation; append to the reconstruction
            // history only after the move is applied server-side.
            let piece_kind = game
                .piece_at(mv.from)
                .map(|p| p.kind)
                .context("legal move lost its piece")?;
            common::apply_move(&mut game, mv);
            if has_local {
                self.cache.append_move(
                    match_id,
                    AppliedMove { from: mv.from, to: mv.to, piece: piece_kind },
                );
            }

            let move_time_ms =
                common::cap_move_time((reply.elapsed_secs * 1000.0) as u64, &mut rng) as i64;
            let state = GameStateRow {
                match_id,
                move_number: moves as i32,
                board_state: serde_json::to_value(&game)?,
                move_time_ms,
                notation: format!("{}({},{})", piece_kind.name(), mv.to.x, mv.to.y),
                evaluation: common::evaluate(&game),
            };
            self.persist_ply(row, state, &mut pending_states).await?;

            // Terminal conditions for the side about to move.
            if let Some(result) = common::game_result(&game, mover.opponent()) {
                let (winner, termination) = match result {
                    GameResult::Checkmate { winner } => {
                        (Winner::from_color(winner), Termination::Checkmate)
                    }
                    GameResult::Stalemate => (Winner::from_color(mover), Termination::Stalemate),
                };
                break Ending::Finished { winner: Some(winner), termination };
            }
        };

        self.finish(row, white, black, ending, moves, pending_states).await
    }

    fn choose_board(&self, row: &MatchRow, rng: &mut StdRng) -> Board {
        let key = hash_match_id(row.id);
        if row.match_type == MatchType::Tournament {
            return boards::canonical(key);
        }
        // 60% canonical (deterministic pick), 40% generated symmetric board.
        if rng.r#gen::<f64>() < 0.60 {
            boards::canonical(key)
        } else {
            boards::random_symmetric(rng)
        }
    }

    async fn server_reply(
        &self,
        agent: &Agent,
        board: &Board,
        player: Color,
        var: serde_json::Value,
    ) -> PlyReply {
        let verdict = self
            .sandbox
            .request_move(&agent.code_blob, board, player, var, self.cfg.agent_timeout())
            .await;
        PlyReply {
            chosen: verdict.chosen,
            elapsed_secs: verdict
                .move_time_ms
                .map(|ms| ms as f64 / 1000.0)
                .unwrap_or(self.cfg.agent_timeout_secs),
            explicit_timeout: verdict.timed_out,
            agent_error: verdict.error,
        }
    }

    async fn local_reply(
        &self,
        agent: &Agent,
        match_id: Uuid,
        player: Color,
        var: serde_json::Value,
    ) -> Result<PlyReply, BridgeError> {
        let response = self.bridge.request_move(agent.id, match_id, player, var).await?;
        Ok(match response {
            MoveResponse::Move { mv, elapsed_secs } => {
                let chosen = match self.cache.payload(match_id) {
                    Some((initial, moves)) => {
                        match router::validate_move_payload(&initial, &moves, &mv, player) {
                            Ok(valid) => Some(valid),
                            Err(e) => {
                                info!(agent_id = %agent.id, %match_id, error = %e, "Move failed validation");
                                None
                            }
                        }
                    }
                    None => None,
                };
                PlyReply { chosen, elapsed_secs, explicit_timeout: false, agent_error: None }
            }
            MoveResponse::Timeout { elapsed_secs } => {
                PlyReply { chosen: None, elapsed_secs, explicit_timeout: true, agent_error: None }
            }
            MoveResponse::AgentError { message, elapsed_secs } => {
                // Agent-side errors forfeit like an invalid move.
                info!(agent_id = %agent.id, %match_id, message, "Agent reported error");
                PlyReply { chosen: None, elapsed_secs, explicit_timeout: false, agent_error: None }
            }
        })
    }

    async fn persist_ply(
        &self,
        row: &MatchRow,
        state: GameStateRow,
        pending: &mut Vec<GameStateRow>,
    ) -> Result<()> {
        // Tournament games persist per-ply so standings and spectators see
        // live progress; everything else batches at the end of the game.
        if row.match_type == MatchType::Tournament {
            self.db.insert_game_state(&state).await?;
        } else {
            pending.push(state);
        }
        Ok(())
    }

    async fn finish(
        &self,
        row: &MatchRow,
        white: &Agent,
        black: &Agent,
        ending: Ending,
        moves: u32,
        pending_states: Vec<GameStateRow>,
    ) -> Result<()> {
        let match_id = row.id;
        match ending {
            Ending::Cancelled { reason } => {
                info!(%match_id, reason, "Match cancelled, deleting");
                self.notify_end(row, white, black, Termination::Cancelled.as_str(), None).await;
                self.cache.clear_game(match_id);
                self.db.delete_match(match_id).await?;
                self.kick_if_matchmaking(row).await;
                Ok(())
            }
            Ending::SystemError { message } => {
                error!(%match_id, message, "Match hit system error");
                self.notify_end(row, white, black, Termination::SystemError.as_str(), None).await;
                self.cache.clear_game(match_id);
                if moves <= 3 {
                    self.db.delete_match(match_id).await?;
                } else {
                    for state in &pending_states {
                        self.db.insert_game_state(state).await?;
                    }
                    self.db.fail_match(match_id, Termination::SystemError).await?;
                }
                self.kick_if_matchmaking(row).await;
                Ok(())
            }
            Ending::Finished { winner, termination } => {
                // Games too short to be meaningful are deleted outright, not
                // stored with an outcome.
                if moves <= 3 {
                    info!(%match_id, moves, "Match too short, deleting");
                    self.notify_end(row, white, black, termination.as_str(), winner).await;
                    self.cache.clear_game(match_id);
                    self.db.delete_match(match_id).await?;
                    self.kick_if_matchmaking(row).await;
                    return Ok(());
                }

                for state in &pending_states {
                    self.db.insert_game_state(state).await?;
                    if row.match_type == MatchType::Exhibition {
                        // Pace exhibition inserts for live viewing.
                        tokio::time::sleep(self.cfg.exhibition_move_delay).await;
                    }
                }

                self.db
                    .complete_match(match_id, winner, moves as i32, termination)
                    .await?;
                info!(%match_id, moves, winner = ?winner, termination = termination.as_str(),
                      "Match completed");

                self.notify_end(row, white, black, termination.as_str(), winner).await;
                self.cache.clear_game(match_id);

                if let Err(e) = rating::update_match_ratings(self.db.as_ref(), match_id).await {
                    error!(%match_id, error = %e, "Failed to update ratings");
                }
                self.kick_if_matchmaking(row).await;
                Ok(())
            }
        }
    }

    async fn finish_system_error(&self, row: &MatchRow, white: &Agent, black: &Agent) {
        self.notify_end(row, white, black, Termination::SystemError.as_str(), None).await;
        self.cache.clear_game(row.id);
        let plies = match self.db.game_states(row.id).await {
            Ok(states) => states.iter().map(|s| s.move_number).max().unwrap_or(0),
            Err(_) => 0,
        };
        let result = if plies <= 3 {
            self.db.delete_match(row.id).await
        } else {
            self.db.fail_match(row.id, Termination::SystemError).await
        };
        if let Err(e) = result {
            error!(match_id = %row.id, error = %e, "Failed to record system error outcome");
        }
        self.kick_if_matchmaking(row).await;
    }

    async fn notify_end(
        &self,
        row: &MatchRow,
        white: &Agent,
        black: &Agent,
        termination: &str,
        winner: Option<Winner>,
    ) {
        let winner_color = match winner {
            Some(Winner::White) => Some(Color::White),
            Some(Winner::Black) => Some(Color::Black),
            _ => None,
        };
        for agent in [white, black] {
            if agent.execution_mode == ExecutionMode::Local {
                self.bridge
                    .notify_game_end(agent.id, row.id, termination, winner_color)
                    .await;
            }
        }
    }

    async fn kick_if_matchmaking(&self, row: &MatchRow) {
        if row.match_type == MatchType::Matchmaking && !tournament::is_tournament_time(&self.cfg) {
            self.kick.kick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plies_alternate_starting_white() {
        assert_eq!(mover_for_ply(1), Color::White);
        assert_eq!(mover_for_ply(2), Color::Black);
        assert_eq!(mover_for_ply(3), Color::White);
    }

    #[test]
    fn board_hash_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(hash_match_id(id), hash_match_id(id));
    }
}
