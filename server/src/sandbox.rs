//! Bounded execution of server-mode agents. The platform only depends on
//! the [`AgentSandbox`] contract: given a board and a color, produce a move
//! within the hard timeout. The builtin implementation resolves a small set
//! of named native strategies; container-isolated execution of arbitrary
//! code plugs in behind the same trait.

use async_trait::async_trait;
use common::{Board, Color, Move};
use rand::Rng;
use rand::seq::SliceRandom;
use std::time::{Duration, Instant};
use tracing::warn;

/// What came back from one bounded agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxVerdict {
    pub chosen: Option<Move>,
    pub move_time_ms: Option<u64>,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl SandboxVerdict {
    fn timeout() -> Self {
        Self { chosen: None, move_time_ms: None, timed_out: true, error: None }
    }

    fn error(message: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            chosen: None,
            move_time_ms: Some(elapsed_ms),
            timed_out: false,
            error: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait AgentSandbox: Send + Sync {
    /// Run the agent identified by `code_blob` for one move. The timeout is
    /// a hard bound: on expiry the verdict reports `timed_out` with no move.
    async fn request_move(
        &self,
        code_blob: &str,
        board: &Board,
        player: Color,
        var: serde_json::Value,
        timeout: Duration,
    ) -> SandboxVerdict;
}

/// Sandbox resolving the builtin strategy named by the code blob.
pub struct BuiltinSandbox;

impl BuiltinSandbox {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BuiltinSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentSandbox for BuiltinSandbox {
    async fn request_move(
        &self,
        code_blob: &str,
        board: &Board,
        player: Color,
        _var: serde_json::Value,
        timeout: Duration,
    ) -> SandboxVerdict {
        let started = Instant::now();
        let Some(strategy) = Strategy::parse(code_blob) else {
            return SandboxVerdict::error(
                "agent entry point not found",
                started.elapsed().as_millis() as u64,
            );
        };

        let board = board.clone();
        // The agent runs on a blocking worker under a hard timeout; a
        // strategy that overruns is abandoned, not joined.
        let work = tokio::task::spawn_blocking(move || strategy.choose(&board, player));
        match tokio::time::timeout(timeout, work).await {
            Ok(Ok(chosen)) => SandboxVerdict {
                chosen,
                move_time_ms: Some(started.elapsed().as_millis() as u64),
                timed_out: false,
                error: None,
            },
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "Sandbox worker panicked");
                SandboxVerdict::error("agent execution failed", started.elapsed().as_millis() as u64)
            }
            Err(_) => SandboxVerdict::timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    First,
    Random,
    Greedy,
}

impl Strategy {
    fn parse(code_blob: &str) -> Option<Strategy> {
        match code_blob.trim() {
            "first" => Some(Strategy::First),
            "random" => Some(Strategy::Random),
            "greedy" => Some(Strategy::Greedy),
            _ => None,
        }
    }

    fn choose(self, board: &Board, player: Color) -> Option<Move> {
        let moves = common::legal_moves(board, player);
        if moves.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        match self {
            Strategy::First => moves.first().copied(),
            Strategy::Random => moves.choose(&mut rng).copied(),
            Strategy::Greedy => {
                // Prefer the highest-value capture; fall back to a random
                // quiet move.
                let best = moves
                    .iter()
                    .filter_map(|m| board.piece_at(m.to).map(|p| (p.kind.value(), *m)))
                    .max_by(|a, b| a.0.total_cmp(&b.0));
                match best {
                    Some((_, m)) => Some(m),
                    None => {
                        let idx = rng.gen_range(0..moves.len());
                        Some(moves[idx])
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::boards;
    use common::{PieceType, Position};

    #[tokio::test]
    async fn builtin_strategies_return_legal_moves() {
        let sandbox = BuiltinSandbox::new();
        let board = boards::canonical0();
        for code in ["first", "random", "greedy"] {
            let verdict = sandbox
                .request_move(code, &board, Color::White, serde_json::json!([1, 14.0]), Duration::from_secs(2))
                .await;
            assert!(!verdict.timed_out);
            assert!(verdict.error.is_none());
            let chosen = verdict.chosen.expect("strategy should move");
            assert!(common::legal_moves(&board, Color::White).contains(&chosen));
            assert!(verdict.move_time_ms.is_some());
        }
    }

    #[tokio::test]
    async fn unknown_code_blob_is_an_error() {
        let sandbox = BuiltinSandbox::new();
        let board = boards::canonical0();
        let verdict = sandbox
            .request_move("import chaos", &board, Color::White, serde_json::json!([1, 14.0]), Duration::from_secs(1))
            .await;
        assert!(!verdict.timed_out);
        assert_eq!(verdict.error.as_deref(), Some("agent entry point not found"));
        assert!(verdict.chosen.is_none());
    }

    #[tokio::test]
    async fn greedy_takes_the_biggest_capture() {
        let sandbox = BuiltinSandbox::new();
        let mut board = common::Board::new(5, 5);
        board.place(PieceType::King, Color::White, Position::new(4, 4));
        board.place(PieceType::King, Color::Black, Position::new(4, 0));
        board.place(PieceType::Rook, Color::White, Position::new(0, 4));
        board.place(PieceType::Pawn, Color::Black, Position::new(0, 2));
        board.place(PieceType::Queen, Color::Black, Position::new(2, 0));

        let verdict = sandbox
            .request_move("greedy", &board, Color::White, serde_json::json!([1, 14.0]), Duration::from_secs(2))
            .await;
        // The pawn is the only reachable capture.
        assert_eq!(verdict.chosen.unwrap().to, Position::new(0, 2));
    }
}
