use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use common::frames::GatewayFrame;
use common::{AppliedMove, Board, Color};
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BridgeError, DisconnectNotice, MoveRequestMsg, MoveResponse, ReplyFrame};
use crate::db::models::ConnectionStatus;
use crate::redis_keys::RedisKeys;

/// Per-worker reconstruction cache: for each in-flight game with a local
/// participant, the initial position and the ordered list of applied moves.
/// A move request carries this payload so the agent can rebuild the board
/// identically to the server.
#[derive(Default)]
pub struct GameContextCache {
    games: Mutex<HashMap<Uuid, GameContext>>,
}

#[derive(Clone)]
struct GameContext {
    initial_board: Board,
    moves: Vec<AppliedMove>,
}

impl GameContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_game(&self, game_id: Uuid, initial_board: Board) {
        let mut games = self.games.lock().expect("cache lock poisoned");
        games.insert(game_id, GameContext { initial_board, moves: Vec::new() });
        debug!(%game_id, "Initialized reconstruction cache");
    }

    /// Append a move after it has been applied server-side.
    pub fn append_move(&self, game_id: Uuid, applied: AppliedMove) {
        let mut games = self.games.lock().expect("cache lock poisoned");
        match games.get_mut(&game_id) {
            Some(ctx) => ctx.moves.push(applied),
            None => warn!(%game_id, "Reconstruction cache missing, cannot append move"),
        }
    }

    pub fn payload(&self, game_id: Uuid) -> Option<(Board, Vec<AppliedMove>)> {
        let games = self.games.lock().expect("cache lock poisoned");
        games.get(&game_id).map(|ctx| (ctx.initial_board.clone(), ctx.moves.clone()))
    }

    pub fn clear_game(&self, game_id: Uuid) {
        let mut games = self.games.lock().expect("cache lock poisoned");
        if games.remove(&game_id).is_some() {
            debug!(%game_id, "Cleared reconstruction cache");
        }
    }
}

/// Runner-side half of the bridge: publishes move requests on the agent's
/// channel and waits on a per-request reply channel.
pub struct MoveRouter {
    client: redis::Client,
    conn: ConnectionManager,
    keys: RedisKeys,
    move_timeout: Duration,
}

impl MoveRouter {
    pub fn new(client: redis::Client, conn: ConnectionManager, move_timeout: Duration) -> Self {
        Self { client, conn, keys: RedisKeys::new(), move_timeout }
    }

    async fn publish_notification(&self, agent_id: Uuid, frame: &GatewayFrame) {
        let channel = self.keys.agent_notifications(agent_id);
        let payload = match serde_json::to_vec(frame) {
            Ok(p) => p,
            Err(e) => {
                warn!(%agent_id, error = %e, "Failed to serialize notification");
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn.publish::<_, _, ()>(&channel, payload).await {
            warn!(%agent_id, error = %e, "Failed to publish notification");
        }
    }

    /// Whether presence says the agent is still attached to some gateway.
    async fn agent_present(&self, agent_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        let status: Option<String> = conn
            .hget(self.keys.presence(agent_id), "status")
            .await
            .context("Failed to read agent presence")?;
        Ok(matches!(
            status.as_deref().and_then(ConnectionStatus::parse),
            Some(ConnectionStatus::Connected) | Some(ConnectionStatus::InGame)
        ))
    }

    async fn await_reply(
        &self,
        pubsub: &mut redis::aio::PubSub,
        request_id: &str,
        reply_channel: &str,
        disconnect_channel: &str,
        agent_id: Uuid,
        game_id: Uuid,
        started: Instant,
    ) -> Result<MoveResponse, BridgeError> {
        let deadline = tokio::time::Instant::from_std(started + self.move_timeout);
        let mut stream = pubsub.on_message();

        loop {
            let msg = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(anyhow!("bridge pubsub stream closed").into()),
                Err(_) => {
                    // Wait expired with no reply. If presence says the agent
                    // is gone, this is a disconnect, not a slow move.
                    let elapsed_secs = started.elapsed().as_secs_f64();
                    match self.agent_present(agent_id).await {
                        Ok(false) => {
                            return Err(BridgeError::AgentDisconnected {
                                agent_id,
                                game_id: Some(game_id),
                                reason: "Agent disconnected during move timeout".to_string(),
                            });
                        }
                        Ok(true) => {}
                        Err(e) => {
                            warn!(%agent_id, error = %e, "Presence check failed, treating as timeout");
                        }
                    }
                    return Ok(MoveResponse::Timeout { elapsed_secs });
                }
            };

            let channel = msg.get_channel_name().to_string();
            let payload: Vec<u8> = msg.get_payload().map_err(|e| anyhow!(e))?;
            let elapsed_secs = started.elapsed().as_secs_f64();

            if channel == disconnect_channel {
                // A move reply returns from this loop immediately, so a
                // disconnect observed here always precedes any valid move
                // for this request: raise it.
                let notice: Option<DisconnectNotice> = serde_json::from_slice(&payload).ok();
                return Err(BridgeError::AgentDisconnected {
                    agent_id,
                    game_id: notice.as_ref().map(|n| n.game_id).or(Some(game_id)),
                    reason: notice
                        .map(|n| n.reason)
                        .unwrap_or_else(|| "Agent disconnected".to_string()),
                });
            }

            if channel != reply_channel {
                continue;
            }

            let frame: ReplyFrame = match serde_json::from_slice(&payload) {
                Ok(f) => f,
                Err(e) => {
                    warn!(%agent_id, error = %e, "Invalid reply payload, ignoring");
                    continue;
                }
            };

            match frame {
                ReplyFrame::Move { request_id: rid, mv, elapsed } => {
                    if rid != request_id {
                        debug!(%agent_id, stale = %rid, "Dropping reply for stale request id");
                        continue;
                    }
                    // Trust the agent's self-reported elapsed unless it is
                    // implausibly small; anomalously large values are logged
                    // but still used.
                    let elapsed_secs = match elapsed {
                        Some(agent_elapsed) if agent_elapsed < 0.001 => {
                            warn!(%agent_id, agent_elapsed, server_elapsed = elapsed_secs,
                                  "Suspicious agent-reported elapsed, using server-measured");
                            elapsed_secs
                        }
                        Some(agent_elapsed) => {
                            if agent_elapsed > elapsed_secs + 1.0 {
                                warn!(%agent_id, agent_elapsed, server_elapsed = elapsed_secs,
                                      "Agent-reported elapsed exceeds round-trip");
                            }
                            agent_elapsed
                        }
                        None => elapsed_secs,
                    };
                    return Ok(MoveResponse::Move { mv, elapsed_secs });
                }
                ReplyFrame::Timeout { request_id: rid } => {
                    if rid != request_id {
                        continue;
                    }
                    info!(%agent_id, %game_id, "Agent explicitly reported timeout");
                    return Ok(MoveResponse::Timeout { elapsed_secs });
                }
                ReplyFrame::Error { request_id: rid, error } => {
                    if rid != request_id {
                        continue;
                    }
                    info!(%agent_id, %game_id, error, "Agent reported error");
                    return Ok(MoveResponse::AgentError { message: error, elapsed_secs });
                }
                ReplyFrame::Disconnected { request_id: rid, game_id: gid, reason } => {
                    if rid != request_id {
                        continue;
                    }
                    return Err(BridgeError::AgentDisconnected {
                        agent_id,
                        game_id: gid.or(Some(game_id)),
                        reason,
                    });
                }
            }
        }
    }
}

/// Shared handle the match runner holds: router plus the reconstruction
/// cache requests are built from.
pub struct BusBridge {
    pub router: MoveRouter,
    pub cache: std::sync::Arc<GameContextCache>,
}

impl BusBridge {
    pub fn new(router: MoveRouter, cache: std::sync::Arc<GameContextCache>) -> Self {
        Self { router, cache }
    }
}

#[async_trait]
impl super::LiveAgentClient for BusBridge {
    async fn request_move(
        &self,
        agent_id: Uuid,
        game_id: Uuid,
        player: Color,
        var: serde_json::Value,
    ) -> Result<MoveResponse, BridgeError> {
        let (initial_board, moves) = self
            .cache
            .payload(game_id)
            .ok_or_else(|| anyhow!("no reconstruction context for game {game_id}"))?;

        let request_id = Uuid::new_v4().to_string();
        let reply_channel = self.router.keys.move_reply(&request_id);
        let disconnect_channel = self.router.keys.agent_disconnect(agent_id);

        let mut pubsub = self
            .router
            .client
            .get_async_pubsub()
            .await
            .context("Failed to open bridge pubsub connection")?;
        pubsub
            .subscribe(&reply_channel)
            .await
            .context("Failed to subscribe to reply channel")?;
        pubsub
            .subscribe(&disconnect_channel)
            .await
            .context("Failed to subscribe to disconnect channel")?;

        let request = MoveRequestMsg {
            request_id: request_id.clone(),
            response_channel: reply_channel.clone(),
            game_id,
            initial_board,
            moves,
            player,
            var,
        };
        let payload = serde_json::to_vec(&request).context("Failed to serialize move request")?;

        let started = Instant::now();
        let mut conn = self.router.conn.clone();
        let publish: Result<()> = conn
            .publish(self.router.keys.move_requests(agent_id), payload)
            .await
            .context("Failed to publish move request");

        let outcome = match publish {
            Ok(()) => {
                debug!(%agent_id, %game_id, request_id, player = %player, "Published move request");
                self.router
                    .await_reply(
                        &mut pubsub,
                        &request_id,
                        &reply_channel,
                        &disconnect_channel,
                        agent_id,
                        game_id,
                        started,
                    )
                    .await
            }
            Err(e) => Err(e.into()),
        };

        // Release subscriptions regardless of outcome.
        if let Err(e) = pubsub.unsubscribe(&reply_channel).await {
            warn!(channel = %reply_channel, error = %e, "Failed to unsubscribe reply channel");
        }
        if let Err(e) = pubsub.unsubscribe(&disconnect_channel).await {
            warn!(channel = %disconnect_channel, error = %e, "Failed to unsubscribe disconnect channel");
        }

        outcome
    }

    async fn notify_game_start(&self, agent_id: Uuid, game_id: Uuid, white: &str, black: &str) {
        self.router
            .publish_notification(
                agent_id,
                &GatewayFrame::GameStart {
                    game_id: game_id.to_string(),
                    white: white.to_string(),
                    black: black.to_string(),
                },
            )
            .await;
    }

    async fn notify_game_end(
        &self,
        agent_id: Uuid,
        game_id: Uuid,
        termination: &str,
        winner: Option<Color>,
    ) {
        self.router
            .publish_notification(
                agent_id,
                &GatewayFrame::GameEnd {
                    game_id: game_id.to_string(),
                    result: termination.to_string(),
                    winner,
                },
            )
            .await;
    }
}

/// Validate a reported move against the board reconstructed from the game
/// context, exactly as the remote agent saw it. Returns the legal move if
/// the payload names one.
pub fn validate_move_payload(
    initial_board: &Board,
    moves: &[AppliedMove],
    payload: &common::frames::MovePayload,
    player: Color,
) -> Result<common::Move> {
    let board = Board::replay(initial_board, moves).context("Board reconstruction failed")?;
    let piece = board
        .piece_at(payload.piece_position)
        .ok_or_else(|| anyhow!("no piece at source square"))?;
    if piece.player != player {
        anyhow::bail!("piece belongs to {}", piece.player);
    }
    let candidate = common::Move { from: payload.piece_position, to: payload.move_position };
    if common::legal_moves(&board, player).contains(&candidate) {
        Ok(candidate)
    } else {
        anyhow::bail!("move is not legal in the reconstructed position")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::PieceType;
    use common::Position;
    use common::boards;
    use common::frames::MovePayload;

    #[test]
    fn cache_tracks_moves_per_game() {
        let cache = GameContextCache::new();
        let game = Uuid::new_v4();
        cache.init_game(game, boards::canonical0());

        let (board, moves) = cache.payload(game).unwrap();
        assert_eq!(board, boards::canonical0());
        assert!(moves.is_empty());

        cache.append_move(
            game,
            AppliedMove {
                from: Position::new(0, 3),
                to: Position::new(0, 2),
                piece: PieceType::Pawn,
            },
        );
        let (_, moves) = cache.payload(game).unwrap();
        assert_eq!(moves.len(), 1);

        cache.clear_game(game);
        assert!(cache.payload(game).is_none());
    }

    #[test]
    fn move_validation_accepts_legal_and_rejects_foreign_pieces() {
        let board = boards::canonical0();
        let ok = MovePayload {
            piece_position: Position::new(0, 3),
            move_position: Position::new(0, 2),
            piece_type: None,
        };
        assert!(validate_move_payload(&board, &[], &ok, Color::White).is_ok());

        // Black pawn moved by white
        let foreign = MovePayload {
            piece_position: Position::new(0, 1),
            move_position: Position::new(0, 2),
            piece_type: None,
        };
        assert!(validate_move_payload(&board, &[], &foreign, Color::White).is_err());

        // Illegal destination
        let illegal = MovePayload {
            piece_position: Position::new(0, 3),
            move_position: Position::new(3, 3),
            piece_type: None,
        };
        assert!(validate_move_payload(&board, &[], &illegal, Color::White).is_err());
    }

    #[test]
    fn append_to_unknown_game_is_ignored() {
        let cache = GameContextCache::new();
        cache.append_move(
            Uuid::new_v4(),
            AppliedMove {
                from: Position::new(0, 3),
                to: Position::new(0, 2),
                piece: PieceType::Pawn,
            },
        );
    }
}
