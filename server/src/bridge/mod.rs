//! Live-agent bridge: lets a match running in any worker obtain a move from
//! an agent process connected to some gateway, over the shared bus.

pub mod router;
pub mod session;
pub mod tcp_gateway;
pub mod ws_gateway;

use async_trait::async_trait;
use common::frames::MovePayload;
use common::{AppliedMove, Board, Color};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("local agent {agent_id} disconnected: {reason}")]
    AgentDisconnected {
        agent_id: Uuid,
        game_id: Option<Uuid>,
        reason: String,
    },
    #[error(transparent)]
    Bus(#[from] anyhow::Error),
}

/// Outcome of a routed move request. Disconnects surface as
/// [`BridgeError::AgentDisconnected`] instead.
#[derive(Debug, Clone, PartialEq)]
pub enum MoveResponse {
    Move { mv: MovePayload, elapsed_secs: f64 },
    Timeout { elapsed_secs: f64 },
    AgentError { message: String, elapsed_secs: f64 },
}

/// Request published on `requests:{agent_id}`; the gateway holding the
/// agent's session forwards it, all others ignore it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRequestMsg {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "responseChannel")]
    pub response_channel: String,
    #[serde(rename = "gameId")]
    pub game_id: Uuid,
    pub initial_board: Board,
    pub moves: Vec<AppliedMove>,
    pub player: Color,
    pub var: serde_json::Value,
}

/// Reply published on the per-request channel by the owning gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyFrame {
    Move {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "move")]
        mv: MovePayload,
        #[serde(skip_serializing_if = "Option::is_none")]
        elapsed: Option<f64>,
    },
    Timeout {
        #[serde(rename = "requestId")]
        request_id: String,
    },
    Error {
        #[serde(rename = "requestId")]
        request_id: String,
        error: String,
    },
    Disconnected {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "gameId", skip_serializing_if = "Option::is_none")]
        game_id: Option<Uuid>,
        reason: String,
    },
}

/// Event published on `disconnect:{agent_id}` when a session closes while
/// the agent still owns in-flight games.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectNotice {
    #[serde(rename = "gameId")]
    pub game_id: Uuid,
    pub reason: String,
}

/// The runner's view of the bridge. The production implementation routes
/// over the bus; tests substitute scripted agents.
#[async_trait]
pub trait LiveAgentClient: Send + Sync {
    async fn request_move(
        &self,
        agent_id: Uuid,
        game_id: Uuid,
        player: Color,
        var: serde_json::Value,
    ) -> Result<MoveResponse, BridgeError>;

    async fn notify_game_start(&self, agent_id: Uuid, game_id: Uuid, white: &str, black: &str);

    async fn notify_game_end(
        &self,
        agent_id: Uuid,
        game_id: Uuid,
        termination: &str,
        winner: Option<Color>,
    );
}

pub use router::{GameContextCache, MoveRouter};
pub use session::SessionManager;
