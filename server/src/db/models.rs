use chrono::{DateTime, Utc};
use common::Color;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Server,
    Local,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Server => "server",
            ExecutionMode::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Option<ExecutionMode> {
        match s {
            "server" => Some(ExecutionMode::Server),
            "local" => Some(ExecutionMode::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Matchmaking,
    Tournament,
    Exhibition,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::Matchmaking => "matchmaking",
            MatchType::Tournament => "tournament",
            MatchType::Exhibition => "exhibition",
        }
    }

    pub fn parse(s: &str) -> Option<MatchType> {
        match s {
            "matchmaking" => Some(MatchType::Matchmaking),
            "tournament" => Some(MatchType::Tournament),
            "exhibition" => Some(MatchType::Exhibition),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Pending,
    InProgress,
    Completed,
    Error,
    Cancelled,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Pending => "pending",
            MatchStatus::InProgress => "in_progress",
            MatchStatus::Completed => "completed",
            MatchStatus::Error => "error",
            MatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<MatchStatus> {
        match s {
            "pending" => Some(MatchStatus::Pending),
            "in_progress" => Some(MatchStatus::InProgress),
            "completed" => Some(MatchStatus::Completed),
            "error" => Some(MatchStatus::Error),
            "cancelled" => Some(MatchStatus::Cancelled),
            _ => None,
        }
    }

    /// A match only moves forward through the status lattice.
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchStatus::Completed | MatchStatus::Error | MatchStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    White,
    Black,
    Draw,
}

impl Winner {
    pub fn as_str(self) -> &'static str {
        match self {
            Winner::White => "white",
            Winner::Black => "black",
            Winner::Draw => "draw",
        }
    }

    pub fn parse(s: &str) -> Option<Winner> {
        match s {
            "white" => Some(Winner::White),
            "black" => Some(Winner::Black),
            "draw" => Some(Winner::Draw),
            _ => None,
        }
    }

    pub fn from_color(color: Color) -> Winner {
        match color {
            Color::White => Winner::White,
            Color::Black => Winner::Black,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Checkmate,
    Stalemate,
    Draw,
    InsufficientMaterial,
    Timeout,
    WhiteInvalid,
    BlackInvalid,
    WhiteError,
    BlackError,
    Cancelled,
    StuckTimeout,
    MaxMoves,
    GameOver,
    SystemError,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::Checkmate => "checkmate",
            Termination::Stalemate => "stalemate",
            Termination::Draw => "draw",
            Termination::InsufficientMaterial => "insufficient_material",
            Termination::Timeout => "timeout",
            Termination::WhiteInvalid => "white_invalid",
            Termination::BlackInvalid => "black_invalid",
            Termination::WhiteError => "white_error",
            Termination::BlackError => "black_error",
            Termination::Cancelled => "cancelled",
            Termination::StuckTimeout => "stuck_timeout",
            Termination::MaxMoves => "max_moves",
            Termination::GameOver => "game_over",
            Termination::SystemError => "system_error",
        }
    }

    pub fn invalid_for(color: Color) -> Termination {
        match color {
            Color::White => Termination::WhiteInvalid,
            Color::Black => Termination::BlackInvalid,
        }
    }

    pub fn error_for(color: Color) -> Termination {
        match color {
            Color::White => Termination::WhiteError,
            Color::Black => Termination::BlackError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Ws,
    P2p,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Ws => "ws",
            Transport::P2p => "p2p",
        }
    }

    pub fn parse(s: &str) -> Option<Transport> {
        match s {
            "ws" => Some(Transport::Ws),
            "p2p" => Some(Transport::P2p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    InGame,
    Draining,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::InGame => "in_game",
            ConnectionStatus::Draining => "draining",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }

    pub fn parse(s: &str) -> Option<ConnectionStatus> {
        match s {
            "connected" => Some(ConnectionStatus::Connected),
            "in_game" => Some(ConnectionStatus::InGame),
            "draining" => Some(ConnectionStatus::Draining),
            "disconnected" => Some(ConnectionStatus::Disconnected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Pending,
    Testing,
    Passed,
    Failed,
}

impl ValidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Testing => "testing",
            ValidationStatus::Passed => "passed",
            ValidationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<ValidationStatus> {
        match s {
            "pending" => Some(ValidationStatus::Pending),
            "testing" => Some(ValidationStatus::Testing),
            "passed" => Some(ValidationStatus::Passed),
            "failed" => Some(ValidationStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub version: i32,
    pub code_blob: String,
    pub code_hash: String,
    pub execution_mode: ExecutionMode,
    pub active: bool,
    pub connection_token_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAgent {
    pub owner_id: Uuid,
    pub name: String,
    pub version: i32,
    pub code_blob: String,
    pub code_hash: String,
    pub execution_mode: ExecutionMode,
    pub connection_token_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ranking {
    pub agent_id: Uuid,
    pub rating: i32,
    pub games_played: i32,
    pub wins: i32,
    pub losses: i32,
    pub draws: i32,
    pub avg_move_time_ms: Option<i64>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRow {
    pub id: Uuid,
    pub white_agent_id: Uuid,
    pub black_agent_id: Uuid,
    pub match_type: MatchType,
    pub status: MatchStatus,
    pub winner: Option<Winner>,
    pub moves: i32,
    pub termination: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameStateRow {
    pub match_id: Uuid,
    pub move_number: i32,
    pub board_state: serde_json::Value,
    pub move_time_ms: i64,
    pub notation: String,
    pub evaluation: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAgentConnection {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub transport: Transport,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    pub remote_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationEntry {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub code_blob: String,
    pub name: String,
    pub version: i32,
    pub code_hash: String,
    pub status: ValidationStatus,
    pub error: Option<String>,
    pub test_duration_ms: Option<i64>,
    pub agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Scheduler-facing snapshot of an eligible agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateAgent {
    pub id: Uuid,
    pub name: String,
    pub execution_mode: ExecutionMode,
    pub rating: i32,
    pub games_played: i32,
    pub active_matches: i64,
}

/// Outcome of a completed match, as consumed by Swiss standings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub white_agent_id: Uuid,
    pub black_agent_id: Uuid,
    pub winner: Option<Winner>,
}

/// Everything the rating task needs about one completed match.
#[derive(Debug, Clone)]
pub struct RatingContext {
    pub white_agent_id: Uuid,
    pub black_agent_id: Uuid,
    pub winner: Option<Winner>,
    pub white_rating: i32,
    pub white_games: i32,
    pub black_rating: i32,
    pub black_games: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameOutcome {
    Win,
    Loss,
    Draw,
}

#[derive(Debug, Clone)]
pub struct RatingUpdate {
    pub agent_id: Uuid,
    pub change: i32,
    pub outcome: GameOutcome,
    pub avg_move_time_ms: Option<i64>,
}
