//! Session frames exchanged between a locally-running agent and a gateway.
//! JSON, tagged on `type`; newline-delimited over TCP, one frame per message
//! over WebSocket.

use crate::board::{AppliedMove, Board, Color, PieceType, Position};
use serde::{Deserialize, Serialize};

/// Per-move payload reported by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovePayload {
    #[serde(rename = "piecePosition")]
    pub piece_position: Position,
    #[serde(rename = "movePosition")]
    pub move_position: Position,
    #[serde(rename = "pieceType", skip_serializing_if = "Option::is_none")]
    pub piece_type: Option<PieceType>,
}

/// Frames sent by the agent client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect {
        #[serde(rename = "agentId")]
        agent_id: String,
        #[serde(rename = "connectionToken")]
        connection_token: String,
    },
    Heartbeat,
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
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
    },
    Status {
        status: String,
    },
}

/// Frames sent by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayFrame {
    Connected {
        #[serde(rename = "agentId")]
        agent_id: String,
        #[serde(rename = "agentName")]
        agent_name: String,
    },
    Disconnect {
        reason: String,
    },
    MoveRequest {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "gameId")]
        game_id: String,
        initial_board: Board,
        moves: Vec<AppliedMove>,
        player: Color,
        var: serde_json::Value,
    },
    GameStart {
        #[serde(rename = "gameId")]
        game_id: String,
        white: String,
        black: String,
    },
    GameEnd {
        #[serde(rename = "gameId")]
        game_id: String,
        result: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        winner: Option<Color>,
    },
    Error {
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_round_trips() {
        let json = r#"{"type":"connect","agentId":"abc","connectionToken":"tok"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Connect { agent_id: "abc".into(), connection_token: "tok".into() }
        );
    }

    #[test]
    fn move_frame_carries_positions_and_elapsed() {
        let json = r#"{
            "type":"move",
            "requestId":"r1",
            "move":{"piecePosition":{"x":1,"y":3},"movePosition":{"x":1,"y":2}},
            "elapsed":2.5
        }"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Move { request_id, mv, elapsed } => {
                assert_eq!(request_id, "r1");
                assert_eq!(mv.piece_position, Position::new(1, 3));
                assert_eq!(mv.piece_type, None);
                assert_eq!(elapsed, Some(2.5));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn move_request_serializes_reconstruction_payload() {
        let board = crate::boards::canonical0();
        let frame = GatewayFrame::MoveRequest {
            request_id: "r1".into(),
            game_id: "g1".into(),
            initial_board: board,
            moves: vec![AppliedMove {
                from: Position::new(0, 3),
                to: Position::new(0, 2),
                piece: PieceType::Pawn,
            }],
            player: Color::Black,
            var: serde_json::json!([1, 14.0]),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "move_request");
        assert_eq!(value["player"], "black");
        assert_eq!(value["moves"][0]["piece"], "Pawn");
        assert_eq!(value["initial_board"]["width"], 5);
    }

    #[test]
    fn disconnect_reason_round_trips() {
        let frame = GatewayFrame::Disconnect { reason: "superseded".into() };
        let json = serde_json::to_string(&frame).unwrap();
        let back: GatewayFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(frame, back);
    }
}
