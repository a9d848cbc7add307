use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Board side. The wire format spells these lowercase (`"white"`/`"black"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

impl Color {
    pub fn opponent(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    /// Pawn travel direction. White sits on the high rows and advances
    /// toward row 0.
    pub fn forward(self) -> i8 {
        match self {
            Color::White => -1,
            Color::Black => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Color::White => "white",
            Color::Black => "black",
        }
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PieceType {
    King,
    Queen,
    Rook,
    Bishop,
    Knight,
    /// Hybrid piece combining knight jumps with rook slides.
    Right,
    Pawn,
}

impl PieceType {
    pub fn name(self) -> &'static str {
        match self {
            PieceType::King => "King",
            PieceType::Queen => "Queen",
            PieceType::Rook => "Rook",
            PieceType::Bishop => "Bishop",
            PieceType::Knight => "Knight",
            PieceType::Right => "Right",
            PieceType::Pawn => "Pawn",
        }
    }

    /// Material value used for position evaluation.
    pub fn value(self) -> f64 {
        match self {
            PieceType::Pawn => 1.0,
            PieceType::Knight | PieceType::Bishop => 3.0,
            PieceType::Rook => 5.0,
            PieceType::Right => 6.0,
            PieceType::Queen => 9.0,
            PieceType::King => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i8,
    pub y: i8,
}

impl Position {
    pub fn new(x: i8, y: i8) -> Position {
        Position { x, y }
    }

    pub fn offset(self, dx: i8, dy: i8) -> Position {
        Position { x: self.x + dx, y: self.y + dy }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    #[serde(rename = "type")]
    pub kind: PieceType,
    pub player: Color,
    pub x: i8,
    pub y: i8,
}

impl Piece {
    pub fn position(&self) -> Position {
        Position { x: self.x, y: self.y }
    }
}

/// A move that has been applied to the board, as carried on the wire for
/// board reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMove {
    pub from: Position,
    pub to: Position,
    pub piece: PieceType,
}

/// Serialized board: piece list plus dimensions. The initial position and an
/// ordered list of [`AppliedMove`]s suffice to reconstruct any later state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub pieces: Vec<Piece>,
    pub width: i8,
    pub height: i8,
}

impl Board {
    pub fn new(width: i8, height: i8) -> Board {
        Board { pieces: Vec::new(), width, height }
    }

    pub fn in_bounds(&self, pos: Position) -> bool {
        pos.x >= 0 && pos.y >= 0 && pos.x < self.width && pos.y < self.height
    }

    pub fn piece_at(&self, pos: Position) -> Option<&Piece> {
        self.pieces.iter().find(|p| p.x == pos.x && p.y == pos.y)
    }

    pub fn pieces_of(&self, color: Color) -> impl Iterator<Item = &Piece> {
        self.pieces.iter().filter(move |p| p.player == color)
    }

    pub fn place(&mut self, kind: PieceType, player: Color, pos: Position) {
        self.pieces.push(Piece { kind, player, x: pos.x, y: pos.y });
    }

    pub fn remove_at(&mut self, pos: Position) -> Option<Piece> {
        let idx = self.pieces.iter().position(|p| p.x == pos.x && p.y == pos.y)?;
        Some(self.pieces.swap_remove(idx))
    }

    pub fn king_position(&self, color: Color) -> Option<Position> {
        self.pieces_of(color)
            .find(|p| p.kind == PieceType::King)
            .map(|p| p.position())
    }

    /// Rebuild a board from an initial position and the ordered move list.
    /// Each move is applied mechanically; promotion follows the same rule as
    /// live play so both sides converge on identical state.
    pub fn replay(initial: &Board, moves: &[AppliedMove]) -> Result<Board> {
        let mut board = initial.clone();
        for (i, m) in moves.iter().enumerate() {
            let piece = board
                .piece_at(m.from)
                .copied()
                .ok_or_else(|| anyhow!("replay: no piece at ({},{}) for move {}", m.from.x, m.from.y, i))?;
            if piece.kind != m.piece {
                return Err(anyhow!(
                    "replay: expected {} at ({},{}), found {}",
                    m.piece.name(),
                    m.from.x,
                    m.from.y,
                    piece.kind.name()
                ));
            }
            crate::apply_move(&mut board, crate::Move { from: m.from, to: m.to });
        }
        Ok(board)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_wire_shape() {
        let mut board = Board::new(5, 5);
        board.place(PieceType::King, Color::White, Position::new(2, 4));
        let json = serde_json::to_value(&board).unwrap();
        assert_eq!(json["width"], 5);
        assert_eq!(json["pieces"][0]["type"], "King");
        assert_eq!(json["pieces"][0]["player"], "white");
        assert_eq!(json["pieces"][0]["x"], 2);

        let back: Board = serde_json::from_value(json).unwrap();
        assert_eq!(back, board);
    }

    #[test]
    fn replay_reconstructs_applied_moves() {
        let mut board = Board::new(5, 5);
        board.place(PieceType::King, Color::White, Position::new(2, 4));
        board.place(PieceType::King, Color::Black, Position::new(2, 0));
        board.place(PieceType::Queen, Color::White, Position::new(0, 4));

        let mv = AppliedMove {
            from: Position::new(0, 4),
            to: Position::new(0, 1),
            piece: PieceType::Queen,
        };
        let replayed = Board::replay(&board, &[mv]).unwrap();
        assert!(replayed.piece_at(Position::new(0, 1)).is_some());
        assert!(replayed.piece_at(Position::new(0, 4)).is_none());
    }

    #[test]
    fn replay_rejects_missing_piece() {
        let board = Board::new(5, 5);
        let mv = AppliedMove {
            from: Position::new(0, 0),
            to: Position::new(0, 1),
            piece: PieceType::Pawn,
        };
        assert!(Board::replay(&board, &[mv]).is_err());
    }
}
