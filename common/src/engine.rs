use crate::board::{Board, Color, Piece, PieceType, Position};
use serde::{Deserialize, Serialize};

/// A candidate move: source square to destination square. Promotion is
/// implicit (a pawn reaching the far rank becomes a queen).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Move {
    pub from: Position,
    pub to: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameResult {
    Checkmate { winner: Color },
    Stalemate,
}

const KING_STEPS: [(i8, i8); 8] = [
    (-1, -1), (0, -1), (1, -1), (-1, 0), (1, 0), (-1, 1), (0, 1), (1, 1),
];
const KNIGHT_JUMPS: [(i8, i8); 8] = [
    (-2, -1), (-2, 1), (-1, -2), (-1, 2), (1, -2), (1, 2), (2, -1), (2, 1),
];
const ROOK_RAYS: [(i8, i8); 4] = [(0, -1), (0, 1), (-1, 0), (1, 0)];
const BISHOP_RAYS: [(i8, i8); 4] = [(-1, -1), (1, -1), (-1, 1), (1, 1)];

fn push_step(board: &Board, piece: &Piece, dx: i8, dy: i8, out: &mut Vec<Position>) {
    let to = piece.position().offset(dx, dy);
    if !board.in_bounds(to) {
        return;
    }
    match board.piece_at(to) {
        Some(other) if other.player == piece.player => {}
        _ => out.push(to),
    }
}

fn push_ray(board: &Board, piece: &Piece, dx: i8, dy: i8, out: &mut Vec<Position>) {
    let mut to = piece.position().offset(dx, dy);
    while board.in_bounds(to) {
        match board.piece_at(to) {
            Some(other) => {
                if other.player != piece.player {
                    out.push(to);
                }
                return;
            }
            None => out.push(to),
        }
        to = to.offset(dx, dy);
    }
}

/// Destination squares reachable by a piece, ignoring exposure of the
/// mover's own king.
pub fn pseudo_destinations(board: &Board, piece: &Piece) -> Vec<Position> {
    let mut out = Vec::new();
    match piece.kind {
        PieceType::King => {
            for (dx, dy) in KING_STEPS {
                push_step(board, piece, dx, dy, &mut out);
            }
        }
        PieceType::Knight => {
            for (dx, dy) in KNIGHT_JUMPS {
                push_step(board, piece, dx, dy, &mut out);
            }
        }
        PieceType::Rook => {
            for (dx, dy) in ROOK_RAYS {
                push_ray(board, piece, dx, dy, &mut out);
            }
        }
        PieceType::Bishop => {
            for (dx, dy) in BISHOP_RAYS {
                push_ray(board, piece, dx, dy, &mut out);
            }
        }
        PieceType::Queen => {
            for (dx, dy) in ROOK_RAYS.iter().chain(BISHOP_RAYS.iter()) {
                push_ray(board, piece, *dx, *dy, &mut out);
            }
        }
        PieceType::Right => {
            for (dx, dy) in KNIGHT_JUMPS {
                push_step(board, piece, dx, dy, &mut out);
            }
            for (dx, dy) in ROOK_RAYS {
                push_ray(board, piece, dx, dy, &mut out);
            }
        }
        PieceType::Pawn => {
            let dy = piece.player.forward();
            let ahead = piece.position().offset(0, dy);
            if board.in_bounds(ahead) && board.piece_at(ahead).is_none() {
                out.push(ahead);
            }
            for dx in [-1, 1] {
                let diag = piece.position().offset(dx, dy);
                if board.in_bounds(diag) {
                    if let Some(other) = board.piece_at(diag) {
                        if other.player != piece.player {
                            out.push(diag);
                        }
                    }
                }
            }
        }
    }
    out
}

/// Whether `by` attacks `target`. Pawns only attack diagonally.
pub fn square_attacked(board: &Board, target: Position, by: Color) -> bool {
    for piece in board.pieces_of(by) {
        let hits = match piece.kind {
            PieceType::Pawn => {
                let dy = piece.player.forward();
                [-1, 1]
                    .iter()
                    .any(|dx| piece.position().offset(*dx, dy) == target)
            }
            _ => pseudo_destinations(board, piece).contains(&target),
        };
        if hits {
            return true;
        }
    }
    false
}

pub fn in_check(board: &Board, color: Color) -> bool {
    match board.king_position(color) {
        Some(pos) => square_attacked(board, pos, color.opponent()),
        None => true,
    }
}

/// All legal moves for `color`: pseudo moves minus those that leave the
/// mover's king attacked.
pub fn legal_moves(board: &Board, color: Color) -> Vec<Move> {
    let mut out = Vec::new();
    for piece in board.pieces_of(color) {
        for to in pseudo_destinations(board, piece) {
            let mv = Move { from: piece.position(), to };
            let mut scratch = board.clone();
            apply_move(&mut scratch, mv);
            if !in_check(&scratch, color) {
                out.push(mv);
            }
        }
    }
    out
}

/// Apply a move, removing any captured piece and promoting pawns that reach
/// the far rank. Returns the captured piece, if any.
pub fn apply_move(board: &mut Board, mv: Move) -> Option<Piece> {
    let captured = board.remove_at(mv.to);
    if let Some(idx) = board.pieces.iter().position(|p| p.position() == mv.from) {
        let piece = &mut board.pieces[idx];
        piece.x = mv.to.x;
        piece.y = mv.to.y;
        if piece.kind == PieceType::Pawn {
            let last_rank = match piece.player {
                Color::White => 0,
                Color::Black => board.height - 1,
            };
            if piece.y == last_rank {
                piece.kind = PieceType::Queen;
            }
        }
    }
    captured
}

/// Terminal verdict for the side to move, or `None` if the game continues.
pub fn game_result(board: &Board, to_move: Color) -> Option<GameResult> {
    if !legal_moves(board, to_move).is_empty() {
        return None;
    }
    if in_check(board, to_move) {
        Some(GameResult::Checkmate { winner: to_move.opponent() })
    } else {
        Some(GameResult::Stalemate)
    }
}

/// Material evaluation, white-positive.
pub fn evaluate(board: &Board) -> f64 {
    let mut score = 0.0;
    for piece in &board.pieces {
        match piece.player {
            Color::White => score += piece.kind.value(),
            Color::Black => score -= piece.kind.value(),
        }
    }
    (score * 100.0).round() / 100.0
}
