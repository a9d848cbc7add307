//! Starting positions: the two canonical boards every match can draw from,
//! plus the symmetric random generator used for variety outside tournaments.

use crate::board::{Board, Color, PieceType, Position};
use crate::engine::square_attacked;
use log::warn;
use rand::Rng;
use rand::seq::SliceRandom;

pub const BOARD_SIZE: i8 = 5;
pub const CANONICAL_COUNT: u64 = 2;

const MAX_GENERATOR_ATTEMPTS: usize = 50;

fn back_rank(board: &mut Board, color: Color, y: i8, order: [PieceType; 5]) {
    for (x, kind) in order.into_iter().enumerate() {
        board.place(kind, color, Position::new(x as i8, y));
    }
}

fn pawn_rank(board: &mut Board, color: Color, y: i8) {
    for x in 0..BOARD_SIZE {
        board.place(PieceType::Pawn, color, Position::new(x, y));
    }
}

/// Canonical board 0: full back ranks with the Right on the outer files.
pub fn canonical0() -> Board {
    use PieceType::*;
    let mut board = Board::new(BOARD_SIZE, BOARD_SIZE);
    back_rank(&mut board, Color::Black, 0, [Knight, Queen, King, Bishop, Right]);
    pawn_rank(&mut board, Color::Black, 1);
    pawn_rank(&mut board, Color::White, 3);
    back_rank(&mut board, Color::White, 4, [Right, Bishop, King, Queen, Knight]);
    board
}

/// Canonical board 1: minor pieces swapped relative to board 0.
pub fn canonical1() -> Board {
    use PieceType::*;
    let mut board = Board::new(BOARD_SIZE, BOARD_SIZE);
    back_rank(&mut board, Color::Black, 0, [Right, Queen, King, Knight, Bishop]);
    pawn_rank(&mut board, Color::Black, 1);
    pawn_rank(&mut board, Color::White, 3);
    back_rank(&mut board, Color::White, 4, [Bishop, Knight, King, Queen, Right]);
    board
}

pub fn canonical(index: u64) -> Board {
    if index % CANONICAL_COUNT == 0 { canonical0() } else { canonical1() }
}

/// Generate a random symmetric starting board: 3-8 pieces per side, exactly
/// one king each, white confined to its two home rows, black mirrored by a
/// 180-degree rotation, and neither king attacked in the initial position.
/// Falls back to canonical board 0 if no valid board is found.
pub fn random_symmetric(rng: &mut impl Rng) -> Board {
    let piece_pool = [
        PieceType::Pawn,
        PieceType::Knight,
        PieceType::Bishop,
        PieceType::Queen,
        PieceType::Right,
    ];

    for _ in 0..MAX_GENERATOR_ATTEMPTS {
        let per_side = rng.gen_range(3..=8);

        let mut home_squares: Vec<Position> = (0..BOARD_SIZE)
            .flat_map(|x| [Position::new(x, 3), Position::new(x, 4)])
            .collect();
        home_squares.shuffle(rng);

        let mut kinds = vec![PieceType::King];
        for _ in 1..per_side {
            kinds.push(piece_pool[rng.gen_range(0..piece_pool.len())]);
        }

        let mut board = Board::new(BOARD_SIZE, BOARD_SIZE);
        for (pos, kind) in home_squares.iter().take(per_side).zip(kinds.iter()) {
            board.place(*kind, Color::White, *pos);
            let mirrored = Position::new(BOARD_SIZE - 1 - pos.x, BOARD_SIZE - 1 - pos.y);
            board.place(*kind, Color::Black, mirrored);
        }

        let white_king = board.king_position(Color::White);
        let black_king = board.king_position(Color::Black);
        let safe = match (white_king, black_king) {
            (Some(w), Some(b)) => {
                !square_attacked(&board, w, Color::Black) && !square_attacked(&board, b, Color::White)
            }
            _ => false,
        };
        if safe {
            return board;
        }
    }

    warn!("random board generator exhausted {MAX_GENERATOR_ATTEMPTS} attempts, using canonical board");
    canonical0()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn canonical_boards_have_full_ranks() {
        for board in [canonical0(), canonical1()] {
            assert_eq!(board.pieces.len(), 20);
            assert_eq!(board.pieces_of(Color::White).count(), 10);
            assert!(board.king_position(Color::White).is_some());
            assert!(board.king_position(Color::Black).is_some());
        }
    }

    #[test]
    fn canonical_selection_wraps() {
        assert_eq!(canonical(0), canonical0());
        assert_eq!(canonical(3), canonical1());
    }

    #[test]
    fn random_boards_are_symmetric_with_safe_kings() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let board = random_symmetric(&mut rng);
            let white: Vec<_> = board.pieces_of(Color::White).collect();
            let black: Vec<_> = board.pieces_of(Color::Black).collect();
            assert_eq!(white.len(), black.len());
            assert!(white.len() >= 3 && white.len() <= 8);

            for piece in &white {
                let mirrored = Position::new(BOARD_SIZE - 1 - piece.x, BOARD_SIZE - 1 - piece.y);
                let twin = board.piece_at(mirrored).expect("mirrored square occupied");
                assert_eq!(twin.kind, piece.kind);
                assert_eq!(twin.player, Color::Black);
                // White stays on its two home rows.
                assert!(piece.y >= 3);
            }

            let wk = board.king_position(Color::White).unwrap();
            let bk = board.king_position(Color::Black).unwrap();
            assert!(!square_attacked(&board, wk, Color::Black));
            assert!(!square_attacked(&board, bk, Color::White));
        }
    }
}
