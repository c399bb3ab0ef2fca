//! Board Rules
//!
//! The match engine treats move legality as a black box behind
//! [`RulesEngine`]. [`StandardChess`] implements it on the `chess` crate with
//! positions stored as FEN strings.

use std::str::FromStr;

use chess::{Board, ChessMove, MoveGen, Piece, Square};
use thiserror::Error;

use crate::error::GameError;

/// Position alias used for the standard starting position.
pub const START_POSITION: &str = "startpos";

/// A sanitized move request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    /// Origin square, e.g. "e2".
    pub from: String,
    /// Target square.
    pub to: String,
    /// Promotion piece letter (`q`, `r`, `b`, `n`).
    pub promotion: Option<char>,
}

impl MoveRequest {
    /// Validate raw client input.
    ///
    /// Squares must be `[a-h][1-8]`. Promotion accepts a piece letter or the
    /// full piece name and is reduced to its letter.
    pub fn sanitize(from: &str, to: &str, promotion: Option<&str>) -> Result<Self, GameError> {
        let from = sanitize_square(from)?;
        let to = sanitize_square(to)?;
        let promotion = match promotion.map(|p| p.trim().to_lowercase()) {
            None => None,
            Some(p) if p.is_empty() => None,
            Some(p) => match p.as_str() {
                "q" | "queen" => Some('q'),
                "r" | "rook" => Some('r'),
                "b" | "bishop" => Some('b'),
                "n" | "knight" => Some('n'),
                _ => return Err(GameError::Validation(format!("invalid promotion '{p}'"))),
            },
        };
        if from == to {
            return Err(GameError::Validation("origin and target squares are equal".to_string()));
        }
        Ok(Self { from, to, promotion })
    }
}

fn sanitize_square(raw: &str) -> Result<String, GameError> {
    let square = raw.trim();
    let bytes = square.as_bytes();
    let valid = bytes.len() == 2 && (b'a'..=b'h').contains(&bytes[0]) && (b'1'..=b'8').contains(&bytes[1]);
    if valid {
        Ok(square.to_string())
    } else {
        Err(GameError::Validation(format!("invalid square '{square}'")))
    }
}

/// Result of a legal move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMove {
    /// Position after the move.
    pub position_after: String,
    /// Moved piece letter, lowercase.
    pub piece: char,
    /// Captured piece letter, lowercase.
    pub captured: Option<char>,
    /// Promotion piece letter, lowercase.
    pub promotion: Option<char>,
    /// Standard algebraic notation.
    pub notation: String,
}

/// Terminal board condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardOutcome {
    /// Side to move is mated; the previous mover wins.
    Checkmate,
    /// Side to move has no legal move.
    Stalemate,
    /// No side can deliver mate.
    InsufficientMaterial,
    /// Current position occurred three times.
    ThreefoldRepetition,
}

/// Rules engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RulesError {
    /// Stored position could not be parsed.
    #[error("invalid position: {0}")]
    InvalidPosition(String),

    /// No piece on the origin square.
    #[error("no piece on {0}")]
    EmptySquare(String),

    /// Move is not legal in the position.
    #[error("illegal move {0}")]
    IllegalMove(String),
}

impl From<RulesError> for GameError {
    fn from(err: RulesError) -> Self {
        GameError::Validation(err.to_string())
    }
}

/// Legality and terminal-state oracle for a board game.
pub trait RulesEngine: Send + Sync {
    /// Position a new match starts from.
    fn initial_position(&self) -> String;

    /// Validate and apply a move.
    fn apply_move(&self, position: &str, request: &MoveRequest) -> Result<AppliedMove, RulesError>;

    /// Terminal condition of `position`.
    ///
    /// `history` lists every position of the game in order, from the initial
    /// position up to and including `position`.
    fn outcome(&self, position: &str, history: &[&str]) -> Option<BoardOutcome>;
}

// =============================================================================
// STANDARD CHESS
// =============================================================================

/// Standard chess rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardChess;

impl StandardChess {
    /// Create the engine.
    pub fn new() -> Self {
        Self
    }

    fn board(position: &str) -> Result<Board, RulesError> {
        if position == START_POSITION {
            return Ok(Board::default());
        }
        Board::from_str(position).map_err(|_| RulesError::InvalidPosition(position.to_string()))
    }

    fn square(name: &str) -> Result<Square, RulesError> {
        Square::from_str(name).map_err(|_| RulesError::IllegalMove(name.to_string()))
    }
}

fn piece_letter(piece: Piece) -> char {
    match piece {
        Piece::Pawn => 'p',
        Piece::Knight => 'n',
        Piece::Bishop => 'b',
        Piece::Rook => 'r',
        Piece::Queen => 'q',
        Piece::King => 'k',
    }
}

fn promotion_piece(letter: char) -> Option<Piece> {
    match letter {
        'q' => Some(Piece::Queen),
        'r' => Some(Piece::Rook),
        'b' => Some(Piece::Bishop),
        'n' => Some(Piece::Knight),
        _ => None,
    }
}

/// Placement, side to move, castling and en passant fields of a FEN.
fn repetition_key(position: &str) -> String {
    if position == START_POSITION {
        return repetition_key(&Board::default().to_string());
    }
    position.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
}

fn is_insufficient_material(board: &Board) -> bool {
    let heavy = *board.pieces(Piece::Pawn) | *board.pieces(Piece::Rook) | *board.pieces(Piece::Queen);
    if heavy.popcnt() > 0 {
        return false;
    }

    let knights = board.pieces(Piece::Knight).popcnt();
    let bishops = *board.pieces(Piece::Bishop);
    let minors = knights + bishops.popcnt();

    match minors {
        0 | 1 => true,
        _ if knights == 0 => {
            // Any number of bishops, all on one square color.
            let shades: Vec<usize> = bishops
                .into_iter()
                .map(|sq| (sq.get_rank().to_index() + sq.get_file().to_index()) % 2)
                .collect();
            shades.windows(2).all(|w| w[0] == w[1])
        }
        _ => false,
    }
}

fn notation(board: &Board, after: &Board, mv: ChessMove, piece: Piece, captured: bool) -> String {
    let from = mv.get_source();
    let to = mv.get_dest();
    let file_delta = to.get_file().to_index() as i32 - from.get_file().to_index() as i32;

    let mut san = if piece == Piece::King && file_delta.abs() == 2 {
        if file_delta > 0 { "O-O".to_string() } else { "O-O-O".to_string() }
    } else {
        let mut san = String::new();
        if piece == Piece::Pawn {
            if captured {
                san.push_str(&from.to_string()[..1]);
            }
        } else {
            san.push(piece_letter(piece).to_ascii_uppercase());
            let rivals: Vec<Square> = MoveGen::new_legal(board)
                .filter(|m| m.get_dest() == to && m.get_source() != from)
                .filter(|m| board.piece_on(m.get_source()) == Some(piece))
                .map(|m| m.get_source())
                .collect();
            if !rivals.is_empty() {
                let square = from.to_string();
                let same_file = rivals.iter().any(|s| s.get_file() == from.get_file());
                let same_rank = rivals.iter().any(|s| s.get_rank() == from.get_rank());
                if !same_file {
                    san.push_str(&square[..1]);
                } else if !same_rank {
                    san.push_str(&square[1..]);
                } else {
                    san.push_str(&square);
                }
            }
        }
        if captured {
            san.push('x');
        }
        san.push_str(&to.to_string());
        if let Some(promoted) = mv.get_promotion() {
            san.push('=');
            san.push(piece_letter(promoted).to_ascii_uppercase());
        }
        san
    };

    if after.checkers().popcnt() > 0 {
        let mated = MoveGen::new_legal(after).count() == 0;
        san.push(if mated { '#' } else { '+' });
    }
    san
}

impl RulesEngine for StandardChess {
    fn initial_position(&self) -> String {
        START_POSITION.to_string()
    }

    fn apply_move(&self, position: &str, request: &MoveRequest) -> Result<AppliedMove, RulesError> {
        let board = Self::board(position)?;
        let from = Self::square(&request.from)?;
        let to = Self::square(&request.to)?;
        let piece = board
            .piece_on(from)
            .ok_or_else(|| RulesError::EmptySquare(request.from.clone()))?;

        let last_rank = to.get_rank().to_index() == 0 || to.get_rank().to_index() == 7;
        let promotion = if piece == Piece::Pawn && last_rank {
            Some(request.promotion.and_then(promotion_piece).unwrap_or(Piece::Queen))
        } else {
            None
        };

        let mv = ChessMove::new(from, to, promotion);
        if !MoveGen::new_legal(&board).any(|m| m == mv) {
            return Err(RulesError::IllegalMove(format!("{}{}", request.from, request.to)));
        }

        let en_passant = piece == Piece::Pawn
            && from.get_file() != to.get_file()
            && board.piece_on(to).is_none();
        let captured = if en_passant { Some(Piece::Pawn) } else { board.piece_on(to) };

        let after = board.make_move_new(mv);
        Ok(AppliedMove {
            position_after: after.to_string(),
            piece: piece_letter(piece),
            captured: captured.map(piece_letter),
            promotion: promotion.map(piece_letter),
            notation: notation(&board, &after, mv, piece, captured.is_some()),
        })
    }

    fn outcome(&self, position: &str, history: &[&str]) -> Option<BoardOutcome> {
        let board = Self::board(position).ok()?;

        if MoveGen::new_legal(&board).count() == 0 {
            return Some(if board.checkers().popcnt() > 0 {
                BoardOutcome::Checkmate
            } else {
                BoardOutcome::Stalemate
            });
        }
        if is_insufficient_material(&board) {
            return Some(BoardOutcome::InsufficientMaterial);
        }

        let key = repetition_key(position);
        let seen = history.iter().filter(|p| repetition_key(p) == key).count();
        if seen >= 3 {
            return Some(BoardOutcome::ThreefoldRepetition);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play(engine: &StandardChess, moves: &[(&str, &str)]) -> Vec<String> {
        let mut positions = vec![engine.initial_position()];
        for (from, to) in moves {
            let request = MoveRequest::sanitize(from, to, None).unwrap();
            let current = positions.last().unwrap().clone();
            positions.push(engine.apply_move(&current, &request).unwrap().position_after);
        }
        positions
    }

    #[test]
    fn test_sanitize_move() {
        let request = MoveRequest::sanitize(" e7", "e8 ", Some("Queen")).unwrap();
        assert_eq!(request.from, "e7");
        assert_eq!(request.promotion, Some('q'));

        assert!(MoveRequest::sanitize("i2", "e4", None).is_err());
        assert!(MoveRequest::sanitize("e2", "e9", None).is_err());
        assert!(MoveRequest::sanitize("E2", "e4", None).is_err());
        assert!(MoveRequest::sanitize("e2", "e4", Some("king")).is_err());
        assert!(MoveRequest::sanitize("e2", "e2", None).is_err());
    }

    #[test]
    fn test_legal_and_illegal_moves() {
        let engine = StandardChess::new();
        let start = engine.initial_position();

        let applied = engine
            .apply_move(&start, &MoveRequest::sanitize("e2", "e4", None).unwrap())
            .unwrap();
        assert_eq!(applied.piece, 'p');
        assert_eq!(applied.notation, "e4");

        let illegal = engine.apply_move(&start, &MoveRequest::sanitize("e2", "e5", None).unwrap());
        assert!(matches!(illegal, Err(RulesError::IllegalMove(_))));

        let empty = engine.apply_move(&start, &MoveRequest::sanitize("e4", "e5", None).unwrap());
        assert!(matches!(empty, Err(RulesError::EmptySquare(_))));
    }

    #[test]
    fn test_fools_mate_is_checkmate() {
        let engine = StandardChess::new();
        let positions = play(&engine, &[("f2", "f3"), ("e7", "e5"), ("g2", "g4"), ("d8", "h4")]);
        let last = positions.last().unwrap();
        let history: Vec<&str> = positions.iter().map(String::as_str).collect();
        assert_eq!(engine.outcome(last, &history), Some(BoardOutcome::Checkmate));

        let before = &positions[positions.len() - 2];
        let mate = engine
            .apply_move(before, &MoveRequest::sanitize("d8", "h4", None).unwrap())
            .unwrap();
        assert_eq!(mate.notation, "Qh4#");
    }

    #[test]
    fn test_threefold_repetition() {
        let engine = StandardChess::new();
        let shuffle = [("g1", "f3"), ("g8", "f6"), ("f3", "g1"), ("f6", "g8")];
        let moves: Vec<(&str, &str)> = shuffle.iter().chain(shuffle.iter()).copied().collect();
        let positions = play(&engine, &moves);
        let history: Vec<&str> = positions.iter().map(String::as_str).collect();

        assert_eq!(engine.outcome(&positions[4], &history[..5]), None);
        assert_eq!(
            engine.outcome(positions.last().unwrap(), &history),
            Some(BoardOutcome::ThreefoldRepetition)
        );
    }

    #[test]
    fn test_promotion_and_capture() {
        let engine = StandardChess::new();
        let position = "1n2k3/P7/8/8/8/8/8/4K3 w - - 0 1";

        let promoted = engine
            .apply_move(position, &MoveRequest::sanitize("a7", "b8", Some("n")).unwrap())
            .unwrap();
        assert_eq!(promoted.captured, Some('n'));
        assert_eq!(promoted.promotion, Some('n'));
        assert_eq!(promoted.notation, "axb8=N");

        let default_queen = engine
            .apply_move(position, &MoveRequest::sanitize("a7", "a8", None).unwrap())
            .unwrap();
        assert_eq!(default_queen.promotion, Some('q'));
        assert_eq!(default_queen.notation, "a8=Q");
    }

    #[test]
    fn test_en_passant_capture_detected() {
        let engine = StandardChess::new();
        let position = "4k3/8/8/3pP3/8/8/8/4K3 w - d6 0 1";
        let applied = engine
            .apply_move(position, &MoveRequest::sanitize("e5", "d6", None).unwrap())
            .unwrap();
        assert_eq!(applied.captured, Some('p'));
        assert_eq!(applied.notation, "exd6");
    }

    #[test]
    fn test_insufficient_material() {
        let engine = StandardChess::new();
        let kings = "4k3/8/8/8/8/8/8/4K3 w - - 0 1";
        assert_eq!(engine.outcome(kings, &[kings]), Some(BoardOutcome::InsufficientMaterial));

        let knight = "4k3/8/8/8/8/8/8/3NK3 w - - 0 1";
        assert_eq!(engine.outcome(knight, &[knight]), Some(BoardOutcome::InsufficientMaterial));

        let rook = "4k3/8/8/8/8/8/8/3RK3 w - - 0 1";
        assert_eq!(engine.outcome(rook, &[rook]), None);
    }

    #[test]
    fn test_stalemate() {
        let engine = StandardChess::new();
        let position = "7k/5Q2/6K1/8/8/8/8/8 b - - 0 1";
        assert_eq!(engine.outcome(position, &[position]), Some(BoardOutcome::Stalemate));
    }
}
