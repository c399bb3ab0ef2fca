//! Game Logic Module
//!
//! Authoritative per-session engines. Everything here is synchronous and
//! takes the current time as an argument; locking lives in the network layer.
//!
//! ## Module Structure
//!
//! - `session`: Session record, status machine, game types
//! - `scoreboard`: Winner resolution for score-based games
//! - `draw`: Draw offer sub-protocol
//! - `rules`: Rules engine seam and standard chess
//! - `chess`: Turn-based match engine with clock accounting

pub mod session;
pub mod scoreboard;
pub mod draw;
pub mod rules;
pub mod chess;

// Re-export key types
pub use session::{FinishCause, GameSession, GameState, GameType, SessionId, SessionStatus};
pub use scoreboard::{pick_winner, LiveState, ScoreSubmission, Scoreboard};
pub use draw::{DrawAction, DrawOffer, DrawOfferStatus};
pub use rules::{MoveRequest, RulesEngine, StandardChess};
pub use chess::{ChessMatchEngine, ChessSubState, MoveRecord};
