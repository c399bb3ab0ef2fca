//! Chess Match Engine
//!
//! Authoritative turn-based match logic: move application, clock accounting,
//! draw offers, resignation and lazy timeout resolution. Every operation
//! settles clock decay before it looks at the request, so a move can never be
//! accepted against a clock that already ran out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::{debug, info};

use crate::core::clock::{ClockConfig, ClockSettle, ClockState};
use crate::core::identity::Color;
use crate::error::GameError;
use crate::game::draw::{apply_draw_action, DrawAction, DrawOffer, DrawTransition};
use crate::game::rules::{BoardOutcome, MoveRequest, RulesEngine, StandardChess};
use crate::game::session::{FinishCause, GameSession, SessionStatus};

/// One entry of the move history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRecord {
    /// Mover's side.
    pub color: Color,
    /// Origin square.
    pub from: String,
    /// Target square.
    pub to: String,
    /// Moved piece letter.
    pub piece: char,
    /// Captured piece letter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured: Option<char>,
    /// Promotion piece letter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion: Option<char>,
    /// Algebraic notation.
    pub notation: String,
    /// Position after the move.
    pub position_after: String,
    /// Mover's canonical name.
    pub player: String,
    /// When the move was accepted.
    pub timestamp: DateTime<Utc>,
    /// Thinking time since the previous move (or clock start).
    pub spent_ms: u64,
    /// Mover's remaining time after the increment.
    pub remaining_ms: u64,
}

/// Chess sub-state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChessSubState {
    /// Position the game started from.
    pub initial_position: String,
    /// Current position.
    pub position: String,
    /// Moves in order.
    pub move_history: Vec<MoveRecord>,
    /// Match clock.
    pub clock: ClockState,
    /// Latest draw offer record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draw_offer: Option<DrawOffer>,
}

impl ChessSubState {
    /// Fresh game with a frozen clock.
    pub fn new(initial_position: &str, clock: &ClockConfig) -> Self {
        Self {
            initial_position: initial_position.to_string(),
            position: initial_position.to_string(),
            move_history: Vec::new(),
            clock: ClockState::new(&clock.normalized()),
            draw_offer: None,
        }
    }

    /// Side to move. White moves when the history length is even.
    pub fn to_move(&self) -> Color {
        Color::to_move_after(self.move_history.len())
    }

    /// Every position of the game, initial position first.
    pub fn positions(&self) -> Vec<&str> {
        std::iter::once(self.initial_position.as_str())
            .chain(self.move_history.iter().map(|m| m.position_after.as_str()))
            .collect()
    }

    fn last_move_at(&self) -> Option<DateTime<Utc>> {
        self.move_history
            .last()
            .map(|m| m.timestamp)
            .or(self.clock.active_at)
    }
}

/// Result of an accepted move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOutcome {
    /// The appended history entry.
    pub record: MoveRecord,
    /// Set when the move ended the game.
    pub finished: Option<FinishCause>,
}

/// Turn-based match engine.
#[derive(Clone)]
pub struct ChessMatchEngine {
    rules: Arc<dyn RulesEngine>,
}

impl Default for ChessMatchEngine {
    fn default() -> Self {
        Self::new(Arc::new(StandardChess::new()))
    }
}

impl ChessMatchEngine {
    /// Create an engine over a rules implementation.
    pub fn new(rules: Arc<dyn RulesEngine>) -> Self {
        Self { rules }
    }

    /// Sub-state for a new match.
    pub fn new_match(&self, clock: &ClockConfig) -> ChessSubState {
        ChessSubState::new(&self.rules.initial_position(), clock)
    }

    /// Settle clock decay for the side to move and finish the session on a flag.
    ///
    /// Returns the settle when the side to move ran out of time during this
    /// call. Sessions that are not active or not chess are left alone.
    pub fn resolve_timeout(
        &self,
        session: &mut GameSession,
        now: DateTime<Utc>,
    ) -> Result<Option<ClockSettle>, GameError> {
        if session.status != SessionStatus::Active {
            return Ok(None);
        }
        let settle = match session.chess_mut() {
            Ok(chess) if chess.clock.is_running() => {
                let to_move = chess.to_move();
                chess.clock.settle(to_move, now)
            }
            _ => return Ok(None),
        };
        if !settle.flagged() {
            return Ok(None);
        }

        let winner = session
            .participant_at(settle.color.opposite().seat())
            .map(str::to_string);
        info!(
            session = %session.id,
            flagged = %settle.color,
            winner = ?winner,
            "Clock expired"
        );
        session.finish(winner, FinishCause::Timeout, now)?;
        Ok(Some(settle))
    }

    /// Apply a move for `actor`.
    pub fn apply_move(
        &self,
        session: &mut GameSession,
        actor: &str,
        request: &MoveRequest,
        now: DateTime<Utc>,
    ) -> Result<MoveOutcome, GameError> {
        session.chess_mut()?;
        if self.resolve_timeout(session, now)?.is_some() {
            return Err(GameError::ClockExpired);
        }
        let seat = session.require_seat(actor)?;
        session.require_active()?;
        let player = session.participant_at(seat).unwrap_or(actor).to_string();
        let color = seat.color();

        let chess = session.chess_mut()?;
        if chess.to_move() != color {
            return Err(GameError::StateConflict(format!("it is {}'s turn", chess.to_move())));
        }

        let applied = self.rules.apply_move(&chess.position, request)?;

        let spent_ms = chess
            .last_move_at()
            .map(|at| (now - at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let remaining_ms = chess.clock.credit_increment(color);

        let record = MoveRecord {
            color,
            from: request.from.clone(),
            to: request.to.clone(),
            piece: applied.piece,
            captured: applied.captured,
            promotion: applied.promotion,
            notation: applied.notation,
            position_after: applied.position_after.clone(),
            player: player.clone(),
            timestamp: now,
            spent_ms,
            remaining_ms,
        };
        chess.position = applied.position_after;
        chess.move_history.push(record.clone());

        let outcome = self.rules.outcome(&chess.position, &chess.positions());
        session.touch();
        debug!(session = %session.id, player = %player, notation = %record.notation, "Move applied");

        let finished = match outcome {
            None => None,
            Some(result) => {
                let (winner, cause) = match result {
                    BoardOutcome::Checkmate => (Some(player), FinishCause::Checkmate),
                    BoardOutcome::Stalemate => (None, FinishCause::Stalemate),
                    BoardOutcome::InsufficientMaterial => (None, FinishCause::InsufficientMaterial),
                    BoardOutcome::ThreefoldRepetition => (None, FinishCause::ThreefoldRepetition),
                };
                info!(session = %session.id, cause = ?cause, winner = ?winner, "Game over on the board");
                session.finish(winner, cause, now)?;
                Some(cause)
            }
        };

        Ok(MoveOutcome { record, finished })
    }

    /// Apply a draw sub-protocol action for `actor`.
    pub fn draw_action(
        &self,
        session: &mut GameSession,
        actor: &str,
        action: DrawAction,
        now: DateTime<Utc>,
    ) -> Result<DrawTransition, GameError> {
        session.chess_mut()?;
        if self.resolve_timeout(session, now)?.is_some() {
            return Err(GameError::ClockExpired);
        }
        let seat = session.require_seat(actor)?;
        session.require_active()?;
        let player = session.participant_at(seat).unwrap_or(actor).to_string();

        let chess = session.chess_mut()?;
        let transition = apply_draw_action(chess.draw_offer.as_ref(), action, &player, now)?;
        chess.draw_offer = transition.retained();

        info!(session = %session.id, player = %player, action = %action, "Draw action");
        if transition.agreed {
            session.finish(None, FinishCause::DrawAgreement, now)?;
        } else {
            session.touch();
        }
        Ok(transition)
    }

    /// Resign for `actor` after settling the clock.
    pub fn resign(
        &self,
        session: &mut GameSession,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<(), GameError> {
        session.chess_mut()?;
        if self.resolve_timeout(session, now)?.is_some() {
            return Err(GameError::ClockExpired);
        }
        session.resign(actor, now)?;
        info!(session = %session.id, player = %actor, "Resigned");
        Ok(())
    }
}
