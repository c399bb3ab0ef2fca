//! Participant Identity
//!
//! Participants are identified by display name. Names are compared trimmed and
//! case-insensitively; the spelling stored on the session is canonical.

use std::fmt;
use serde::{Serialize, Deserialize};

/// Normalize a participant name into its comparison key.
pub fn participant_key(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Check whether two names refer to the same participant.
pub fn same_participant(a: &str, b: &str) -> bool {
    participant_key(a) == participant_key(b)
}

/// Seat at the table. The creator is always the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Seat {
    /// Session creator.
    Host,
    /// Participant who joined.
    Guest,
}

impl Seat {
    /// The other seat.
    pub fn opponent(self) -> Self {
        match self {
            Seat::Host => Seat::Guest,
            Seat::Guest => Seat::Host,
        }
    }

    /// Piece color played from this seat. Fixed for the life of a session.
    pub fn color(self) -> Color {
        match self {
            Seat::Host => Color::White,
            Seat::Guest => Color::Black,
        }
    }
}

/// Side of a turn-based board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    /// Moves first.
    White,
    /// Moves second.
    Black,
}

impl Color {
    /// The other side.
    pub fn opposite(self) -> Self {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    /// Seat that plays this color.
    pub fn seat(self) -> Seat {
        match self {
            Color::White => Seat::Host,
            Color::Black => Seat::Guest,
        }
    }

    /// Side to move after `plies` half-moves from the initial position.
    pub fn to_move_after(plies: usize) -> Self {
        if plies % 2 == 0 { Color::White } else { Color::Black }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::White => f.write_str("white"),
            Color::Black => f.write_str("black"),
        }
    }
}
