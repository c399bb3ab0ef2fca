//! Core primitives.
//!
//! Pure building blocks shared by the server engines and the client agent.

pub mod clock;
pub mod hash;
pub mod identity;

// Re-export core types
pub use clock::{ClockConfig, ClockSettle, ClockState};
pub use hash::StateHasher;
pub use identity::{participant_key, same_participant, Color, Seat};
