//! # Cafe Duel Session Server
//!
//! Authoritative session engine for two-player cafe mini-games, with the
//! client-side agent that keeps each player's view in step with it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CAFE DUEL SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Pure primitives                           │
//! │  ├── clock.rs    - Two-sided chess clock accounting          │
//! │  ├── hash.rs     - Snapshot fingerprints                     │
//! │  └── identity.rs - Participant keys and seats                │
//! │                                                              │
//! │  game/           - Session engines (synchronous)             │
//! │  ├── session.rs  - Session record and status machine         │
//! │  ├── scoreboard.rs - Winner resolution for skill games       │
//! │  ├── draw.rs     - Draw offer sub-protocol                   │
//! │  ├── rules.rs    - Rules engine seam, standard chess         │
//! │  └── chess.rs    - Turn-based match with clocks              │
//! │                                                              │
//! │  settlement/     - Point transfer and statistics             │
//! │                                                              │
//! │  network/        - Locking, push delivery, transport         │
//! │  ├── protocol.rs - Snapshots, push events, wire messages     │
//! │  ├── notifier.rs - Per-session push channels                 │
//! │  ├── session.rs  - Session manager                           │
//! │  └── server.rs   - WebSocket server                          │
//! │                                                              │
//! │  client/         - Client reconciliation                     │
//! │  ├── reconcile.rs - Apply/skip decisions, pending actions    │
//! │  ├── agent.rs    - Push plus poll sync agent                 │
//! │  └── scoreboard.rs - Submit a score and wait for a winner    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Time
//!
//! `core/` and `game/` never read the wall clock. Every operation takes
//! `now`, so clock expiry is settled lazily and is reproducible in tests.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod settlement;
pub mod network;
pub mod client;
pub mod error;

// Re-export commonly used types
pub use error::GameError;
pub use game::session::{GameSession, GameType, SessionId, SessionStatus};
pub use network::protocol::{PushEvent, SessionAction, SessionSnapshot};
pub use network::session::SessionManager;
pub use client::agent::ClientSyncAgent;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
