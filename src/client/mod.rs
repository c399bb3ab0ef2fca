//! Client Layer
//!
//! Keeps a player's view of a session in step with the server: snapshot
//! reconciliation, the background sync agent and the score-wait helper.

pub mod reconcile;
pub mod api;
pub mod agent;
pub mod scoreboard;

pub use reconcile::{reconcile, AppliedMarker, Decision, PendingAction, PendingActions, Source};
pub use api::{LocalApi, SessionApi};
pub use agent::{AgentEvent, ClientSyncAgent, PollOutcome, SyncConfig};
pub use scoreboard::{submit_score_and_wait_for_winner, ScoreWaitConfig, ScoreWaitResult};
