//! Settlement
//!
//! Point transfer and statistics for finished sessions.
//!
//! - `store`: account store interface and in-memory implementation
//! - `engine`: settlement policy and exactly-once guard

pub mod store;
pub mod engine;

pub use store::{MemoryUserStore, SettlementPlan, StatDelta, UserRecord, UserStore};
pub use engine::{plan_settlement, SettlementEngine, SettlementRequest, SettlementResult};
