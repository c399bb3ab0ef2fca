//! Network Layer
//!
//! Wire contract, push delivery, per-session serialization and the WebSocket
//! front end. Game rules live in `game/`; this layer adds locking, time and
//! transport.

pub mod protocol;
pub mod notifier;
pub mod session;
pub mod server;

pub use protocol::{
    ActionAck, ClientMessage, CreateRequest, ErrorCode, PushEvent, PushPayload, ServerError,
    ServerMessage, SessionAction, SessionSnapshot,
};
pub use notifier::{LocalConnector, Notifier, PushConnector, SessionChannels};
pub use session::{Applied, ScoreReport, SessionManager, SettlementRetry};
pub use server::{GameServer, ServerConfig, GameServerError};
