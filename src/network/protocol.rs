//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket, plus the
//! snapshot and push-event contract shared by the server and the client
//! agent. All messages are JSON.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::hash::StateHasher;
use crate::error::GameError;
use crate::game::chess::ChessSubState;
use crate::game::draw::DrawAction;
use crate::game::scoreboard::LiveState;
use crate::game::session::{FinishCause, GameSession, GameState, GameType, SessionId, SessionStatus};

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Game-specific part of a snapshot. Exactly one field is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateView {
    /// Chess sub-state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chess: Option<ChessSubState>,
    /// Score sub-state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveState>,
}

impl From<&GameState> for GameStateView {
    fn from(state: &GameState) -> Self {
        match state {
            GameState::Chess(chess) => Self { chess: Some(chess.clone()), live: None },
            GameState::Live(live) => Self { chess: None, live: Some(live.clone()) },
        }
    }
}

/// Full authoritative read of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Session id.
    pub id: SessionId,
    /// Mutation counter.
    pub revision: u64,
    /// Status.
    pub status: SessionStatus,
    /// Winner, if decided.
    pub winner: Option<String>,
    /// Host.
    pub host_identity: String,
    /// Guest, once joined.
    pub guest_identity: Option<String>,
    /// Game type.
    pub game_type: GameType,
    /// Points at stake.
    pub stake: u64,
    /// Table label.
    pub table: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Finish time.
    pub finished_at: Option<DateTime<Utc>>,
    /// Finish cause.
    pub finished_by: Option<FinishCause>,
    /// Sub-state.
    pub game_state: GameStateView,
    /// Server clock when captured.
    pub server_time: DateTime<Utc>,
    /// Hex SHA-256 over everything above except `server_time`.
    pub state_hash: String,
}

impl SessionSnapshot {
    /// Capture a session. The caller settles clock decay first.
    pub fn capture(session: &GameSession, now: DateTime<Utc>) -> Result<Self, GameError> {
        let mut snapshot = Self {
            id: session.id,
            revision: session.revision,
            status: session.status,
            winner: session.winner.clone(),
            host_identity: session.host_name.clone(),
            guest_identity: session.guest_name.clone(),
            game_type: session.game_type,
            stake: session.stake,
            table: session.table.clone(),
            created_at: session.created_at,
            finished_at: session.finished_at,
            finished_by: session.finished_by,
            game_state: GameStateView::from(&session.state),
            server_time: now,
            state_hash: String::new(),
        };
        snapshot.state_hash = snapshot.compute_hash()?;
        Ok(snapshot)
    }

    /// Fingerprint of the semantic content.
    pub fn compute_hash(&self) -> Result<String, GameError> {
        let content = (
            &self.id,
            self.revision,
            &self.status,
            &self.winner,
            &self.host_identity,
            &self.guest_identity,
            &self.game_type,
            self.stake,
            &self.table,
            &self.finished_at,
            &self.finished_by,
            &self.game_state,
        );
        let mut hasher = StateHasher::for_snapshot();
        hasher
            .update_json(&content)
            .map_err(|e| GameError::Internal(format!("snapshot encoding failed: {e}")))?;
        Ok(hasher.finalize_hex())
    }

    /// Whether the session is finished.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seated participants, host first.
    pub fn participants(&self) -> Vec<&str> {
        std::iter::once(self.host_identity.as_str())
            .chain(self.guest_identity.as_deref())
            .collect()
    }
}

// =============================================================================
// PUSH EVENTS
// =============================================================================

/// Score-game push payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveUpdate {
    /// Session after the submission.
    pub snapshot: SessionSnapshot,
    /// Participants that have not reported `done`.
    pub waiting_for: Vec<String>,
}

/// Draw-offer push payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawUpdate {
    /// Session after the action.
    pub snapshot: SessionSnapshot,
    /// Action taken.
    pub action: DrawAction,
    /// Acting participant.
    pub actor: String,
}

/// Finish push payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedUpdate {
    /// Final session.
    pub snapshot: SessionSnapshot,
    /// Points moved, once settlement has been applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transferred_points: Option<u64>,
}

/// Settlement outcome surfaced after a delayed retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementNotice {
    /// Winner the settlement used.
    pub winner: Option<String>,
    /// Points moved.
    pub transferred_points: u64,
}

/// Push event body, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushPayload {
    /// Guest joined.
    GameJoined(SessionSnapshot),
    /// Board, clock or move history changed.
    GameState(SessionSnapshot),
    /// Draw offer changed.
    DrawOfferUpdated(DrawUpdate),
    /// Live progress submitted.
    LiveSubmission(LiveUpdate),
    /// Final score submitted.
    ScoreSubmission(LiveUpdate),
    /// Session finished.
    GameFinished(FinishedUpdate),
    /// Settlement applied after the finish event went out.
    SettlementApplied(SettlementNotice),
}

/// Low-latency notification for a session. Delivery is best effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    /// Session the event belongs to.
    pub session_id: SessionId,
    /// Server time of emission.
    pub emitted_at: DateTime<Utc>,
    /// Typed body.
    #[serde(flatten)]
    pub body: PushPayload,
}

impl PushEvent {
    /// Build an event.
    pub fn new(session_id: SessionId, emitted_at: DateTime<Utc>, body: PushPayload) -> Self {
        Self { session_id, emitted_at, body }
    }

    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match &self.body {
            PushPayload::GameJoined(_) => "game_joined",
            PushPayload::GameState(_) => "game_state",
            PushPayload::DrawOfferUpdated(_) => "draw_offer_updated",
            PushPayload::LiveSubmission(_) => "live_submission",
            PushPayload::ScoreSubmission(_) => "score_submission",
            PushPayload::GameFinished(_) => "game_finished",
            PushPayload::SettlementApplied(_) => "settlement_applied",
        }
    }

    /// Snapshot carried by the event, if any.
    pub fn snapshot(&self) -> Option<&SessionSnapshot> {
        match &self.body {
            PushPayload::GameJoined(snapshot) | PushPayload::GameState(snapshot) => Some(snapshot),
            PushPayload::DrawOfferUpdated(update) => Some(&update.snapshot),
            PushPayload::LiveSubmission(update) | PushPayload::ScoreSubmission(update) => Some(&update.snapshot),
            PushPayload::GameFinished(update) => Some(&update.snapshot),
            PushPayload::SettlementApplied(_) => None,
        }
    }

    /// Settlement amount carried by the event, if any.
    pub fn transferred_points(&self) -> Option<u64> {
        match &self.body {
            PushPayload::GameFinished(update) => update.transferred_points,
            PushPayload::SettlementApplied(notice) => Some(notice.transferred_points),
            _ => None,
        }
    }
}

// =============================================================================
// ACTIONS
// =============================================================================

/// Requested time control, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockRequest {
    /// Base time per side.
    pub base_seconds: Option<u64>,
    /// Increment per move.
    pub increment_seconds: Option<u64>,
}

/// Session creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Creator.
    pub host: String,
    /// Game type.
    pub game_type: GameType,
    /// Points at stake.
    #[serde(default)]
    pub stake: u64,
    /// Table label.
    #[serde(default)]
    pub table: String,
    /// Chess time control.
    #[serde(default)]
    pub clock: Option<ClockRequest>,
}

/// A participant action against an existing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SessionAction {
    /// Take the guest seat.
    Join,
    /// Chess move.
    Move {
        /// Origin square.
        from: String,
        /// Target square.
        to: String,
        /// Promotion piece.
        #[serde(default)]
        promotion: Option<String>,
    },
    /// Draw sub-protocol.
    Draw {
        /// Draw action.
        draw: DrawAction,
    },
    /// Give up.
    Resign,
    /// Final score.
    Score {
        /// Score.
        score: u64,
        /// Rounds won.
        #[serde(default)]
        rounds_won: Option<u32>,
        /// Time taken.
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    /// Live progress.
    Live {
        /// Game mode tag.
        #[serde(default)]
        mode: Option<String>,
        /// Score so far.
        score: u64,
        /// Rounds won so far.
        #[serde(default)]
        rounds_won: Option<u32>,
        /// Time so far.
        #[serde(default)]
        duration_ms: Option<u64>,
        /// Participant finished.
        #[serde(default)]
        done: bool,
    },
    /// Finish a score-based session.
    Finish {
        /// Requested winner.
        #[serde(default)]
        winner: Option<String>,
    },
    /// Withdraw a session nobody has joined.
    Cancel,
    /// Delete a session that is not in progress.
    Remove,
}

impl SessionAction {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SessionAction::Join => "join",
            SessionAction::Move { .. } => "move",
            SessionAction::Draw { .. } => "draw",
            SessionAction::Resign => "resign",
            SessionAction::Score { .. } => "score",
            SessionAction::Live { .. } => "live",
            SessionAction::Finish { .. } => "finish",
            SessionAction::Cancel => "cancel",
            SessionAction::Remove => "remove",
        }
    }
}

/// Acknowledgement of an accepted action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionAck {
    /// Session after the action.
    pub snapshot: SessionSnapshot,
    /// Finish request hit an already finished session with the same winner.
    #[serde(default)]
    pub already_finished: bool,
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Receive push events for a session.
    Subscribe {
        /// Session id.
        session_id: SessionId,
    },

    /// Request a snapshot.
    Snapshot {
        /// Session id.
        session_id: SessionId,
    },

    /// Create a session.
    Create(CreateRequest),

    /// Act on a session.
    Act {
        /// Session id.
        session_id: SessionId,
        /// Acting participant.
        identity: String,
        /// The action.
        action: SessionAction,
    },

    /// Waiting sessions, optionally at one table.
    ListOpen {
        /// Table label.
        #[serde(default)]
        table: Option<String>,
    },

    /// The waiting or active session of a participant.
    ActiveSession {
        /// Participant.
        identity: String,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp.
        timestamp: u64,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Snapshot reply.
    Snapshot {
        /// The snapshot.
        snapshot: SessionSnapshot,
    },

    /// Subscription confirmed.
    Subscribed {
        /// Session id.
        session_id: SessionId,
    },

    /// Push event for a subscribed session.
    Push {
        /// The event.
        event: PushEvent,
    },

    /// Session listing.
    Sessions {
        /// Matching sessions.
        sessions: Vec<SessionSnapshot>,
    },

    /// Action accepted.
    Ack(ActionAck),

    /// Request rejected.
    Error(ServerError),

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time.
        server_time: DateTime<Utc>,
    },
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Explicit back-off hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ServerError {
    /// Build with an explicit code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), retry_after_ms: None }
    }

    /// Back-off hint from the explicit field or the message text.
    pub fn retry_hint_ms(&self) -> Option<u64> {
        self.retry_after_ms
            .filter(|ms| *ms > 0)
            .or_else(|| parse_retry_after_ms(&self.message))
    }

    /// Convert back into a typed error on the client side.
    pub fn into_game_error(self) -> GameError {
        match self.code {
            ErrorCode::InvalidInput => GameError::Validation(self.message),
            ErrorCode::StateConflict => GameError::StateConflict(self.message),
            ErrorCode::ClockExpired => GameError::ClockExpired,
            ErrorCode::NotParticipant => GameError::NotParticipant(self.message),
            ErrorCode::RateLimited => GameError::RateLimited {
                retry_after_ms: self.retry_hint_ms().unwrap_or(0),
            },
            ErrorCode::SettlementFailed => GameError::Settlement(self.message),
            ErrorCode::InvalidStatusTransition => GameError::StateConflict(self.message),
            ErrorCode::SessionNotFound | ErrorCode::ServerOverloaded | ErrorCode::InternalError => {
                GameError::Transport(self.message)
            }
        }
    }
}

impl From<&GameError> for ServerError {
    fn from(err: &GameError) -> Self {
        let retry_after_ms = match err {
            GameError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        Self { code: err.code(), message: err.to_string(), retry_after_ms }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid input.
    InvalidInput,
    /// Request conflicts with the current state.
    StateConflict,
    /// Status machine refused the transition.
    InvalidStatusTransition,
    /// Clock ran out first.
    ClockExpired,
    /// Session not found.
    SessionNotFound,
    /// Actor is not seated.
    NotParticipant,
    /// Rate limited.
    RateLimited,
    /// Settlement could not be applied.
    SettlementFailed,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

/// Extract a retry delay from a human message such as "try again in 12 sn"
/// or "retry after 5s". Non-positive values are ignored.
pub fn parse_retry_after_ms(message: &str) -> Option<u64> {
    let lower = message.to_lowercase();
    let bytes = lower.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let digits = &lower[start..i];
        let mut j = i;
        while j < bytes.len() && bytes[j] == b' ' {
            j += 1;
        }
        let unit_sn = lower[j..].starts_with("sn");
        let unit_s = bytes.get(j) == Some(&b's')
            && j == i
            && !bytes.get(j + 1).is_some_and(|b| b.is_ascii_alphabetic());
        if unit_sn || unit_s {
            if let Ok(seconds) = digits.parse::<u64>() {
                if seconds > 0 {
                    return Some(seconds.saturating_mul(1000));
                }
            }
        }
    }
    None
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ClockConfig;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn chess_session() -> GameSession {
        let state = GameState::Chess(ChessSubState::new("startpos", &ClockConfig::default()));
        let mut session = GameSession::new("Alice", GameType::RetroChess, 10, "T1", state, t0()).unwrap();
        session.join("Bob", t0()).unwrap();
        session
    }

    #[test]
    fn test_snapshot_hash_ignores_server_time() {
        let session = chess_session();
        let a = SessionSnapshot::capture(&session, t0()).unwrap();
        let b = SessionSnapshot::capture(&session, t0() + chrono::Duration::seconds(30)).unwrap();
        assert_eq!(a.state_hash, b.state_hash);
        assert_eq!(a.state_hash.len(), 64);

        let mut changed = session.clone();
        changed.touch();
        let c = SessionSnapshot::capture(&changed, t0()).unwrap();
        assert_ne!(a.state_hash, c.state_hash);
    }

    #[test]
    fn test_snapshot_shape() {
        let snapshot = SessionSnapshot::capture(&chess_session(), t0()).unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["hostIdentity"], "Alice");
        assert_eq!(json["guestIdentity"], "Bob");
        assert!(json["gameState"]["chess"]["clock"]["whiteRemainingMs"].is_u64());
        assert!(json["gameState"].get("live").is_none());
    }

    #[test]
    fn test_push_envelope_shape() {
        let snapshot = SessionSnapshot::capture(&chess_session(), t0()).unwrap();
        let event = PushEvent::new(snapshot.id, t0(), PushPayload::GameJoined(snapshot.clone()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "game_joined");
        assert_eq!(json["sessionId"], snapshot.id.to_string());
        assert_eq!(json["payload"]["revision"], snapshot.revision);

        let parsed: PushEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind(), "game_joined");
        assert_eq!(parsed.snapshot(), Some(&snapshot));
    }

    #[test]
    fn test_server_push_message_keeps_both_tags() {
        let event = PushEvent::new(
            uuid::Uuid::nil(),
            t0(),
            PushPayload::SettlementApplied(SettlementNotice { winner: None, transferred_points: 0 }),
        );
        let json = ServerMessage::Push { event }.to_json().unwrap();
        let parsed = ServerMessage::from_json(&json).unwrap();
        match parsed {
            ServerMessage::Push { event } => assert_eq!(event.kind(), "settlement_applied"),
            other => panic!("Wrong message type: {other:?}"),
        }
    }

    #[test]
    fn test_client_action_parsing() {
        let raw = r#"{"type":"act","session_id":"00000000-0000-0000-0000-000000000000","identity":"alice","action":{"action":"move","from":"e2","to":"e4"}}"#;
        match ClientMessage::from_json(raw).unwrap() {
            ClientMessage::Act { identity, action: SessionAction::Move { from, to, promotion }, .. } => {
                assert_eq!(identity, "alice");
                assert_eq!((from.as_str(), to.as_str()), ("e2", "e4"));
                assert_eq!(promotion, None);
            }
            other => panic!("Wrong message type: {other:?}"),
        }

        let draw = r#"{"type":"act","session_id":"00000000-0000-0000-0000-000000000000","identity":"bob","action":{"action":"draw","draw":"offer"}}"#;
        assert!(ClientMessage::from_json(draw).is_ok());
    }

    #[test]
    fn test_error_codes() {
        let error = ServerError::from(&GameError::RateLimited { retry_after_ms: 3_000 });
        let json = ServerMessage::Error(error.clone()).to_json().unwrap();
        assert!(json.contains("rate_limited"));
        assert_eq!(error.retry_hint_ms(), Some(3_000));
        assert_eq!(error.into_game_error(), GameError::RateLimited { retry_after_ms: 3_000 });
    }

    #[test]
    fn test_retry_hint_parsing() {
        assert_eq!(parse_retry_after_ms("Çok fazla istek. 12 sn sonra tekrar deneyin."), Some(12_000));
        assert_eq!(parse_retry_after_ms("retry after 5s"), Some(5_000));
        assert_eq!(parse_retry_after_ms("wait 7 SN"), Some(7_000));
        assert_eq!(parse_retry_after_ms("0 sn"), None);
        assert_eq!(parse_retry_after_ms("5 seconds"), None);
        assert_eq!(parse_retry_after_ms("no hint"), None);

        let from_message = ServerError::new(ErrorCode::RateLimited, "slow down, 4 sn");
        assert_eq!(from_message.retry_hint_ms(), Some(4_000));
    }
}
