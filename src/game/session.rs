//! Game Sessions
//!
//! One two-participant match with its authoritative state. Status moves
//! monotonically from waiting to active to finished, and the game-specific
//! sub-state is a tagged variant chosen once from the game type.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::core::identity::{participant_key, same_participant, Seat};
use crate::error::GameError;
use crate::game::chess::ChessSubState;
use crate::game::scoreboard::LiveState;

/// Unique session identifier.
pub type SessionId = Uuid;

/// Longest accepted participant name or table label, in characters.
pub const MAX_NAME_LEN: usize = 48;

/// Highest stake a session may carry.
pub const MAX_STAKE: u64 = 5_000;

// =============================================================================
// STATUS
// =============================================================================

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, waiting for a guest.
    Waiting,
    /// Both seats taken, game in progress.
    Active,
    /// Terminal.
    Finished,
}

impl SessionStatus {
    /// Whether the status machine allows moving to `next`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Waiting, Active) | (Waiting, Finished) | (Active, Active) | (Active, Finished) | (Finished, Finished)
        )
    }

    /// Whether no further change is possible.
    pub fn is_terminal(self) -> bool {
        self == SessionStatus::Finished
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::Finished => "finished",
        };
        f.write_str(name)
    }
}

// =============================================================================
// GAME TYPES
// =============================================================================

/// Mini-games offered at the café.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameType {
    /// Turn-based chess with a Fischer clock.
    RetroChess,
    /// Tap as fast as possible.
    ReflexRush,
    /// Copy the rhythm pattern.
    RhythmCopy,
    /// Top-down arena shooter.
    ArenaBattle,
    /// Tank duel.
    TankBattle,
    /// Card memory.
    MemoryDuel,
    /// Odd or even guessing sprint.
    OddEvenSprint,
    /// Trivia quiz.
    KnowledgeQuiz,
    /// Rock, paper, scissors rounds.
    RockPaperScissors,
    /// Cooperative dungeon run.
    DungeonClash,
    /// Table game played for fun.
    UnoSocial,
    /// Table game played for fun.
    OkeySocial,
    /// Table game played for fun.
    MonopolySocial,
}

impl GameType {
    /// All supported game types.
    pub const ALL: [GameType; 13] = [
        GameType::RetroChess,
        GameType::ReflexRush,
        GameType::RhythmCopy,
        GameType::ArenaBattle,
        GameType::TankBattle,
        GameType::MemoryDuel,
        GameType::OddEvenSprint,
        GameType::KnowledgeQuiz,
        GameType::RockPaperScissors,
        GameType::DungeonClash,
        GameType::UnoSocial,
        GameType::OkeySocial,
        GameType::MonopolySocial,
    ];

    /// Wire tag, also accepted as a live `mode`.
    pub fn as_str(self) -> &'static str {
        match self {
            GameType::RetroChess => "retro_chess",
            GameType::ReflexRush => "reflex_rush",
            GameType::RhythmCopy => "rhythm_copy",
            GameType::ArenaBattle => "arena_battle",
            GameType::TankBattle => "tank_battle",
            GameType::MemoryDuel => "memory_duel",
            GameType::OddEvenSprint => "odd_even_sprint",
            GameType::KnowledgeQuiz => "knowledge_quiz",
            GameType::RockPaperScissors => "rock_paper_scissors",
            GameType::DungeonClash => "dungeon_clash",
            GameType::UnoSocial => "uno_social",
            GameType::OkeySocial => "okey_social",
            GameType::MonopolySocial => "monopoly_social",
        }
    }

    /// Display name.
    pub fn label(self) -> &'static str {
        match self {
            GameType::RetroChess => "Retro Chess",
            GameType::ReflexRush => "Reflex Rush",
            GameType::RhythmCopy => "Rhythm Copy",
            GameType::ArenaBattle => "Arena Battle",
            GameType::TankBattle => "Tank Battle",
            GameType::MemoryDuel => "Memory Duel",
            GameType::OddEvenSprint => "Odd Even Sprint",
            GameType::KnowledgeQuiz => "Knowledge Quiz",
            GameType::RockPaperScissors => "Rock Paper Scissors",
            GameType::DungeonClash => "Dungeon Clash",
            GameType::UnoSocial => "UNO Social",
            GameType::OkeySocial => "101 Okey Social",
            GameType::MonopolySocial => "Monopoly Social",
        }
    }

    /// Played on the chess engine.
    pub fn is_chess(self) -> bool {
        self == GameType::RetroChess
    }

    /// Social table games: play counts only, no points or wins.
    pub fn is_non_competitive(self) -> bool {
        matches!(self, GameType::UnoSocial | GameType::OkeySocial | GameType::MonopolySocial)
    }
}

impl FromStr for GameType {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        GameType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(wanted) || t.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| GameError::Validation(format!("unsupported game type '{wanted}'")))
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishCause {
    /// Mover delivered mate.
    Checkmate,
    /// Side to move has no legal move and is not in check.
    Stalemate,
    /// Neither side can mate.
    InsufficientMaterial,
    /// Same position occurred three times.
    ThreefoldRepetition,
    /// A clock reached zero.
    Timeout,
    /// A participant resigned.
    Resignation,
    /// A draw offer was accepted.
    DrawAgreement,
    /// Score-based game finished by request.
    Score,
    /// Host withdrew before anyone joined.
    Cancelled,
}

impl FinishCause {
    /// Drawn results never carry a winner.
    pub fn is_draw(self) -> bool {
        matches!(
            self,
            FinishCause::Stalemate
                | FinishCause::InsufficientMaterial
                | FinishCause::ThreefoldRepetition
                | FinishCause::DrawAgreement
        )
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Game-specific sub-state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GameState {
    /// Turn-based board game.
    Chess(ChessSubState),
    /// Score-based skill game.
    Live(LiveState),
}

/// Authoritative session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSession {
    /// Session id.
    pub id: SessionId,
    /// Creator, plays white in chess.
    pub host_name: String,
    /// Joiner, set once.
    pub guest_name: Option<String>,
    /// Game type.
    pub game_type: GameType,
    /// Current status.
    pub status: SessionStatus,
    /// Points at stake.
    pub stake: u64,
    /// Café table label.
    pub table: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Finish time.
    pub finished_at: Option<DateTime<Utc>>,
    /// Finish cause.
    pub finished_by: Option<FinishCause>,
    /// Winner, `None` for draws and unfinished sessions.
    pub winner: Option<String>,
    /// Sub-state.
    pub state: GameState,
    /// Bumped on every mutation.
    pub revision: u64,
}

/// Trim and bound a display name.
pub fn clean_name(raw: &str, what: &str) -> Result<String, GameError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GameError::Validation(format!("{what} is required")));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(GameError::Validation(format!(
            "{what} must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

impl GameSession {
    /// Create a waiting session.
    pub fn new(
        host_name: &str,
        game_type: GameType,
        stake: u64,
        table: &str,
        state: GameState,
        now: DateTime<Utc>,
    ) -> Result<Self, GameError> {
        let host_name = clean_name(host_name, "host name")?;
        if stake > MAX_STAKE {
            return Err(GameError::Validation(format!("stake {stake} exceeds the limit of {MAX_STAKE}")));
        }
        let table = if table.trim().is_empty() {
            "default".to_string()
        } else {
            clean_name(table, "table")?
        };

        Ok(Self {
            id: Uuid::new_v4(),
            host_name,
            guest_name: None,
            game_type,
            status: SessionStatus::Waiting,
            stake,
            table,
            created_at: now,
            finished_at: None,
            finished_by: None,
            winner: None,
            state,
            revision: 1,
        })
    }

    /// Record a mutation.
    pub fn touch(&mut self) {
        self.revision += 1;
    }

    /// Seated participants, host first.
    pub fn participants(&self) -> Vec<&str> {
        std::iter::once(self.host_name.as_str())
            .chain(self.guest_name.as_deref())
            .collect()
    }

    /// Seat of a participant, if seated.
    pub fn seat_of(&self, identity: &str) -> Option<Seat> {
        if same_participant(&self.host_name, identity) {
            Some(Seat::Host)
        } else if self.guest_name.as_deref().is_some_and(|g| same_participant(g, identity)) {
            Some(Seat::Guest)
        } else {
            None
        }
    }

    /// Canonical spelling of the participant in `seat`.
    pub fn participant_at(&self, seat: Seat) -> Option<&str> {
        match seat {
            Seat::Host => Some(self.host_name.as_str()),
            Seat::Guest => self.guest_name.as_deref(),
        }
    }

    /// Canonical spelling of a participant.
    pub fn canonical_participant(&self, identity: &str) -> Option<&str> {
        self.seat_of(identity).and_then(|seat| self.participant_at(seat))
    }

    /// Resolve an actor to their seat or fail.
    pub fn require_seat(&self, identity: &str) -> Result<Seat, GameError> {
        self.seat_of(identity)
            .ok_or_else(|| GameError::NotParticipant(participant_key(identity)))
    }

    /// Canonical name of the actor's opponent.
    pub fn opponent_of(&self, identity: &str) -> Option<&str> {
        self.seat_of(identity)
            .and_then(|seat| self.participant_at(seat.opponent()))
    }

    /// Apply a status change through the transition table.
    pub fn transition(&mut self, next: SessionStatus) -> Result<(), GameError> {
        if !self.status.can_transition_to(next) {
            return Err(GameError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        Ok(())
    }

    /// Fail unless the session is active.
    pub fn require_active(&self) -> Result<(), GameError> {
        match self.status {
            SessionStatus::Active => Ok(()),
            SessionStatus::Waiting => Err(GameError::StateConflict(
                "session is still waiting for an opponent".to_string(),
            )),
            SessionStatus::Finished => Err(GameError::StateConflict(
                "session is already finished".to_string(),
            )),
        }
    }

    /// Seat the guest and activate the session. A chess clock starts now.
    pub fn join(&mut self, guest_name: &str, now: DateTime<Utc>) -> Result<(), GameError> {
        if self.status != SessionStatus::Waiting || self.guest_name.is_some() {
            return Err(GameError::StateConflict("session is not open for joining".to_string()));
        }
        let guest_name = clean_name(guest_name, "guest name")?;
        if same_participant(&guest_name, &self.host_name) {
            return Err(GameError::Validation("cannot join your own session".to_string()));
        }

        self.transition(SessionStatus::Active)?;
        self.guest_name = Some(guest_name);
        if let GameState::Chess(chess) = &mut self.state {
            chess.clock.start(now);
        }
        self.touch();
        Ok(())
    }

    /// Finish the session. Returns `false` when it was already finished.
    ///
    /// `winner` must be a canonical participant name or `None` for a draw.
    /// A chess clock freezes and any draw offer is cleared.
    pub fn finish(
        &mut self,
        winner: Option<String>,
        cause: FinishCause,
        now: DateTime<Utc>,
    ) -> Result<bool, GameError> {
        if self.status.is_terminal() {
            return Ok(false);
        }
        self.transition(SessionStatus::Finished)?;
        self.winner = winner;
        self.finished_by = Some(cause);
        self.finished_at = Some(now);
        if let GameState::Chess(chess) = &mut self.state {
            chess.clock.stop();
            chess.draw_offer = None;
        }
        self.touch();
        Ok(true)
    }

    /// Withdraw a session nobody has joined yet. It finishes without a
    /// winner and is never settled.
    pub fn cancel(&mut self, actor: &str, now: DateTime<Utc>) -> Result<(), GameError> {
        self.require_seat(actor)?;
        if self.status != SessionStatus::Waiting {
            return Err(GameError::StateConflict(format!("cannot cancel a {} session", self.status)));
        }
        self.finish(None, FinishCause::Cancelled, now)?;
        Ok(())
    }

    /// Resign on behalf of `actor`. The opponent wins.
    pub fn resign(&mut self, actor: &str, now: DateTime<Utc>) -> Result<(), GameError> {
        let seat = self.require_seat(actor)?;
        self.require_active()?;
        let winner = self.participant_at(seat.opponent()).map(str::to_string);
        self.finish(winner, FinishCause::Resignation, now)?;
        Ok(())
    }

    /// Chess sub-state.
    pub fn chess(&self) -> Option<&ChessSubState> {
        match &self.state {
            GameState::Chess(chess) => Some(chess),
            GameState::Live(_) => None,
        }
    }

    /// Mutable chess sub-state, or a validation error for other games.
    pub fn chess_mut(&mut self) -> Result<&mut ChessSubState, GameError> {
        match &mut self.state {
            GameState::Chess(chess) => Ok(chess),
            GameState::Live(_) => Err(GameError::Validation(format!(
                "{} is not a chess session",
                self.game_type
            ))),
        }
    }

    /// Score sub-state.
    pub fn live(&self) -> Option<&LiveState> {
        match &self.state {
            GameState::Live(live) => Some(live),
            GameState::Chess(_) => None,
        }
    }

    /// Mutable score sub-state, or a validation error for chess.
    pub fn live_mut(&mut self) -> Result<&mut LiveState, GameError> {
        match &mut self.state {
            GameState::Live(live) => Ok(live),
            GameState::Chess(_) => Err(GameError::Validation(
                "chess sessions do not accept score submissions".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ClockConfig;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn live_session() -> GameSession {
        GameSession::new(
            " Alice ",
            GameType::ReflexRush,
            50,
            "T4",
            GameState::Live(LiveState::new("reflex_rush")),
            t0(),
        )
        .unwrap()
    }

    fn chess_session() -> GameSession {
        let state = GameState::Chess(ChessSubState::new("startpos", &ClockConfig::default()));
        GameSession::new("Alice", GameType::RetroChess, 100, "", state, t0()).unwrap()
    }

    #[test]
    fn test_transition_table() {
        use SessionStatus::*;
        assert!(Waiting.can_transition_to(Active));
        assert!(Waiting.can_transition_to(Finished));
        assert!(Active.can_transition_to(Active));
        assert!(Finished.can_transition_to(Finished));
        assert!(!Active.can_transition_to(Waiting));
        assert!(!Finished.can_transition_to(Active));
        assert!(!Waiting.can_transition_to(Waiting));
    }

    #[test]
    fn test_invalid_transition_leaves_status() {
        let mut session = live_session();
        session.status = SessionStatus::Finished;
        let err = session.transition(SessionStatus::Active).unwrap_err();
        assert_eq!(
            err,
            GameError::InvalidTransition { from: SessionStatus::Finished, to: SessionStatus::Active }
        );
        assert_eq!(session.status, SessionStatus::Finished);
    }

    #[test]
    fn test_new_trims_names() {
        let session = live_session();
        assert_eq!(session.host_name, "Alice");
        assert_eq!(session.status, SessionStatus::Waiting);
        assert!(GameSession::new("  ", GameType::ReflexRush, 0, "", GameState::Live(LiveState::default()), t0()).is_err());
    }

    #[test]
    fn test_stake_limit() {
        let state = || GameState::Live(LiveState::default());
        assert!(GameSession::new("Alice", GameType::ReflexRush, MAX_STAKE, "", state(), t0()).is_ok());
        let over = GameSession::new("Alice", GameType::ReflexRush, MAX_STAKE + 1, "", state(), t0());
        assert!(matches!(over, Err(GameError::Validation(_))));
    }

    #[test]
    fn test_join_rules() {
        let mut session = live_session();
        assert!(matches!(session.join("ALICE", t0()), Err(GameError::Validation(_))));
        session.join("Bob", t0()).unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.participants(), vec!["Alice", "Bob"]);
        assert!(matches!(session.join("Carol", t0()), Err(GameError::StateConflict(_))));
    }

    #[test]
    fn test_join_starts_chess_clock() {
        let mut session = chess_session();
        assert!(!session.chess().unwrap().clock.is_running());
        session.join("Bob", t0()).unwrap();
        let clock = &session.chess().unwrap().clock;
        assert_eq!(clock.active_at, Some(t0()));
        assert_eq!(clock.last_tick_at, Some(t0()));
    }

    #[test]
    fn test_participant_lookup_is_case_insensitive() {
        let mut session = live_session();
        session.join("Bob", t0()).unwrap();
        assert_eq!(session.seat_of(" bob"), Some(Seat::Guest));
        assert_eq!(session.canonical_participant("ALICE"), Some("Alice"));
        assert_eq!(session.opponent_of("alice"), Some("Bob"));
        assert!(matches!(session.require_seat("mallory"), Err(GameError::NotParticipant(_))));
    }

    #[test]
    fn test_resign_awards_opponent() {
        let mut session = chess_session();
        session.join("Bob", t0()).unwrap();
        let revision = session.revision;
        session.resign("bob", t0()).unwrap();
        assert_eq!(session.status, SessionStatus::Finished);
        assert_eq!(session.winner.as_deref(), Some("Alice"));
        assert_eq!(session.finished_by, Some(FinishCause::Resignation));
        assert!(!session.chess().unwrap().clock.is_running());
        assert!(session.revision > revision);

        assert!(matches!(session.resign("alice", t0()), Err(GameError::StateConflict(_))));
    }

    #[test]
    fn test_cancel_only_while_waiting() {
        let mut session = chess_session();
        assert!(matches!(session.cancel("mallory", t0()), Err(GameError::NotParticipant(_))));
        session.cancel("alice", t0()).unwrap();
        assert_eq!(session.status, SessionStatus::Finished);
        assert_eq!(session.finished_by, Some(FinishCause::Cancelled));
        assert_eq!(session.winner, None);
        assert!(matches!(session.join("Bob", t0()), Err(GameError::StateConflict(_))));

        let mut active = live_session();
        active.join("Bob", t0()).unwrap();
        assert!(matches!(active.cancel("alice", t0()), Err(GameError::StateConflict(_))));
        assert_eq!(active.status, SessionStatus::Active);
    }

    #[test]
    fn test_finish_reports_first_transition_only() {
        let mut session = live_session();
        session.join("Bob", t0()).unwrap();
        assert!(session.finish(Some("Bob".into()), FinishCause::Score, t0()).unwrap());
        assert!(!session.finish(Some("Alice".into()), FinishCause::Score, t0()).unwrap());
        assert_eq!(session.winner.as_deref(), Some("Bob"));
    }

    #[test]
    fn test_game_type_parsing() {
        assert_eq!("retro_chess".parse::<GameType>().unwrap(), GameType::RetroChess);
        assert_eq!("uno social".parse::<GameType>().unwrap(), GameType::UnoSocial);
        assert!("checkers".parse::<GameType>().is_err());
        assert!(GameType::MonopolySocial.is_non_competitive());
        assert!(!GameType::ReflexRush.is_non_competitive());
    }
}
