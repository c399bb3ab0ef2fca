//! Session Management
//!
//! Owns every session and serializes mutations of each one behind its own
//! lock. The transition into `finished` happens at most once per session; it
//! publishes `game_finished` and triggers settlement, retrying in the
//! background when the store is unavailable.
//!
//! A participant holds at most one open (waiting or active) session at a
//! time. The index of open seats is locked before any session lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::core::clock::ClockConfig;
use crate::core::identity::{participant_key, same_participant};
use crate::error::GameError;
use crate::game::chess::{ChessMatchEngine, MoveOutcome};
use crate::game::draw::{DrawAction, DrawTransition};
use crate::game::rules::MoveRequest;
use crate::game::scoreboard::{pick_winner, LiveState, ScoreSubmission, Scoreboard};
use crate::game::session::{FinishCause, GameSession, GameState, GameType, SessionId, SessionStatus};
use crate::network::notifier::Notifier;
use crate::network::protocol::{
    ActionAck, CreateRequest, DrawUpdate, FinishedUpdate, LiveUpdate, PushEvent, PushPayload,
    SessionAction, SessionSnapshot, SettlementNotice,
};
use crate::settlement::engine::{SettlementEngine, SettlementRequest};

/// Background settlement retry policy.
#[derive(Debug, Clone, Copy)]
pub struct SettlementRetry {
    /// Attempts after the inline one.
    pub max_attempts: u32,
    /// Delay before the first retry, doubled each time.
    pub initial_backoff: Duration,
    /// Upper bound for the delay.
    pub max_backoff: Duration,
}

impl Default for SettlementRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// A reported result for a score-based game.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreReport {
    /// Score.
    pub score: u64,
    /// Rounds won.
    pub rounds_won: Option<u32>,
    /// Time taken.
    pub duration_ms: Option<u64>,
}

/// Result of an accepted mutation together with the session after it.
#[derive(Debug, Clone)]
pub struct Applied<T> {
    /// Operation-specific value.
    pub value: T,
    /// Session after the operation.
    pub snapshot: SessionSnapshot,
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Manages all sessions.
pub struct SessionManager {
    /// Sessions by id.
    sessions: RwLock<BTreeMap<SessionId, Arc<Mutex<GameSession>>>>,
    /// Open session per participant key.
    open: Mutex<BTreeMap<String, SessionId>>,
    /// Turn-based engine.
    chess: ChessMatchEngine,
    /// Point transfer.
    settlement: Arc<SettlementEngine>,
    /// Push sink.
    notifier: Arc<dyn Notifier>,
    /// Background retry policy.
    retry: SettlementRetry,
}

impl SessionManager {
    /// Create a manager with the standard chess rules.
    pub fn new(settlement: Arc<SettlementEngine>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            open: Mutex::new(BTreeMap::new()),
            chess: ChessMatchEngine::default(),
            settlement,
            notifier,
            retry: SettlementRetry::default(),
        }
    }

    /// Replace the chess engine.
    pub fn with_chess_engine(mut self, chess: ChessMatchEngine) -> Self {
        self.chess = chess;
        self
    }

    /// Replace the settlement retry policy.
    pub fn with_retry(mut self, retry: SettlementRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Settlement engine.
    pub fn settlement(&self) -> &Arc<SettlementEngine> {
        &self.settlement
    }

    /// Number of sessions held.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Create a waiting session.
    #[instrument(skip(self, request), fields(host = %request.host, game = %request.game_type))]
    pub async fn create(&self, request: CreateRequest, now: DateTime<Utc>) -> Result<SessionSnapshot, GameError> {
        let state = if request.game_type.is_chess() {
            let clock = request
                .clock
                .map(|c| ClockConfig::from_seconds(c.base_seconds, c.increment_seconds))
                .unwrap_or_default();
            GameState::Chess(self.chess.new_match(&clock))
        } else {
            GameState::Live(LiveState::new(request.game_type.as_str()))
        };

        let session = GameSession::new(
            &request.host,
            request.game_type,
            request.stake,
            &request.table,
            state,
            now,
        )?;
        self.check_balance(&session.host_name, session.stake).await?;
        self.require_free(&session.host_name, None, now).await?;
        let snapshot = SessionSnapshot::capture(&session, now)?;

        let mut open = self.open.lock().await;
        let host_key = participant_key(&session.host_name);
        if let Some(existing) = open.get(&host_key) {
            return Err(GameError::StateConflict(format!(
                "{} already has open session {existing}",
                session.host_name
            )));
        }
        open.insert(host_key, session.id);
        self.sessions
            .write()
            .await
            .insert(session.id, Arc::new(Mutex::new(session)));
        drop(open);

        info!(session = %snapshot.id, stake = snapshot.stake, "Session created");
        Ok(snapshot)
    }

    /// Waiting sessions, oldest first, optionally at one table.
    pub async fn list_open(&self, table: Option<&str>, now: DateTime<Utc>) -> Vec<SessionSnapshot> {
        let table = table.map(str::trim).filter(|t| !t.is_empty());
        let handles: Vec<_> = self.sessions.read().await.values().cloned().collect();

        let mut listed = Vec::new();
        for handle in handles {
            let session = handle.lock().await;
            if session.status != SessionStatus::Waiting
                || table.is_some_and(|t| !session.table.eq_ignore_ascii_case(t))
            {
                continue;
            }
            match SessionSnapshot::capture(&session, now) {
                Ok(snapshot) => listed.push(snapshot),
                Err(err) => warn!(session = %session.id, error = %err, "Skipping unlistable session"),
            }
        }
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        listed
    }

    /// The waiting or active session `identity` sits in, if any.
    pub async fn active_session_for(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionSnapshot>, GameError> {
        let Some(id) = self.open.lock().await.get(&participant_key(identity)).copied() else {
            return Ok(None);
        };
        match self.snapshot(id, now).await {
            Ok(snapshot) if !snapshot.is_terminal() => Ok(Some(snapshot)),
            Ok(_) | Err(GameError::SessionNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Authoritative snapshot. Settles clock decay first, which may finish
    /// the session on time.
    pub async fn snapshot(&self, id: SessionId, now: DateTime<Utc>) -> Result<SessionSnapshot, GameError> {
        let applied = self
            .mutate(id, now, |s| self.chess.resolve_timeout(s, now), |_, _, _| None)
            .await?;
        Ok(applied.snapshot)
    }

    /// Seat the guest. A guest already in another open session is refused.
    pub async fn join(&self, id: SessionId, guest: &str, now: DateTime<Utc>) -> Result<Applied<()>, GameError> {
        self.require_free(guest, Some(id), now).await?;
        let guest_key = participant_key(guest);
        let mut open = self.open.lock().await;
        if let Some(existing) = open.get(&guest_key).filter(|existing| **existing != id) {
            return Err(GameError::StateConflict(format!(
                "{} already has open session {existing}",
                guest.trim()
            )));
        }
        // Joining never finishes a session, so `mutate` will not touch `open`.
        let applied = self
            .mutate(
                id,
                now,
                |s| s.join(guest, now),
                |_, _, snapshot| Some(PushPayload::GameJoined(snapshot)),
            )
            .await?;
        open.insert(guest_key, id);
        drop(open);
        info!(session = %id, guest = ?applied.snapshot.guest_identity, "Guest joined");
        Ok(applied)
    }

    /// Apply a chess move.
    pub async fn apply_move(
        &self,
        id: SessionId,
        actor: &str,
        from: &str,
        to: &str,
        promotion: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Applied<MoveOutcome>, GameError> {
        let request = MoveRequest::sanitize(from, to, promotion)?;
        self.mutate(
            id,
            now,
            |s| self.chess.apply_move(s, actor, &request, now),
            |_, _, snapshot| Some(PushPayload::GameState(snapshot)),
        )
        .await
    }

    /// Apply a draw sub-protocol action.
    pub async fn draw_action(
        &self,
        id: SessionId,
        actor: &str,
        action: DrawAction,
        now: DateTime<Utc>,
    ) -> Result<Applied<DrawTransition>, GameError> {
        self.mutate(
            id,
            now,
            |s| self.chess.draw_action(s, actor, action, now),
            |_, session, snapshot| {
                let actor = session.canonical_participant(actor).unwrap_or(actor).to_string();
                Some(PushPayload::DrawOfferUpdated(DrawUpdate { snapshot, action, actor }))
            },
        )
        .await
    }

    /// Resign. The opponent wins.
    pub async fn resign(&self, id: SessionId, actor: &str, now: DateTime<Utc>) -> Result<Applied<()>, GameError> {
        self.mutate(
            id,
            now,
            |s| {
                if s.chess().is_some() {
                    self.chess.resign(s, actor, now)
                } else {
                    s.resign(actor, now)
                }
            },
            |_, _, _| None,
        )
        .await
    }

    /// Withdraw a waiting session. It finishes without a winner and moves no
    /// points.
    pub async fn cancel(&self, id: SessionId, actor: &str, now: DateTime<Utc>) -> Result<Applied<()>, GameError> {
        self.mutate(id, now, |s| s.cancel(actor, now), |_, _, _| None).await
    }

    /// Delete a session that is not in progress. Returns its last snapshot.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: SessionId, actor: &str, now: DateTime<Utc>) -> Result<SessionSnapshot, GameError> {
        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let handle = sessions.get(&id).cloned().ok_or(GameError::SessionNotFound(id))?;
            let session = handle.lock().await;
            session.require_seat(actor)?;
            if session.status == SessionStatus::Active {
                return Err(GameError::StateConflict(
                    "finish or resign the session before removing it".to_string(),
                ));
            }
            let snapshot = SessionSnapshot::capture(&session, now)?;
            sessions.remove(&id);
            snapshot
        };

        self.release(id, snapshot.participants()).await;
        self.discard(id).await;
        info!(session = %id, "Session removed");
        Ok(snapshot)
    }

    /// Record a final score. Returns the resolved winner once every
    /// participant is done.
    pub async fn submit_score(
        &self,
        id: SessionId,
        identity: &str,
        report: ScoreReport,
        now: DateTime<Utc>,
    ) -> Result<Applied<Option<String>>, GameError> {
        self.mutate(
            id,
            now,
            |s| record_score(s, identity, None, report, true, now),
            |_, session, snapshot| {
                let waiting_for = waiting_for(session);
                Some(PushPayload::ScoreSubmission(LiveUpdate { snapshot, waiting_for }))
            },
        )
        .await
    }

    /// Record live progress.
    pub async fn submit_live(
        &self,
        id: SessionId,
        identity: &str,
        mode: Option<&str>,
        report: ScoreReport,
        done: bool,
        now: DateTime<Utc>,
    ) -> Result<Applied<Option<String>>, GameError> {
        self.mutate(
            id,
            now,
            |s| record_score(s, identity, mode, report, done, now),
            |_, session, snapshot| {
                let waiting_for = waiting_for(session);
                Some(PushPayload::LiveSubmission(LiveUpdate { snapshot, waiting_for }))
            },
        )
        .await
    }

    /// Finish a score-based session.
    ///
    /// The winner is the resolved live winner, else the scoreboard winner,
    /// else `requested` when it names a participant. The value is `true` when
    /// the session had already finished with the same winner.
    pub async fn finish_session(
        &self,
        id: SessionId,
        actor: &str,
        requested: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Applied<bool>, GameError> {
        self.mutate(id, now, |s| finish_by_score(s, actor, requested, now), |_, _, _| None)
            .await
    }

    /// Route a wire action to its operation.
    pub async fn dispatch(
        &self,
        id: SessionId,
        identity: &str,
        action: SessionAction,
        now: DateTime<Utc>,
    ) -> Result<ActionAck, GameError> {
        debug!(session = %id, identity, action = action.name(), "Dispatching action");
        let ack = |snapshot| ActionAck { snapshot, already_finished: false };
        match action {
            SessionAction::Join => self.join(id, identity, now).await.map(|a| ack(a.snapshot)),
            SessionAction::Move { from, to, promotion } => self
                .apply_move(id, identity, &from, &to, promotion.as_deref(), now)
                .await
                .map(|a| ack(a.snapshot)),
            SessionAction::Draw { draw } => self
                .draw_action(id, identity, draw, now)
                .await
                .map(|a| ack(a.snapshot)),
            SessionAction::Resign => self.resign(id, identity, now).await.map(|a| ack(a.snapshot)),
            SessionAction::Score { score, rounds_won, duration_ms } => {
                let report = ScoreReport { score, rounds_won, duration_ms };
                self.submit_score(id, identity, report, now).await.map(|a| ack(a.snapshot))
            }
            SessionAction::Live { mode, score, rounds_won, duration_ms, done } => {
                let report = ScoreReport { score, rounds_won, duration_ms };
                self.submit_live(id, identity, mode.as_deref(), report, done, now)
                    .await
                    .map(|a| ack(a.snapshot))
            }
            SessionAction::Finish { winner } => self
                .finish_session(id, identity, winner.as_deref(), now)
                .await
                .map(|a| ActionAck { snapshot: a.snapshot, already_finished: a.value }),
            SessionAction::Cancel => self.cancel(id, identity, now).await.map(|a| ack(a.snapshot)),
            SessionAction::Remove => self.remove(id, identity, now).await.map(ack),
        }
    }

    /// Drop finished sessions that ended before `before`.
    pub async fn prune_finished(&self, before: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut to_remove = Vec::new();

        for (id, session) in sessions.iter() {
            let s = session.lock().await;
            if s.status.is_terminal() && s.finished_at.is_some_and(|at| at < before) {
                to_remove.push(*id);
            }
        }

        for id in &to_remove {
            sessions.remove(id);
        }
        drop(sessions);

        for id in &to_remove {
            self.discard(*id).await;
        }
        to_remove.len()
    }

    /// Host balance must cover a positive stake. Unknown hosts have none.
    async fn check_balance(&self, host: &str, stake: u64) -> Result<(), GameError> {
        if stake == 0 {
            return Ok(());
        }
        let users = self.settlement.store().find_users(&[host.to_string()]).await?;
        let balance = users
            .iter()
            .find(|user| same_participant(&user.username, host))
            .map_or(0, |user| user.points);
        if stake > balance {
            return Err(GameError::Validation(format!("stake {stake} exceeds balance {balance}")));
        }
        Ok(())
    }

    /// Refuse `identity` when it already sits in an open session other than
    /// `joining`. Reading that session first settles a lapsed clock.
    async fn require_free(
        &self,
        identity: &str,
        joining: Option<SessionId>,
        now: DateTime<Utc>,
    ) -> Result<(), GameError> {
        match self.active_session_for(identity, now).await? {
            Some(open) if Some(open.id) != joining => Err(GameError::StateConflict(format!(
                "{} already has open session {}",
                identity.trim(),
                open.id
            ))),
            _ => Ok(()),
        }
    }

    /// Free the open seats `participants` hold in session `id`.
    async fn release(&self, id: SessionId, participants: Vec<&str>) {
        let mut open = self.open.lock().await;
        for name in participants {
            let key = participant_key(name);
            if open.get(&key) == Some(&id) {
                open.remove(&key);
            }
        }
    }

    /// Drop per-session resources once the session itself is gone.
    async fn discard(&self, id: SessionId) {
        self.notifier.close_session(id).await;
        self.settlement.forget(&id).await;
    }

    async fn handle(&self, id: &SessionId) -> Result<Arc<Mutex<GameSession>>, GameError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(GameError::SessionNotFound(*id))
    }

    /// Run `op` under the session lock. A finished transition is concluded
    /// even when `op` itself fails, as lazy timeout resolution does.
    async fn mutate<T, Op, Ev>(
        &self,
        id: SessionId,
        now: DateTime<Utc>,
        op: Op,
        event: Ev,
    ) -> Result<Applied<T>, GameError>
    where
        Op: FnOnce(&mut GameSession) -> Result<T, GameError>,
        Ev: FnOnce(&T, &GameSession, SessionSnapshot) -> Option<PushPayload>,
    {
        let handle = self.handle(&id).await?;
        let (result, snapshot, payload, finished) = {
            let mut session = handle.lock().await;
            let was_terminal = session.status.is_terminal();
            let result = op(&mut session);
            let finished = (!was_terminal && session.status.is_terminal())
                .then(|| SettlementRequest::from_session(&session));
            let snapshot = SessionSnapshot::capture(&session, now)?;
            let payload = match &result {
                Ok(value) => event(value, &session, snapshot.clone()),
                Err(_) => None,
            };
            (result, snapshot, payload, finished)
        };

        if let Some(payload) = payload {
            self.notifier.publish(PushEvent::new(id, now, payload)).await;
        }
        if let Some(request) = finished {
            self.conclude(snapshot.clone(), request, now).await;
        }
        result.map(|value| Applied { value, snapshot })
    }

    async fn conclude(&self, snapshot: SessionSnapshot, request: SettlementRequest, now: DateTime<Utc>) {
        info!(
            session = %request.session_id,
            winner = ?request.winner,
            cause = ?snapshot.finished_by,
            "Session finished"
        );
        self.release(request.session_id, snapshot.participants()).await;

        let transferred_points = if snapshot.finished_by == Some(FinishCause::Cancelled) {
            Some(0)
        } else {
            match self.settlement.apply_settlement(&request).await {
                Ok(result) => Some(result.transferred_points),
                Err(err) => {
                    warn!(session = %request.session_id, error = %err, "Settlement deferred to background retry");
                    None
                }
            }
        };

        self.notifier
            .publish(PushEvent::new(
                request.session_id,
                now,
                PushPayload::GameFinished(FinishedUpdate { snapshot, transferred_points }),
            ))
            .await;

        if transferred_points.is_none() {
            self.spawn_settlement_retry(request);
        }
    }

    fn spawn_settlement_retry(&self, request: SettlementRequest) {
        let settlement = self.settlement.clone();
        let notifier = self.notifier.clone();
        let retry = self.retry;

        tokio::spawn(async move {
            let mut backoff = retry.initial_backoff;
            for attempt in 1..=retry.max_attempts {
                tokio::time::sleep(backoff).await;
                match settlement.apply_settlement(&request).await {
                    Ok(result) => {
                        info!(session = %request.session_id, attempt, "Settlement applied on retry");
                        let notice = SettlementNotice {
                            winner: request.winner.clone(),
                            transferred_points: result.transferred_points,
                        };
                        notifier
                            .publish(PushEvent::new(
                                request.session_id,
                                Utc::now(),
                                PushPayload::SettlementApplied(notice),
                            ))
                            .await;
                        return;
                    }
                    Err(err) => {
                        warn!(session = %request.session_id, attempt, error = %err, "Settlement retry failed");
                    }
                }
                backoff = (backoff * 2).min(retry.max_backoff);
            }
            error!(
                session = %request.session_id,
                attempts = retry.max_attempts,
                "Settlement abandoned"
            );
        });
    }
}

// =============================================================================
// SCORE GAMES
// =============================================================================

fn waiting_for(session: &GameSession) -> Vec<String> {
    session
        .live()
        .map(|live| live.waiting_for(&session.participants()))
        .unwrap_or_default()
}

fn record_score(
    session: &mut GameSession,
    identity: &str,
    mode: Option<&str>,
    report: ScoreReport,
    done: bool,
    now: DateTime<Utc>,
) -> Result<Option<String>, GameError> {
    session.live_mut()?;
    let seat = session.require_seat(identity)?;
    session.require_active()?;

    if let Some(mode) = mode.map(str::trim).filter(|m| !m.is_empty()) {
        if mode.parse::<GameType>().ok() != Some(session.game_type) {
            return Err(GameError::Validation(format!(
                "mode '{mode}' does not match {}",
                session.game_type
            )));
        }
    }

    let player = session.participant_at(seat).unwrap_or(identity).to_string();
    let participants: Vec<String> = session.participants().into_iter().map(str::to_string).collect();
    let participants: Vec<&str> = participants.iter().map(String::as_str).collect();

    let live = session.live_mut()?;
    live.record(
        &player,
        ScoreSubmission {
            score: report.score,
            rounds_won: report.rounds_won,
            duration_ms: report.duration_ms,
            submitted_at: now,
            done,
        },
    );
    let winner = live.resolve(&participants);
    session.touch();

    debug!(session = %session.id, player = %player, score = report.score, done, "Score recorded");
    Ok(winner)
}

fn derive_winner(session: &GameSession, requested: Option<&str>) -> Option<String> {
    let canonical = |name: &str| session.canonical_participant(name).map(str::to_string);

    let from_state = session.live().and_then(|live| {
        live.resolved_winner.as_deref().and_then(|w| canonical(w)).or_else(|| {
            let board: Scoreboard = live
                .submissions
                .iter()
                .filter(|(name, _)| session.seat_of(name).is_some())
                .map(|(name, sub)| (name.clone(), sub.clone()))
                .collect();
            pick_winner(&board).as_deref().and_then(|w| canonical(w))
        })
    });

    from_state.or_else(|| requested.and_then(|w| canonical(w)))
}

fn finish_by_score(
    session: &mut GameSession,
    actor: &str,
    requested: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, GameError> {
    session.require_seat(actor)?;
    let winner = derive_winner(session, requested);

    if session.status.is_terminal() {
        return match (&winner, &session.winner) {
            (None, _) => Ok(true),
            (Some(w), Some(current)) if same_participant(w, current) => Ok(true),
            _ => Err(GameError::StateConflict(
                "session already finished with a different winner".to_string(),
            )),
        };
    }
    if session.chess().is_some() {
        return Err(GameError::Validation("chess sessions finish through play".to_string()));
    }
    session.require_active()?;

    let winner = winner.ok_or_else(|| GameError::StateConflict("no winner can be determined yet".to_string()))?;
    session.finish(Some(winner), FinishCause::Score, now)?;
    Ok(false)
}
