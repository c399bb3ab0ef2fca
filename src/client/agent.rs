//! Client Sync Agent
//!
//! Keeps one client's view of a session consistent with the authoritative
//! server over an unreliable push channel plus a fallback poll.
//!
//! ## Guarantees
//!
//! - A snapshot is applied only when [`reconcile`] says so.
//! - Pulls are skipped while a recent push covers them and while a
//!   rate-limit hint is in force. Pushes are always accepted.
//! - The terminal view is reported exactly once. Pulls stop there, and the
//!   loop waits a bounded time for the settlement notice.
//! - After [`ClientSyncAgent::teardown`], late replies are discarded.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::api::SessionApi;
use crate::client::reconcile::{reconcile, AppliedMarker, Decision, PendingActions, Source};
use crate::error::GameError;
use crate::game::session::SessionId;
use crate::network::notifier::PushConnector;
use crate::network::protocol::{ActionAck, PushEvent, SessionAction, SessionSnapshot};

/// Agent timing.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Fallback pull interval.
    pub poll_interval: Duration,
    /// A push applied this recently makes a pull redundant.
    pub push_dedupe_window: Duration,
    /// Consecutive pull failures tolerated before reporting trouble.
    pub max_silent_failures: u32,
    /// How long a concluded session waits for its settlement notice.
    pub settle_wait: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            push_dedupe_window: Duration::from_secs(8),
            max_silent_failures: 3,
            settle_wait: Duration::from_secs(30),
        }
    }
}

/// Notifications to the embedding UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// New state to render.
    Updated(SessionSnapshot),
    /// Session reached its terminal state. Sent once.
    Concluded(SessionSnapshot),
    /// Settlement amount became known. Sent once.
    Settled {
        /// Points moved.
        transferred_points: u64,
    },
    /// Pulls paused by a server hint.
    RateLimited {
        /// Pause length.
        retry_after_ms: u64,
    },
    /// Pulls keep failing.
    ConnectionTrouble {
        /// Consecutive failures so far.
        failures: u32,
        /// Last error.
        error: GameError,
    },
}

/// Result of one pull attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Fetched and reconciled.
    Fetched(Decision),
    /// Skipped, a push arrived inside the dedupe window.
    SkippedRecentPush,
    /// Skipped, a rate-limit hint is in force.
    Suppressed,
    /// Reply arrived after teardown.
    Discarded,
}

#[derive(Default)]
struct AgentState {
    last: Option<AppliedMarker>,
    current: Option<SessionSnapshot>,
    last_push_at: Option<Instant>,
    pending: PendingActions,
    suppressed_until: Option<Instant>,
    silent_failures: u32,
    concluded: bool,
    concluded_at: Option<Instant>,
    settled: bool,
    torn_down: bool,
}

/// Per-session client reconciliation agent.
pub struct ClientSyncAgent {
    session_id: SessionId,
    identity: String,
    api: Arc<dyn SessionApi>,
    config: SyncConfig,
    state: Mutex<AgentState>,
    events: mpsc::UnboundedSender<AgentEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
    connector: Mutex<Option<Arc<dyn PushConnector>>>,
}

impl ClientSyncAgent {
    /// Create an agent and the stream of its events.
    pub fn new(
        session_id: SessionId,
        identity: impl Into<String>,
        api: Arc<dyn SessionApi>,
        config: SyncConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let agent = Arc::new(Self {
            session_id,
            identity: identity.into(),
            api,
            config,
            state: Mutex::new(AgentState::default()),
            events,
            task: Mutex::new(None),
            connector: Mutex::new(None),
        });
        (agent, rx)
    }

    /// Session followed.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Last applied snapshot.
    pub async fn current(&self) -> Option<SessionSnapshot> {
        self.state.lock().await.current.clone()
    }

    /// Whether the terminal view has been reported.
    pub async fn is_concluded(&self) -> bool {
        self.state.lock().await.concluded
    }

    /// Whether the background loop is still running.
    pub async fn is_running(&self) -> bool {
        self.task.lock().await.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Actions awaiting acknowledgement.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Connect, subscribe and run the push/poll loop in the background.
    pub async fn start(self: &Arc<Self>, connector: Arc<dyn PushConnector>) -> Result<(), GameError> {
        connector.connect().await?;
        let rx = connector.subscribe(self.session_id).await?;
        *self.connector.lock().await = Some(connector);

        let agent = Arc::clone(self);
        let handle = tokio::spawn(async move { agent.run(Some(rx)).await });
        if let Some(previous) = self.task.lock().await.replace(handle) {
            previous.abort();
        }
        info!(session = %self.session_id, identity = %self.identity, "Sync agent started");
        Ok(())
    }

    async fn run(self: Arc<Self>, mut push: Option<broadcast::Receiver<PushEvent>>) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let settle_deadline = {
                let state = self.state.lock().await;
                if state.torn_down || (state.concluded && state.settled) {
                    break;
                }
                state.concluded_at.map(|at| at + self.config.settle_wait)
            };

            tokio::select! {
                received = async {
                    match push.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match received {
                        Ok(event) => self.handle_push(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(session = %self.session_id, missed, "Push stream lagged, relying on poll");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!(session = %self.session_id, "Push stream closed, polling only");
                            push = None;
                        }
                    }
                }
                _ = ticker.tick(), if settle_deadline.is_none() => {
                    // Failures are reported through events.
                    let _ = self.poll_once().await;
                }
                _ = async {
                    match settle_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    info!(session = %self.session_id, "No settlement notice, sync loop stopping");
                    break;
                }
            }
        }
    }

    /// Apply a push event. Accepted even while pulls are suppressed.
    pub async fn handle_push(&self, event: PushEvent) {
        if event.session_id != self.session_id {
            return;
        }
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.torn_down {
            return;
        }
        if let Some(snapshot) = event.snapshot() {
            let decision = self.apply_candidate(&mut state, snapshot, Source::Push, now);
            if decision == Decision::Apply {
                state.last_push_at = Some(now);
            }
            debug!(session = %self.session_id, kind = event.kind(), ?decision, "Push reconciled");
        }
        if let Some(points) = event.transferred_points() {
            self.report_settled(&mut state, points);
        }
    }

    /// One pull: fetch unless skipped, then reconcile.
    pub async fn poll_once(&self) -> Result<PollOutcome, GameError> {
        {
            let now = Instant::now();
            let state = self.state.lock().await;
            if state.torn_down {
                return Ok(PollOutcome::Discarded);
            }
            if state.suppressed_until.is_some_and(|until| now < until) {
                debug!(session = %self.session_id, "Pull suppressed by rate limit");
                return Ok(PollOutcome::Suppressed);
            }
            if state
                .last_push_at
                .is_some_and(|at| now.saturating_duration_since(at) < self.config.push_dedupe_window)
            {
                return Ok(PollOutcome::SkippedRecentPush);
            }
        }

        let fetched = self.api.fetch_snapshot(self.session_id).await;

        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.torn_down {
            debug!(session = %self.session_id, "Discarding pull after teardown");
            return Ok(PollOutcome::Discarded);
        }
        match fetched {
            Ok(snapshot) => {
                state.silent_failures = 0;
                Ok(PollOutcome::Fetched(self.apply_candidate(&mut state, &snapshot, Source::Poll, now)))
            }
            Err(err) => {
                self.note_failure(&mut state, &err, now);
                Err(err)
            }
        }
    }

    /// Fetch and apply regardless of push recency, as after a conflict.
    pub async fn refresh(&self) -> Result<Decision, GameError> {
        let fetched = self.api.fetch_snapshot(self.session_id).await;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.torn_down {
            return Err(GameError::Transport("agent torn down".to_string()));
        }
        match fetched {
            Ok(snapshot) => Ok(self.apply_candidate(&mut state, &snapshot, Source::Direct, now)),
            Err(err) => {
                self.note_failure(&mut state, &err, now);
                Err(err)
            }
        }
    }

    /// Send an action. Until its reply arrives, pulls that predate it are
    /// deferred. A conflict triggers a refresh.
    pub async fn submit(&self, action: SessionAction) -> Result<ActionAck, GameError> {
        let token = {
            let mut state = self.state.lock().await;
            if state.torn_down {
                return Err(GameError::Transport("agent torn down".to_string()));
            }
            let base = state.last.as_ref().map(|m| m.revision).unwrap_or(0);
            state.pending.push(base, action.clone(), Instant::now())
        };

        let name = action.name();
        let result = self.api.send_action(self.session_id, &self.identity, action).await;

        let needs_refresh = {
            let now = Instant::now();
            let mut state = self.state.lock().await;
            if state.torn_down {
                return result;
            }
            state.pending.acknowledge(token);
            match &result {
                Ok(ack) => {
                    self.apply_candidate(&mut state, &ack.snapshot, Source::Direct, now);
                    false
                }
                Err(err) => {
                    debug!(session = %self.session_id, action = name, error = %err, "Action rejected");
                    if let GameError::RateLimited { retry_after_ms } = err {
                        self.suppress(&mut state, *retry_after_ms, now);
                    }
                    err.needs_refresh()
                }
            }
        };

        if needs_refresh {
            if let Err(err) = self.refresh().await {
                debug!(session = %self.session_id, error = %err, "Refresh after conflict failed");
            }
        }
        result
    }

    /// Stop the loop, close the push connection and ignore late replies.
    pub async fn teardown(&self) {
        {
            let mut state = self.state.lock().await;
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            state.pending.clear();
        }
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        if let Some(connector) = self.connector.lock().await.take() {
            connector.disconnect().await;
        }
        info!(session = %self.session_id, identity = %self.identity, "Sync agent torn down");
    }

    fn apply_candidate(
        &self,
        state: &mut AgentState,
        snapshot: &SessionSnapshot,
        source: Source,
        now: Instant,
    ) -> Decision {
        let decision = reconcile(
            state.last.as_ref(),
            snapshot,
            source,
            &state.pending,
            now,
            self.config.push_dedupe_window,
        );
        if decision != Decision::Apply {
            return decision;
        }

        state.last = Some(AppliedMarker::new(snapshot, source, now));
        state.current = Some(snapshot.clone());
        if source == Source::Push {
            state.pending.supersede(snapshot.revision);
        }
        self.emit(AgentEvent::Updated(snapshot.clone()));

        if snapshot.is_terminal() && !state.concluded {
            state.concluded = true;
            state.concluded_at = Some(now);
            info!(
                session = %self.session_id,
                winner = ?snapshot.winner,
                cause = ?snapshot.finished_by,
                "Session concluded"
            );
            self.emit(AgentEvent::Concluded(snapshot.clone()));
        }
        decision
    }

    fn report_settled(&self, state: &mut AgentState, transferred_points: u64) {
        if !state.settled {
            state.settled = true;
            self.emit(AgentEvent::Settled { transferred_points });
        }
    }

    fn suppress(&self, state: &mut AgentState, retry_after_ms: u64, now: Instant) {
        if retry_after_ms == 0 {
            return;
        }
        state.suppressed_until = Some(now + Duration::from_millis(retry_after_ms));
        info!(session = %self.session_id, retry_after_ms, "Pulls suppressed");
        self.emit(AgentEvent::RateLimited { retry_after_ms });
    }

    fn note_failure(&self, state: &mut AgentState, err: &GameError, now: Instant) {
        if let GameError::RateLimited { retry_after_ms } = err {
            self.suppress(state, *retry_after_ms, now);
            return;
        }
        state.silent_failures += 1;
        if state.silent_failures == self.config.max_silent_failures {
            warn!(session = %self.session_id, failures = state.silent_failures, error = %err, "Pulls keep failing");
            self.emit(AgentEvent::ConnectionTrouble {
                failures: state.silent_failures,
                error: err.clone(),
            });
        }
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}
