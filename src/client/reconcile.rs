//! Snapshot Reconciliation
//!
//! Pure decision of whether a candidate snapshot should replace what the
//! client last applied, plus the queue of optimistic actions awaiting their
//! acknowledgement.

use std::time::Duration;

use tokio::time::Instant;

use crate::network::protocol::{SessionAction, SessionSnapshot};

/// Where a candidate snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Push event.
    Push,
    /// Periodic pull.
    Poll,
    /// Direct reply to this client's own request.
    Direct,
}

/// What the client applied last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMarker {
    /// Revision of the applied snapshot.
    pub revision: u64,
    /// Its fingerprint.
    pub state_hash: String,
    /// Its source.
    pub source: Source,
    /// When it was applied.
    pub applied_at: Instant,
}

impl AppliedMarker {
    /// Marker for a snapshot applied now.
    pub fn new(snapshot: &SessionSnapshot, source: Source, applied_at: Instant) -> Self {
        Self {
            revision: snapshot.revision,
            state_hash: snapshot.state_hash.clone(),
            source,
            applied_at,
        }
    }
}

/// Reconciliation verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Replace the rendered state.
    Apply,
    /// Older than what is shown.
    SkipStale,
    /// Same fingerprint as what is shown.
    SkipDuplicate,
    /// A push of the same revision was applied inside the dedupe window.
    SkipRecentPush,
    /// Would hide an action still awaiting acknowledgement.
    DeferToPending,
}

/// Decide whether `candidate` from `source` should be applied.
pub fn reconcile(
    last: Option<&AppliedMarker>,
    candidate: &SessionSnapshot,
    source: Source,
    pending: &PendingActions,
    now: Instant,
    dedupe_window: Duration,
) -> Decision {
    if let Some(last) = last {
        if candidate.revision < last.revision {
            return Decision::SkipStale;
        }
        if candidate.state_hash == last.state_hash {
            return Decision::SkipDuplicate;
        }
        if source == Source::Poll
            && last.source == Source::Push
            && candidate.revision == last.revision
            && now.saturating_duration_since(last.applied_at) < dedupe_window
        {
            return Decision::SkipRecentPush;
        }
    }

    if candidate.is_terminal() {
        return Decision::Apply;
    }
    if source == Source::Poll && pending.blocks(candidate.revision) {
        return Decision::DeferToPending;
    }
    Decision::Apply
}

// =============================================================================
// PENDING ACTIONS
// =============================================================================

/// An action sent but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    /// Handle returned by [`PendingActions::push`].
    pub token: u64,
    /// Revision the client saw when sending.
    pub base_revision: u64,
    /// The action.
    pub action: SessionAction,
    /// Send time.
    pub submitted_at: Instant,
}

/// Optimistic actions in send order.
#[derive(Debug, Clone, Default)]
pub struct PendingActions {
    next_token: u64,
    entries: Vec<PendingAction>,
}

impl PendingActions {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sent action.
    pub fn push(&mut self, base_revision: u64, action: SessionAction, now: Instant) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.entries.push(PendingAction { token, base_revision, action, submitted_at: now });
        token
    }

    /// Remove an action once its reply arrived.
    pub fn acknowledge(&mut self, token: u64) -> Option<PendingAction> {
        let index = self.entries.iter().position(|e| e.token == token)?;
        Some(self.entries.remove(index))
    }

    /// Drop actions based on revisions older than `revision`. A newer
    /// authoritative state already reflects or supersedes them.
    pub fn supersede(&mut self, revision: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.base_revision >= revision);
        before - self.entries.len()
    }

    /// Whether a snapshot of `revision` predates some pending action.
    pub fn blocks(&self, revision: u64) -> bool {
        self.entries.iter().any(|e| revision <= e.base_revision)
    }

    /// Pending count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ClockConfig;
    use crate::game::chess::ChessSubState;
    use crate::game::session::{GameSession, GameState, GameType};
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn snapshot_at(revision: u64, finished: bool) -> SessionSnapshot {
        let state = GameState::Chess(ChessSubState::new("startpos", &ClockConfig::default()));
        let mut session = GameSession::new("Alice", GameType::RetroChess, 0, "", state, t0()).unwrap();
        session.join("Bob", t0()).unwrap();
        if finished {
            session.resign("Bob", t0()).unwrap();
        }
        session.id = uuid::Uuid::nil();
        session.revision = revision;
        SessionSnapshot::capture(&session, t0()).unwrap()
    }

    const WINDOW: Duration = Duration::from_secs(8);

    #[test]
    fn test_first_snapshot_applies() {
        let now = Instant::now();
        let decision = reconcile(None, &snapshot_at(2, false), Source::Poll, &PendingActions::new(), now, WINDOW);
        assert_eq!(decision, Decision::Apply);
    }

    #[test]
    fn test_stale_and_duplicate() {
        let now = Instant::now();
        let shown = snapshot_at(5, false);
        let last = AppliedMarker::new(&shown, Source::Poll, now);
        let pending = PendingActions::new();

        assert_eq!(reconcile(Some(&last), &snapshot_at(4, false), Source::Push, &pending, now, WINDOW), Decision::SkipStale);
        assert_eq!(reconcile(Some(&last), &shown, Source::Poll, &pending, now, WINDOW), Decision::SkipDuplicate);
        assert_eq!(reconcile(Some(&last), &snapshot_at(6, false), Source::Poll, &pending, now, WINDOW), Decision::Apply);
    }

    #[test]
    fn test_recent_push_wins_over_same_revision_poll() {
        let now = Instant::now();
        let pushed = snapshot_at(5, false);
        let last = AppliedMarker::new(&pushed, Source::Push, now);
        let mut polled = pushed.clone();
        polled.state_hash = "clock-settled".into();
        let pending = PendingActions::new();

        assert_eq!(
            reconcile(Some(&last), &polled, Source::Poll, &pending, now + Duration::from_secs(3), WINDOW),
            Decision::SkipRecentPush
        );
        assert_eq!(
            reconcile(Some(&last), &polled, Source::Poll, &pending, now + Duration::from_secs(9), WINDOW),
            Decision::Apply
        );
        assert_eq!(
            reconcile(Some(&last), &snapshot_at(6, false), Source::Poll, &pending, now, WINDOW),
            Decision::Apply
        );
    }

    #[test]
    fn test_pending_action_defers_stale_poll_only() {
        let now = Instant::now();
        let mut pending = PendingActions::new();
        let token = pending.push(5, SessionAction::Resign, now);

        assert_eq!(reconcile(None, &snapshot_at(5, false), Source::Poll, &pending, now, WINDOW), Decision::DeferToPending);
        assert_eq!(reconcile(None, &snapshot_at(5, false), Source::Push, &pending, now, WINDOW), Decision::Apply);
        assert_eq!(reconcile(None, &snapshot_at(6, false), Source::Poll, &pending, now, WINDOW), Decision::Apply);
        assert_eq!(reconcile(None, &snapshot_at(5, true), Source::Poll, &pending, now, WINDOW), Decision::Apply);

        assert_eq!(pending.acknowledge(token).map(|p| p.base_revision), Some(5));
        assert!(pending.is_empty());
        assert_eq!(pending.acknowledge(token), None);
    }

    #[test]
    fn test_supersede_drops_older_bases() {
        let now = Instant::now();
        let mut pending = PendingActions::new();
        pending.push(3, SessionAction::Join, now);
        pending.push(7, SessionAction::Resign, now);

        assert_eq!(pending.supersede(5), 1);
        assert_eq!(pending.len(), 1);
        assert!(pending.blocks(7));
        assert!(!pending.blocks(8));
    }

    proptest! {
        #[test]
        fn prop_never_applies_older_revision(last_rev in 1u64..50, candidate_rev in 1u64..50, push in any::<bool>()) {
            let now = Instant::now();
            let last = AppliedMarker::new(&snapshot_at(last_rev, false), Source::Push, now);
            let source = if push { Source::Push } else { Source::Poll };
            let decision = reconcile(Some(&last), &snapshot_at(candidate_rev, false), source, &PendingActions::new(), now, WINDOW);
            if candidate_rev < last_rev {
                prop_assert_eq!(decision, Decision::SkipStale);
            } else if candidate_rev == last_rev {
                prop_assert_eq!(decision, Decision::SkipDuplicate);
            } else {
                prop_assert_eq!(decision, Decision::Apply);
            }
        }
    }
}
