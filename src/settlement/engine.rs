//! Settlement Engine
//!
//! Turns a finished session into point and statistic changes, exactly once
//! per session id.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Serialize, Deserialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::identity::participant_key;
use crate::error::GameError;
use crate::game::session::{GameSession, GameType, SessionId};
use crate::settlement::store::{SettlementPlan, StatDelta, UserRecord, UserStore};

/// Everything settlement needs to know about a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRequest {
    /// Session being settled.
    pub session_id: SessionId,
    /// Seated participants, host first.
    pub participants: Vec<String>,
    /// Declared winner.
    pub winner: Option<String>,
    /// Drawn result.
    pub is_draw: bool,
    /// Game type.
    pub game_type: GameType,
    /// Points at stake.
    pub stake: u64,
}

impl SettlementRequest {
    /// Build from a finished session.
    pub fn from_session(session: &GameSession) -> Self {
        let is_draw = session.winner.is_none()
            || session.finished_by.is_some_and(|cause| cause.is_draw());
        Self {
            session_id: session.id,
            participants: session.participants().into_iter().map(str::to_string).collect(),
            winner: session.winner.clone(),
            is_draw,
            game_type: session.game_type,
            stake: session.stake,
        }
    }
}

/// Applied settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResult {
    /// Points moved from loser to winner.
    pub transferred_points: u64,
    /// This call found the settlement already recorded.
    pub already_applied: bool,
}

/// Compute the deltas for a request from the current account values.
///
/// `users` is keyed by participant key; participants without a record are
/// skipped.
pub fn plan_settlement(request: &SettlementRequest, users: &BTreeMap<String, UserRecord>) -> SettlementPlan {
    let mut plan = SettlementPlan::default();
    let keys: Vec<String> = request.participants.iter().map(|p| participant_key(p)).collect();
    let played = StatDelta { points: 0, wins: 0, games_played: 1 };

    if request.game_type.is_non_competitive() {
        for key in keys.iter().filter(|k| users.contains_key(*k)) {
            plan.deltas.insert(key.clone(), played);
        }
        return plan;
    }

    let winner_key = request
        .winner
        .as_deref()
        .map(participant_key)
        .filter(|k| !k.is_empty());

    if let (false, Some(winner_key), 2) = (request.is_draw, winner_key.as_ref(), keys.len()) {
        if users.contains_key(winner_key) {
            let loser_key = keys.iter().find(|k| *k != winner_key);
            let loser = loser_key.and_then(|k| users.get(k));
            let transferable = loser.map(|l| request.stake.min(l.points)).unwrap_or(0);

            plan.deltas.insert(
                winner_key.clone(),
                StatDelta { points: transferable as i64, wins: 1, games_played: 1 },
            );
            if let (Some(key), Some(_)) = (loser_key, loser) {
                plan.deltas.insert(
                    key.clone(),
                    StatDelta { points: -(transferable as i64), wins: 0, games_played: 1 },
                );
            }
            plan.transferred_points = transferable;
            return plan;
        }
    }

    for key in keys.iter().filter(|k| users.contains_key(*k)) {
        let won = !request.is_draw && winner_key.as_ref() == Some(key);
        plan.deltas.insert(
            key.clone(),
            StatDelta { points: 0, wins: u64::from(won), games_played: 1 },
        );
    }
    plan
}

#[derive(Debug, Clone)]
enum LedgerEntry {
    InFlight,
    Applied(u64),
}

/// Exactly-once settlement over a [`UserStore`].
pub struct SettlementEngine {
    store: Arc<dyn UserStore>,
    ledger: Mutex<BTreeMap<SessionId, LedgerEntry>>,
}

impl SettlementEngine {
    /// Create an engine over a store.
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store, ledger: Mutex::new(BTreeMap::new()) }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn UserStore> {
        &self.store
    }

    /// Whether the session has been settled.
    pub async fn is_settled(&self, session_id: &SessionId) -> bool {
        matches!(self.ledger.lock().await.get(session_id), Some(LedgerEntry::Applied(_)))
    }

    /// Drop the applied marker of a session that no longer exists. An
    /// in-flight settlement keeps its marker.
    pub async fn forget(&self, session_id: &SessionId) -> bool {
        let mut ledger = self.ledger.lock().await;
        match ledger.get(session_id) {
            Some(LedgerEntry::Applied(_)) => ledger.remove(session_id).is_some(),
            _ => false,
        }
    }

    /// Sessions with a settlement marker.
    pub async fn ledger_len(&self) -> usize {
        self.ledger.lock().await.len()
    }

    /// Apply settlement for a finished session.
    ///
    /// A repeated call returns the recorded result without touching the
    /// store. A call racing an in-flight one is a state conflict. A failed
    /// attempt leaves no marker so it can be retried.
    pub async fn apply_settlement(&self, request: &SettlementRequest) -> Result<SettlementResult, GameError> {
        {
            let mut ledger = self.ledger.lock().await;
            match ledger.get(&request.session_id) {
                Some(LedgerEntry::Applied(points)) => {
                    debug!(session = %request.session_id, "Settlement already applied");
                    return Ok(SettlementResult { transferred_points: *points, already_applied: true });
                }
                Some(LedgerEntry::InFlight) => {
                    return Err(GameError::StateConflict("settlement already in progress".to_string()));
                }
                None => {
                    ledger.insert(request.session_id, LedgerEntry::InFlight);
                }
            }
        }

        let planner = |users: &BTreeMap<String, UserRecord>| plan_settlement(request, users);
        let outcome = self.store.apply_atomic(&request.participants, &planner).await;

        let mut ledger = self.ledger.lock().await;
        match outcome {
            Ok(plan) => {
                ledger.insert(request.session_id, LedgerEntry::Applied(plan.transferred_points));
                info!(
                    session = %request.session_id,
                    winner = ?request.winner,
                    transferred = plan.transferred_points,
                    "Settlement applied"
                );
                Ok(SettlementResult { transferred_points: plan.transferred_points, already_applied: false })
            }
            Err(err) => {
                ledger.remove(&request.session_id);
                warn!(session = %request.session_id, error = %err, "Settlement failed");
                Err(match err {
                    GameError::Settlement(_) => err,
                    other => GameError::Settlement(other.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::store::MemoryUserStore;
    use uuid::Uuid;

    fn request(winner: Option<&str>, is_draw: bool, game_type: GameType, stake: u64) -> SettlementRequest {
        SettlementRequest {
            session_id: Uuid::new_v4(),
            participants: vec!["Alice".into(), "Bob".into()],
            winner: winner.map(str::to_string),
            is_draw,
            game_type,
            stake,
        }
    }

    async fn store(alice: u64, bob: u64) -> Arc<MemoryUserStore> {
        Arc::new(MemoryUserStore::with_users([UserRecord::new("Alice", alice), UserRecord::new("Bob", bob)]).await)
    }

    #[tokio::test]
    async fn test_transfer_bounded_by_loser_balance() {
        let store = store(500, 30).await;
        let engine = SettlementEngine::new(store.clone());

        let result = engine
            .apply_settlement(&request(Some("alice"), false, GameType::ReflexRush, 100))
            .await
            .unwrap();
        assert_eq!(result.transferred_points, 30);

        let alice = store.get("alice").await.unwrap();
        let bob = store.get("bob").await.unwrap();
        assert_eq!((alice.points, alice.wins, alice.games_played), (530, 1, 1));
        assert_eq!((bob.points, bob.wins, bob.games_played), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_settlement_is_idempotent() {
        let store = store(200, 200).await;
        let engine = SettlementEngine::new(store.clone());
        let req = request(Some("Bob"), false, GameType::RetroChess, 50);

        let first = engine.apply_settlement(&req).await.unwrap();
        let second = engine.apply_settlement(&req).await.unwrap();
        assert!(!first.already_applied);
        assert!(second.already_applied);
        assert_eq!(second.transferred_points, 50);
        assert!(engine.is_settled(&req.session_id).await);

        assert_eq!(store.get("bob").await.unwrap().points, 250);
        assert_eq!(store.get("alice").await.unwrap().points, 150);
        assert_eq!(store.get("alice").await.unwrap().games_played, 1);
    }

    #[tokio::test]
    async fn test_forget_drops_applied_marker_only() {
        let engine = SettlementEngine::new(store(200, 200).await);
        let req = request(Some("Bob"), false, GameType::RetroChess, 50);
        assert!(!engine.forget(&req.session_id).await);

        engine.apply_settlement(&req).await.unwrap();
        assert_eq!(engine.ledger_len().await, 1);
        assert!(engine.forget(&req.session_id).await);
        assert_eq!(engine.ledger_len().await, 0);
        assert!(!engine.is_settled(&req.session_id).await);
    }

    #[tokio::test]
    async fn test_non_competitive_counts_plays_only() {
        let store = store(100, 100).await;
        let engine = SettlementEngine::new(store.clone());
        let result = engine
            .apply_settlement(&request(Some("Alice"), false, GameType::UnoSocial, 100))
            .await
            .unwrap();
        assert_eq!(result.transferred_points, 0);
        let alice = store.get("alice").await.unwrap();
        assert_eq!((alice.points, alice.wins, alice.games_played), (100, 0, 1));
    }

    #[test]
    fn test_draw_and_unmatched_winner_plans() {
        let mut users = BTreeMap::new();
        users.insert("alice".to_string(), UserRecord::new("Alice", 10));
        users.insert("bob".to_string(), UserRecord::new("Bob", 10));

        let draw = plan_settlement(&request(None, true, GameType::RetroChess, 100), &users);
        assert_eq!(draw.transferred_points, 0);
        assert!(draw.deltas.values().all(|d| d.games_played == 1 && d.wins == 0 && d.points == 0));

        let stranger = plan_settlement(&request(Some("Carol"), false, GameType::ReflexRush, 100), &users);
        assert_eq!(stranger.transferred_points, 0);
        assert!(stranger.deltas.values().all(|d| d.wins == 0));
    }

    #[test]
    fn test_single_participant_winner_gets_win_without_points() {
        let mut users = BTreeMap::new();
        users.insert("alice".to_string(), UserRecord::new("Alice", 10));
        let mut req = request(Some("Alice"), false, GameType::ReflexRush, 100);
        req.participants = vec!["Alice".into()];

        let plan = plan_settlement(&req, &users);
        assert_eq!(plan.deltas["alice"], StatDelta { points: 0, wins: 1, games_played: 1 });
    }

    #[test]
    fn test_missing_loser_record_transfers_nothing() {
        let mut users = BTreeMap::new();
        users.insert("alice".to_string(), UserRecord::new("Alice", 10));
        let plan = plan_settlement(&request(Some("Alice"), false, GameType::ReflexRush, 100), &users);
        assert_eq!(plan.transferred_points, 0);
        assert_eq!(plan.deltas["alice"], StatDelta { points: 0, wins: 1, games_played: 1 });
        assert!(!plan.deltas.contains_key("bob"));
    }
}
