//! User Store
//!
//! Collaborator interface to the account records that settlement mutates, and
//! an in-memory implementation that locks records individually.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use tokio::sync::{Mutex, RwLock};

use crate::core::identity::participant_key;
use crate::error::GameError;

/// Account record touched by settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    /// Display name.
    pub username: String,
    /// Point balance.
    pub points: u64,
    /// Won matches.
    pub wins: u64,
    /// Played matches.
    pub games_played: u64,
}

impl UserRecord {
    /// New account with a starting balance.
    pub fn new(username: impl Into<String>, points: u64) -> Self {
        Self { username: username.into(), points, wins: 0, games_played: 0 }
    }

    /// Apply a delta. Balances never drop below zero.
    pub fn apply(&mut self, delta: &StatDelta) {
        self.points = if delta.points >= 0 {
            self.points.saturating_add(delta.points as u64)
        } else {
            self.points.saturating_sub(delta.points.unsigned_abs())
        };
        self.wins += delta.wins;
        self.games_played += delta.games_played;
    }
}

/// Change to one account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatDelta {
    /// Balance change.
    pub points: i64,
    /// Win count change.
    pub wins: u64,
    /// Play count change.
    pub games_played: u64,
}

/// Deltas to apply atomically, keyed by participant key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettlementPlan {
    /// Per-account changes.
    pub deltas: BTreeMap<String, StatDelta>,
    /// Points moved from loser to winner.
    pub transferred_points: u64,
}

/// Planner run while the involved records are locked.
pub type Planner<'a> = &'a (dyn Fn(&BTreeMap<String, UserRecord>) -> SettlementPlan + Send + Sync);

/// Account storage used by settlement.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Records matching the identities, compared case-insensitively.
    async fn find_users(&self, identities: &[String]) -> Result<Vec<UserRecord>, GameError>;

    /// Apply a single delta.
    async fn update_balance_and_stats(&self, identity: &str, delta: StatDelta) -> Result<(), GameError>;

    /// Lock every record of `identities`, compute a plan from their current
    /// values and apply it before releasing. Unknown identities are absent
    /// from the map handed to the planner.
    async fn apply_atomic(&self, identities: &[String], planner: Planner<'_>) -> Result<SettlementPlan, GameError>;
}

/// In-memory store. Each record has its own lock; multi-record updates take
/// them in key order so overlapping settlements cannot deadlock.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<BTreeMap<String, Arc<Mutex<UserRecord>>>>,
}

impl MemoryUserStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with records.
    pub async fn with_users(records: impl IntoIterator<Item = UserRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record).await;
        }
        store
    }

    /// Insert or replace a record.
    pub async fn insert(&self, record: UserRecord) {
        let key = participant_key(&record.username);
        self.users.write().await.insert(key, Arc::new(Mutex::new(record)));
    }

    /// Current copy of a record.
    pub async fn get(&self, identity: &str) -> Option<UserRecord> {
        let handle = self.users.read().await.get(&participant_key(identity)).cloned()?;
        let record = handle.lock().await.clone();
        Some(record)
    }

    async fn handles(&self, identities: &[String]) -> Vec<(String, Arc<Mutex<UserRecord>>)> {
        let keys: std::collections::BTreeSet<String> =
            identities.iter().map(|i| participant_key(i)).collect();
        let users = self.users.read().await;
        keys.into_iter()
            .filter_map(|key| users.get(&key).cloned().map(|handle| (key, handle)))
            .collect()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_users(&self, identities: &[String]) -> Result<Vec<UserRecord>, GameError> {
        let mut records = Vec::new();
        for (_, handle) in self.handles(identities).await {
            records.push(handle.lock().await.clone());
        }
        Ok(records)
    }

    async fn update_balance_and_stats(&self, identity: &str, delta: StatDelta) -> Result<(), GameError> {
        let handle = self
            .users
            .read()
            .await
            .get(&participant_key(identity))
            .cloned()
            .ok_or_else(|| GameError::Settlement(format!("unknown user {identity}")))?;
        handle.lock().await.apply(&delta);
        Ok(())
    }

    async fn apply_atomic(&self, identities: &[String], planner: Planner<'_>) -> Result<SettlementPlan, GameError> {
        let handles = self.handles(identities).await;

        // Sorted key order.
        let mut guards = Vec::with_capacity(handles.len());
        for (key, handle) in &handles {
            guards.push((key.clone(), handle.lock().await));
        }

        let current: BTreeMap<String, UserRecord> = guards
            .iter()
            .map(|(key, guard)| (key.clone(), (**guard).clone()))
            .collect();
        let plan = planner(&current);

        for (key, guard) in guards.iter_mut() {
            if let Some(delta) = plan.deltas.get(key.as_str()) {
                guard.apply(delta);
            }
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_is_case_insensitive() {
        let store = MemoryUserStore::with_users([UserRecord::new("Alice", 10)]).await;
        let found = store.find_users(&["  ALICE".to_string(), "ghost".to_string()]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].username, "Alice");
    }

    #[tokio::test]
    async fn test_negative_delta_floors_at_zero() {
        let store = MemoryUserStore::with_users([UserRecord::new("Bob", 30)]).await;
        store
            .update_balance_and_stats("bob", StatDelta { points: -100, wins: 0, games_played: 1 })
            .await
            .unwrap();
        let bob = store.get("Bob").await.unwrap();
        assert_eq!(bob.points, 0);
        assert_eq!(bob.games_played, 1);

        assert!(store.update_balance_and_stats("nobody", StatDelta::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_atomic_updates_do_not_lose_writes() {
        let store = Arc::new(
            MemoryUserStore::with_users([UserRecord::new("a", 1_000), UserRecord::new("b", 1_000)]).await,
        );

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let ids = if i % 2 == 0 {
                vec!["a".to_string(), "b".to_string()]
            } else {
                vec!["B".to_string(), "A".to_string()]
            };
            tasks.push(tokio::spawn(async move {
                let planner = |users: &BTreeMap<String, UserRecord>| {
                    let mut plan = SettlementPlan::default();
                    if users.contains_key("a") {
                        plan.deltas.insert("a".into(), StatDelta { points: 1, wins: 0, games_played: 1 });
                    }
                    plan.deltas.insert("b".into(), StatDelta { points: -1, wins: 0, games_played: 1 });
                    plan
                };
                store.apply_atomic(&ids, &planner).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.get("a").await.unwrap().points, 1_020);
        assert_eq!(store.get("b").await.unwrap().points, 980);
        assert_eq!(store.get("a").await.unwrap().games_played, 20);
    }
}
