//! Submit and Wait
//!
//! Client helper for skill games: report a final score, then poll until the
//! scoreboard names a winner or the wait times out.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::client::api::SessionApi;
use crate::error::GameError;
use crate::game::scoreboard::{pick_winner, Scoreboard};
use crate::game::session::SessionId;
use crate::network::protocol::{SessionAction, SessionSnapshot};
use crate::network::session::ScoreReport;

/// Wait bounds.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWaitConfig {
    /// Give up after this long.
    pub timeout: Duration,
    /// Delay between snapshot fetches.
    pub poll_interval: Duration,
}

impl Default for ScoreWaitConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(45_000),
            poll_interval: Duration::from_millis(1_500),
        }
    }
}

/// Outcome of a wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreWaitResult {
    /// Winner, if the scoreboard resolved one.
    pub winner: Option<String>,
    /// The wait ran out.
    pub timed_out: bool,
    /// Last scoreboard seen.
    pub scoreboard: Scoreboard,
}

fn evaluate(snapshot: &SessionSnapshot) -> (Option<String>, Scoreboard) {
    let scoreboard = snapshot
        .game_state
        .live
        .as_ref()
        .map(|live| live.submissions.clone())
        .unwrap_or_default();
    let winner = match (&snapshot.winner, snapshot.is_terminal()) {
        (Some(winner), true) => Some(winner.clone()),
        _ => pick_winner(&scoreboard),
    };
    (winner, scoreboard)
}

/// Submit `report` and poll until a winner resolves or `config.timeout`
/// elapses. On timeout the winner is whatever the scoreboard yields then.
///
/// Transient fetch failures and rate limiting are absorbed by the loop.
pub async fn submit_score_and_wait_for_winner(
    api: &dyn SessionApi,
    session_id: SessionId,
    identity: &str,
    report: ScoreReport,
    config: ScoreWaitConfig,
) -> Result<ScoreWaitResult, GameError> {
    let deadline = Instant::now() + config.timeout;
    let action = SessionAction::Score {
        score: report.score,
        rounds_won: report.rounds_won,
        duration_ms: report.duration_ms,
    };
    let ack = api.send_action(session_id, identity, action).await?;
    let (mut winner, mut scoreboard) = evaluate(&ack.snapshot);

    while winner.is_none() {
        let now = Instant::now();
        if now >= deadline {
            info!(session = %session_id, identity, "Score wait timed out");
            return Ok(ScoreWaitResult { winner, timed_out: true, scoreboard });
        }

        let mut delay = config.poll_interval;
        match api.fetch_snapshot(session_id).await {
            Ok(snapshot) => (winner, scoreboard) = evaluate(&snapshot),
            Err(GameError::RateLimited { retry_after_ms }) => {
                debug!(session = %session_id, retry_after_ms, "Score wait rate limited");
                delay = delay.max(Duration::from_millis(retry_after_ms));
            }
            Err(err) if err.is_transient() => {
                debug!(session = %session_id, error = %err, "Score wait fetch failed");
            }
            Err(err) => return Err(err),
        }

        if winner.is_none() {
            sleep(delay.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    Ok(ScoreWaitResult { winner, timed_out: false, scoreboard })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;

    use crate::client::api::LocalApi;
    use crate::game::session::GameType;
    use crate::network::notifier::SessionChannels;
    use crate::network::protocol::CreateRequest;
    use crate::network::session::SessionManager;
    use crate::settlement::engine::SettlementEngine;
    use crate::settlement::store::MemoryUserStore;

    async fn score_session() -> (LocalApi, SessionId) {
        let settlement = Arc::new(SettlementEngine::new(Arc::new(MemoryUserStore::new())));
        let manager = Arc::new(SessionManager::new(settlement, Arc::new(SessionChannels::default())));
        let request = CreateRequest {
            host: "Ada".into(),
            game_type: GameType::ReflexRush,
            stake: 0,
            table: String::new(),
            clock: None,
        };
        let created = manager.create(request, Utc::now()).await.unwrap();
        manager.join(created.id, "Linus", Utc::now()).await.unwrap();
        (LocalApi::new(manager), created.id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_clients_converge_on_winner() {
        let (api, id) = score_session().await;
        let other = api.clone();

        let first = tokio::spawn(async move {
            submit_score_and_wait_for_winner(
                &other,
                id,
                "ada",
                ScoreReport { score: 3, rounds_won: None, duration_ms: Some(5_300) },
                ScoreWaitConfig::default(),
            )
            .await
        });
        sleep(Duration::from_secs(4)).await;
        let second = submit_score_and_wait_for_winner(
            &api,
            id,
            "linus",
            ScoreReport { score: 3, rounds_won: None, duration_ms: Some(4_800) },
            ScoreWaitConfig::default(),
        )
        .await
        .unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(second.winner.as_deref(), Some("Linus"));
        assert_eq!(first.winner, second.winner);
        assert!(!first.timed_out);
        assert_eq!(first.scoreboard.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_opponent() {
        let (api, id) = score_session().await;
        let started = Instant::now();

        let result = submit_score_and_wait_for_winner(
            &api,
            id,
            "Ada",
            ScoreReport { score: 9, ..Default::default() },
            ScoreWaitConfig::default(),
        )
        .await
        .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.winner, None);
        assert_eq!(result.scoreboard.len(), 1);
        assert!(started.elapsed() >= Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_rejected_submission_surfaces() {
        let (api, id) = score_session().await;
        let result = submit_score_and_wait_for_winner(
            &api,
            id,
            "Mallory",
            ScoreReport::default(),
            ScoreWaitConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(GameError::NotParticipant(_))));
    }
}
