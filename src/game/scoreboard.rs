//! Scoreboard Resolution
//!
//! Skill games report a score per participant. The winner is a pure function
//! of the final scoreboard, so two clients submitting in any order converge on
//! the same result.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::identity::{participant_key, same_participant};

/// One participant's reported result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSubmission {
    /// Primary score, higher wins.
    pub score: u64,
    /// Rounds won, higher wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounds_won: Option<u32>,
    /// Time taken, lower wins. Missing counts as worst.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Server receive time, earlier wins.
    pub submitted_at: DateTime<Utc>,
    /// Participant finished playing.
    #[serde(default)]
    pub done: bool,
}

/// Participant name -> latest submission.
pub type Scoreboard = BTreeMap<String, ScoreSubmission>;

/// Order two submissions, best first.
///
/// Chain: score desc, rounds won desc, duration asc (missing last),
/// submission time asc.
pub fn compare_submissions(a: &ScoreSubmission, b: &ScoreSubmission) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| b.rounds_won.unwrap_or(0).cmp(&a.rounds_won.unwrap_or(0)))
        .then_with(|| {
            a.duration_ms
                .unwrap_or(u64::MAX)
                .cmp(&b.duration_ms.unwrap_or(u64::MAX))
        })
        .then_with(|| a.submitted_at.cmp(&b.submitted_at))
}

/// Pick the winner of a scoreboard.
///
/// Returns `None` until at least two participants have submitted. A complete
/// tie falls back to the lexicographically smallest participant key so the
/// result never depends on submission order.
pub fn pick_winner(scoreboard: &Scoreboard) -> Option<String> {
    if scoreboard.len() < 2 {
        return None;
    }

    scoreboard
        .iter()
        .min_by(|(name_a, a), (name_b, b)| {
            compare_submissions(a, b)
                .then_with(|| participant_key(name_a).cmp(&participant_key(name_b)))
        })
        .map(|(name, _)| name.clone())
}

/// Score state of a skill game session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveState {
    /// Game mode tag reported by clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Latest submission per participant.
    pub submissions: Scoreboard,
    /// Winner once every participant is done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_winner: Option<String>,
    /// Last submission time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LiveState {
    /// Create an empty state for a game mode.
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: Some(mode.into()),
            ..Self::default()
        }
    }

    /// Store or overwrite a participant's submission.
    pub fn record(&mut self, participant: &str, submission: ScoreSubmission) {
        self.updated_at = Some(submission.submitted_at);
        self.submissions.insert(participant.to_string(), submission);
    }

    /// Participants that have not reported `done` yet.
    pub fn waiting_for(&self, participants: &[&str]) -> Vec<String> {
        participants
            .iter()
            .filter(|name| {
                !self
                    .submissions
                    .iter()
                    .any(|(key, sub)| sub.done && same_participant(key, name))
            })
            .map(|name| name.to_string())
            .collect()
    }

    /// Re-derive the resolved winner. Needs two or more participants, all done.
    pub fn resolve(&mut self, participants: &[&str]) -> Option<String> {
        if participants.len() >= 2 && self.waiting_for(participants).is_empty() {
            let board: Scoreboard = self
                .submissions
                .iter()
                .filter(|(key, _)| participants.iter().any(|p| same_participant(key, p)))
                .map(|(key, sub)| (key.clone(), sub.clone()))
                .collect();
            self.resolved_winner = pick_winner(&board);
        }
        self.resolved_winner.clone()
    }
}
