//! Game Clock
//!
//! Fischer-increment clock with lazy decay. There is no background timer:
//! the side to move loses time as a pure function of wall-clock time elapsed
//! since `last_tick_at`, and every read or mutation settles that decay first.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::identity::Color;

/// Default base time (3 minutes).
pub const DEFAULT_BASE_MS: u64 = 3 * 60 * 1000;

/// Default increment per move (2 seconds).
pub const DEFAULT_INCREMENT_MS: u64 = 2 * 1000;

/// Smallest accepted base time in seconds.
pub const MIN_BASE_SECS: u64 = 60;

/// Largest accepted base time in seconds.
pub const MAX_BASE_SECS: u64 = 1800;

/// Largest accepted increment in seconds.
pub const MAX_INCREMENT_SECS: u64 = 30;

/// Upper bound for a side's remaining time after an increment.
pub const MAX_REMAINING_MS: u64 = 60 * 60 * 1000;

/// Time control chosen when a session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockConfig {
    /// Starting time per side.
    pub base_ms: u64,
    /// Time credited to the mover after each move.
    pub increment_ms: u64,
    /// Display label, e.g. "3+2".
    pub label: String,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_BASE_MS,
            increment_ms: DEFAULT_INCREMENT_MS,
            label: "3+2 Blitz".to_string(),
        }
    }
}

impl ClockConfig {
    /// Build a time control from requested seconds, clamped to the accepted range.
    pub fn from_seconds(base_secs: Option<u64>, increment_secs: Option<u64>) -> Self {
        let base = base_secs
            .unwrap_or(DEFAULT_BASE_MS / 1000)
            .clamp(MIN_BASE_SECS, MAX_BASE_SECS);
        let increment = increment_secs
            .unwrap_or(DEFAULT_INCREMENT_MS / 1000)
            .min(MAX_INCREMENT_SECS);

        Self {
            base_ms: base * 1000,
            increment_ms: increment * 1000,
            label: format_label(base, increment),
        }
    }

    /// Re-clamp a config received from outside.
    pub fn normalized(&self) -> Self {
        let mut config = Self::from_seconds(Some(self.base_ms / 1000), Some(self.increment_ms / 1000));
        let label = self.label.trim();
        if !label.is_empty() {
            config.label = label.chars().take(32).collect();
        }
        config
    }
}

fn format_label(base_secs: u64, increment_secs: u64) -> String {
    if base_secs % 60 == 0 {
        format!("{}+{}", base_secs / 60, increment_secs)
    } else {
        format!("{:.1}+{}", base_secs as f64 / 60.0, increment_secs)
    }
}

/// Result of settling elapsed time against the side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSettle {
    /// Side whose time was consumed.
    pub color: Color,
    /// Milliseconds consumed by this settle.
    pub elapsed_ms: u64,
    /// Remaining time of that side afterwards.
    pub remaining_ms: u64,
}

impl ClockSettle {
    /// The side ran out of time.
    pub fn flagged(&self) -> bool {
        self.remaining_ms == 0
    }
}

/// Runtime clock of a turn-based match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockState {
    /// Starting time per side.
    pub base_ms: u64,
    /// Increment per move.
    pub increment_ms: u64,
    /// White's remaining time.
    pub white_remaining_ms: u64,
    /// Black's remaining time.
    pub black_remaining_ms: u64,
    /// When the clock was started (opponent joined).
    pub active_at: Option<DateTime<Utc>>,
    /// Reference point for the running side. `None` while frozen.
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Display label.
    pub label: String,
}

impl ClockState {
    /// Create a frozen clock with full time on both sides.
    pub fn new(config: &ClockConfig) -> Self {
        Self {
            base_ms: config.base_ms,
            increment_ms: config.increment_ms,
            white_remaining_ms: config.base_ms,
            black_remaining_ms: config.base_ms,
            active_at: None,
            last_tick_at: None,
            label: config.label.clone(),
        }
    }

    /// Start running for the side to move.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.active_at = Some(now);
        self.last_tick_at = Some(now);
    }

    /// Freeze both sides.
    pub fn stop(&mut self) {
        self.last_tick_at = None;
    }

    /// Whether a side is currently running.
    pub fn is_running(&self) -> bool {
        self.last_tick_at.is_some()
    }

    /// Stored remaining time for a side.
    pub fn remaining(&self, color: Color) -> u64 {
        match color {
            Color::White => self.white_remaining_ms,
            Color::Black => self.black_remaining_ms,
        }
    }

    fn set_remaining(&mut self, color: Color, value: u64) {
        match color {
            Color::White => self.white_remaining_ms = value,
            Color::Black => self.black_remaining_ms = value,
        }
    }

    /// Milliseconds elapsed since the last tick, never negative.
    pub fn elapsed_since_tick(&self, now: DateTime<Utc>) -> u64 {
        match self.last_tick_at {
            Some(last) => (now - last).num_milliseconds().max(0) as u64,
            None => 0,
        }
    }

    /// Remaining time for `color` as observed at `now`, without mutating.
    pub fn observe(&self, to_move: Color, color: Color, now: DateTime<Utc>) -> u64 {
        let stored = self.remaining(color);
        if color == to_move {
            stored.saturating_sub(self.elapsed_since_tick(now))
        } else {
            stored
        }
    }

    /// Consume elapsed time from the side to move and move the tick forward
    /// by exactly the whole milliseconds charged. The sub-millisecond rest
    /// carries over to the next settle.
    ///
    /// The other side's value is untouched. A frozen clock settles to zero elapsed.
    pub fn settle(&mut self, to_move: Color, now: DateTime<Utc>) -> ClockSettle {
        let elapsed_ms = self.elapsed_since_tick(now);
        let remaining_ms = self.remaining(to_move).saturating_sub(elapsed_ms);
        self.set_remaining(to_move, remaining_ms);
        if let Some(last) = self.last_tick_at {
            let charged = i64::try_from(elapsed_ms).unwrap_or(i64::MAX);
            self.last_tick_at = Some(last + chrono::Duration::milliseconds(charged));
        }
        ClockSettle { color: to_move, elapsed_ms, remaining_ms }
    }

    /// Credit the increment to the side that just moved. Returns its new remaining time.
    pub fn credit_increment(&mut self, color: Color) -> u64 {
        let credited = self
            .remaining(color)
            .saturating_add(self.increment_ms)
            .min(MAX_REMAINING_MS);
        self.set_remaining(color, credited);
        credited
    }
}
