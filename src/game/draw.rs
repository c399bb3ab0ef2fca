//! Draw Offers
//!
//! At most one pending offer per session. Responding to an offer moves it to a
//! terminal status; a new offer may replace any non-pending record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::identity::same_participant;
use crate::error::GameError;

/// Lifecycle of a draw offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawOfferStatus {
    /// Waiting for the opponent.
    Pending,
    /// Opponent agreed, the game is drawn.
    Accepted,
    /// Opponent declined.
    Rejected,
    /// Offerer withdrew.
    Cancelled,
}

/// A draw offer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawOffer {
    /// Current status.
    pub status: DrawOfferStatus,
    /// Participant who offered.
    pub offered_by: String,
    /// When the offer was made.
    pub created_at: DateTime<Utc>,
    /// Participant who answered or withdrew.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_by: Option<String>,
    /// When it was answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

impl DrawOffer {
    /// Whether the offer still awaits an answer.
    pub fn is_pending(&self) -> bool {
        self.status == DrawOfferStatus::Pending
    }

    fn respond(&self, status: DrawOfferStatus, actor: &str, now: DateTime<Utc>) -> Self {
        Self {
            status,
            responded_by: Some(actor.to_string()),
            responded_at: Some(now),
            ..self.clone()
        }
    }
}

/// Draw sub-protocol action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawAction {
    /// Propose a draw.
    Offer,
    /// Agree to the opponent's proposal.
    Accept,
    /// Decline the opponent's proposal.
    Reject,
    /// Withdraw one's own proposal.
    Cancel,
}

impl FromStr for DrawAction {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "offer" => Ok(DrawAction::Offer),
            "accept" => Ok(DrawAction::Accept),
            "reject" => Ok(DrawAction::Reject),
            "cancel" => Ok(DrawAction::Cancel),
            other => Err(GameError::Validation(format!("unknown draw action '{other}'"))),
        }
    }
}

impl fmt::Display for DrawAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DrawAction::Offer => "offer",
            DrawAction::Accept => "accept",
            DrawAction::Reject => "reject",
            DrawAction::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// Outcome of a draw action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawTransition {
    /// The offer record after the action.
    pub record: DrawOffer,
    /// The game ends drawn.
    pub agreed: bool,
}

impl DrawTransition {
    /// Offer to keep on the session afterwards. Accepted offers are cleared.
    pub fn retained(&self) -> Option<DrawOffer> {
        (!self.agreed).then(|| self.record.clone())
    }
}

/// Apply a draw action for `actor` against the current offer.
///
/// `actor` must already be a verified participant of an active session.
pub fn apply_draw_action(
    current: Option<&DrawOffer>,
    action: DrawAction,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<DrawTransition, GameError> {
    let pending = current.filter(|offer| offer.is_pending());

    match (action, pending) {
        (DrawAction::Offer, Some(_)) => Err(GameError::StateConflict(
            "a draw offer is already pending".to_string(),
        )),
        (DrawAction::Offer, None) => Ok(DrawTransition {
            record: DrawOffer {
                status: DrawOfferStatus::Pending,
                offered_by: actor.to_string(),
                created_at: now,
                responded_by: None,
                responded_at: None,
            },
            agreed: false,
        }),
        (_, None) => Err(GameError::StateConflict(format!(
            "cannot {action} without a pending draw offer"
        ))),
        (DrawAction::Accept, Some(offer)) | (DrawAction::Reject, Some(offer))
            if same_participant(&offer.offered_by, actor) =>
        {
            Err(GameError::StateConflict(format!(
                "cannot {action} your own draw offer"
            )))
        }
        (DrawAction::Accept, Some(offer)) => Ok(DrawTransition {
            record: offer.respond(DrawOfferStatus::Accepted, actor, now),
            agreed: true,
        }),
        (DrawAction::Reject, Some(offer)) => Ok(DrawTransition {
            record: offer.respond(DrawOfferStatus::Rejected, actor, now),
            agreed: false,
        }),
        (DrawAction::Cancel, Some(offer)) if !same_participant(&offer.offered_by, actor) => {
            Err(GameError::StateConflict(
                "only the offering participant can cancel a draw offer".to_string(),
            ))
        }
        (DrawAction::Cancel, Some(offer)) => Ok(DrawTransition {
            record: offer.respond(DrawOfferStatus::Cancelled, actor, now),
            agreed: false,
        }),
    }
}
