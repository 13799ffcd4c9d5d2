use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// The states of an Identity Record's anchoring lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DidStatus {
    /// Minted locally, not yet confirmed on the registry.
    Pending,
    /// Registration confirmed on the registry.
    Active,
    /// Revoked on the registry. Final state.
    Revoked,
    /// Expired. Final state.
    Expired,
    /// Registration exhausted its retry budget.
    Failed,
}

impl DidStatus {
    /// Whether this is a final (terminal) state.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Revoked | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DidStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::UnknownDidStatus(other.to_string())),
        }
    }
}

/// Events that move an Identity Record between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DidEvent {
    /// A register or update transaction was confirmed on the registry.
    Confirm,
    /// The registration job ended in terminal failure.
    Fail,
    /// A dead-lettered registration was put back in the queue.
    Requeue,
    /// A revoke transaction was confirmed on the registry.
    Revoke,
    /// The DID reached the end of its validity.
    Expire,
}

impl fmt::Display for DidEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Validates Identity Record transitions.
///
/// Valid transitions:
/// - Pending → Active (Confirm)
/// - Pending → Failed (Fail)
/// - Failed → Pending (Requeue)
/// - Failed → Active (Confirm)
/// - Active → Active (Confirm)
/// - Active → Revoked (Revoke)
/// - Active → Expired (Expire)
pub struct DidStateMachine;

impl DidStateMachine {
    /// Attempt a state transition based on an event.
    pub fn transition(current: DidStatus, event: DidEvent) -> Result<DidStatus, CoreError> {
        let next = match (current, event) {
            (DidStatus::Pending, DidEvent::Confirm) => DidStatus::Active,
            (DidStatus::Pending, DidEvent::Fail) => DidStatus::Failed,

            (DidStatus::Failed, DidEvent::Requeue) => DidStatus::Pending,
            (DidStatus::Failed, DidEvent::Confirm) => DidStatus::Active,

            (DidStatus::Active, DidEvent::Confirm) => DidStatus::Active,
            (DidStatus::Active, DidEvent::Revoke) => DidStatus::Revoked,
            (DidStatus::Active, DidEvent::Expire) => DidStatus::Expired,

            _ => {
                return Err(CoreError::InvalidDidTransition {
                    from: current.to_string(),
                    event: event.to_string(),
                })
            }
        };

        tracing::debug!(from = %current, to = %next, event = ?event, "DID state transition");

        Ok(next)
    }

    /// Check if a transition is valid without performing it.
    pub fn can_transition(current: DidStatus, event: DidEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
