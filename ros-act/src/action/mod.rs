//! Two-sided goal lifecycle protocol over plain publish/subscribe.
//!
//! A client submits goals on `<action>/goal`, requests cancellation on
//! `<action>/cancel`, and reconciles its per-goal state machine against the
//! server's periodic `<action>/status` broadcasts plus the `<action>/result`
//! and `<action>/feedback` streams. Every one of those channels may be
//! delayed, reordered, or dropped independently; the state machines on both
//! sides are built to tolerate that, not to fix it.

use serde::{Deserialize, Serialize};

use crate::msg::Stamp;
use crate::registry::TypeRegistry;

pub mod client;
pub(crate) mod driver;
pub mod macros;
pub mod messages;
pub mod server;


use messages::{CancelMessage, FeedbackMessage, GoalMessage, ResultMessage, StatusArrayMessage};

/// Core trait tying together the three payload types of one action.
pub trait Action: Send + Sync + 'static {
    type Goal: Clone + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static;
    type Result: Clone + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static;
    type Feedback: Clone + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static;

    fn name() -> &'static str;
}

/// Unique identifier for action goals.
///
/// Identity is carried by `id`; `stamp` records when the goal was sent and
/// orders goals that recur with the same id after a client restart. The
/// wire layout (timestamp + string) is fixed.
///
/// # Examples
///
/// ```
/// # use ros_act::action::GoalId;
/// let goal_id = GoalId::generate("/nav_client");
/// assert!(goal_id.id.starts_with("/nav_client-"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GoalId {
    pub stamp: Stamp,
    pub id: String,
}

impl GoalId {
    /// Mints a fresh id for a goal sent now by `caller_id`.
    pub fn generate(caller_id: &str) -> Self {
        Self {
            stamp: Stamp::now(),
            id: format!("{caller_id}-{}", uuid::Uuid::new_v4()),
        }
    }

    /// The empty id used by cancel messages as a wildcard.
    pub fn none() -> Self {
        Self {
            stamp: Stamp::default(),
            id: String::new(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.id.is_empty() && self.stamp.is_zero()
    }
}

/// Server-authoritative lifecycle state of a goal, as carried on the wire.
///
/// The `u8` discriminants are the protocol's fixed wire values and must not
/// be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[repr(u8)]
pub enum StatusCode {
    Pending = 0,
    Active = 1,
    Preempted = 2,
    Succeeded = 3,
    Aborted = 4,
    Rejected = 5,
    Preempting = 6,
    Recalling = 7,
    Recalled = 8,
    Lost = 9,
}

impl StatusCode {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Active),
            2 => Some(Self::Preempted),
            3 => Some(Self::Succeeded),
            4 => Some(Self::Aborted),
            5 => Some(Self::Rejected),
            6 => Some(Self::Preempting),
            7 => Some(Self::Recalling),
            8 => Some(Self::Recalled),
            9 => Some(Self::Lost),
            _ => None,
        }
    }

    /// Total order used by the client-side monotonic merge: an observed
    /// status only replaces the previous one if its rank is strictly
    /// higher, which makes the merge idempotent and order-independent.
    /// Every terminal code ranks above every non-terminal one.
    pub const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Active => 1,
            Self::Recalling => 2,
            Self::Preempting => 3,
            Self::Recalled => 4,
            Self::Rejected => 5,
            Self::Preempted => 6,
            Self::Aborted => 7,
            Self::Succeeded => 8,
            Self::Lost => 9,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Preempted
                | Self::Succeeded
                | Self::Aborted
                | Self::Rejected
                | Self::Recalled
                | Self::Lost
        )
    }
}

// The wire carries the raw u8, not a serde variant index.
impl Serialize for StatusCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        Self::from_u8(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid status code {value}")))
    }
}

/// One goal's status as broadcast by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalStatus {
    pub goal_id: GoalId,
    pub status: StatusCode,
    pub text: String,
}

impl GoalStatus {
    pub fn new(goal_id: GoalId, status: StatusCode) -> Self {
        Self {
            goal_id,
            status,
            text: String::new(),
        }
    }

    pub fn with_text(goal_id: GoalId, status: StatusCode, text: impl Into<String>) -> Self {
        Self {
            goal_id,
            status,
            text: text.into(),
        }
    }
}

/// Registers the five wire envelopes of action `A`. Call once at startup
/// for every action the process uses, before building clients or servers.
pub fn register_action_types<A: Action>(registry: &TypeRegistry) {
    registry.register::<GoalMessage<A>>();
    registry.register::<CancelMessage>();
    registry.register::<StatusArrayMessage>();
    registry.register::<ResultMessage<A>>();
    registry.register::<FeedbackMessage<A>>();
}

pub fn goal_topic(action_name: &str) -> String {
    format!("{action_name}/goal")
}

pub fn cancel_topic(action_name: &str) -> String {
    format!("{action_name}/cancel")
}

pub fn status_topic(action_name: &str) -> String {
    format!("{action_name}/status")
}

pub fn result_topic(action_name: &str) -> String {
    format!("{action_name}/result")
}

pub fn feedback_topic(action_name: &str) -> String {
    format!("{action_name}/feedback")
}
