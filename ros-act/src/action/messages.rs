//! Wire envelopes for the five action channels.
//!
//! Field layouts are fixed by the protocol and must stay bit-compatible
//! with existing deployments; the generic envelopes implement serde by hand
//! so the payload type parameter does not pick up spurious trait bounds.

use serde::{Deserialize, Serialize};

use crate::msg::{Stamp, WireMessage};

use super::{Action, GoalId, GoalStatus};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub seq: u32,
    pub stamp: Stamp,
}

impl Header {
    pub fn new(seq: u32) -> Self {
        Self {
            seq,
            stamp: Stamp::now(),
        }
    }
}

/// Goal submission: the payload wrapped with its freshly minted id.
#[derive(Debug)]
pub struct GoalMessage<A: Action> {
    pub header: Header,
    pub goal_id: GoalId,
    pub goal: A::Goal,
}

impl<A: Action> Clone for GoalMessage<A> {
    fn clone(&self) -> Self {
        Self {
            header: self.header.clone(),
            goal_id: self.goal_id.clone(),
            goal: self.goal.clone(),
        }
    }
}

impl<A: Action> Serialize for GoalMessage<A> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("GoalMessage", 3)?;
        state.serialize_field("header", &self.header)?;
        state.serialize_field("goal_id", &self.goal_id)?;
        state.serialize_field("goal", &self.goal)?;
        state.end()
    }
}

impl<'de, A: Action> Deserialize<'de> for GoalMessage<A> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct GoalMessageHelper<G> {
            header: Header,
            goal_id: GoalId,
            goal: G,
        }
        let helper = GoalMessageHelper::<A::Goal>::deserialize(deserializer)?;
        Ok(GoalMessage {
            header: helper.header,
            goal_id: helper.goal_id,
            goal: helper.goal,
        })
    }
}

impl<A: Action> WireMessage for GoalMessage<A> {
    fn type_name() -> String {
        format!("{}/ActionGoal", A::name())
    }
}

/// Cancellation request.
///
/// An empty id with a zero stamp cancels everything; an empty id with a
/// non-zero stamp cancels every goal sent at or before that stamp; a
/// non-empty id cancels that goal (plus, with a non-zero stamp, every goal
/// sent at or before it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelMessage {
    pub goal_id: GoalId,
}

impl WireMessage for CancelMessage {
    fn type_name() -> String {
        "actionlib_msgs/GoalID".to_string()
    }
}

/// Periodic snapshot of the server's full status table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusArrayMessage {
    pub header: Header,
    pub status_list: Vec<GoalStatus>,
}

impl WireMessage for StatusArrayMessage {
    fn type_name() -> String {
        "actionlib_msgs/GoalStatusArray".to_string()
    }
}

/// Terminal payload, stamped with the status it was produced under.
#[derive(Debug)]
pub struct ResultMessage<A: Action> {
    pub header: Header,
    pub status: GoalStatus,
    pub result: A::Result,
}

impl<A: Action> Clone for ResultMessage<A> {
    fn clone(&self) -> Self {
        Self {
            header: self.header.clone(),
            status: self.status.clone(),
            result: self.result.clone(),
        }
    }
}

impl<A: Action> Serialize for ResultMessage<A> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ResultMessage", 3)?;
        state.serialize_field("header", &self.header)?;
        state.serialize_field("status", &self.status)?;
        state.serialize_field("result", &self.result)?;
        state.end()
    }
}

impl<'de, A: Action> Deserialize<'de> for ResultMessage<A> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct ResultMessageHelper<R> {
            header: Header,
            status: GoalStatus,
            result: R,
        }
        let helper = ResultMessageHelper::<A::Result>::deserialize(deserializer)?;
        Ok(ResultMessage {
            header: helper.header,
            status: helper.status,
            result: helper.result,
        })
    }
}

impl<A: Action> WireMessage for ResultMessage<A> {
    fn type_name() -> String {
        format!("{}/ActionResult", A::name())
    }
}

/// Best-effort progress update for an active goal.
#[derive(Debug)]
pub struct FeedbackMessage<A: Action> {
    pub header: Header,
    pub status: GoalStatus,
    pub feedback: A::Feedback,
}

impl<A: Action> Clone for FeedbackMessage<A> {
    fn clone(&self) -> Self {
        Self {
            header: self.header.clone(),
            status: self.status.clone(),
            feedback: self.feedback.clone(),
        }
    }
}

impl<A: Action> Serialize for FeedbackMessage<A> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("FeedbackMessage", 3)?;
        state.serialize_field("header", &self.header)?;
        state.serialize_field("status", &self.status)?;
        state.serialize_field("feedback", &self.feedback)?;
        state.end()
    }
}

impl<'de, A: Action> Deserialize<'de> for FeedbackMessage<A> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct FeedbackMessageHelper<F> {
            header: Header,
            status: GoalStatus,
            feedback: F,
        }
        let helper = FeedbackMessageHelper::<A::Feedback>::deserialize(deserializer)?;
        Ok(FeedbackMessage {
            header: helper.header,
            status: helper.status,
            feedback: helper.feedback,
        })
    }
}

impl<A: Action> WireMessage for FeedbackMessage<A> {
    fn type_name() -> String {
        format!("{}/ActionFeedback", A::name())
    }
}
