//! Client-side goal state machine.
//!
//! The client owns one [`GoalEntry`] per sent goal, keyed by the goal id
//! string. All entry state is mutated from the dispatch loop in
//! [`driver`](super::driver), which drains the status/result/feedback
//! queues; everything else only reads through [`ClientGoalHandle`].

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pubsub::{Publisher, PublisherBuilder, SubscriberBuilder};
use crate::queue::{AsyncQueue, OverflowPolicy};
use crate::registry::TypeRegistry;
use crate::transport::Transport;
use crate::{Builder, Result};

use super::driver::{self, StatusEvent};
use super::messages::{
    CancelMessage, FeedbackMessage, GoalMessage, Header, ResultMessage, StatusArrayMessage,
};
use super::{Action, GoalId, GoalStatus, StatusCode};

/// Client-side view of a goal's progress, derived from the status, result,
/// and feedback streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CommState {
    WaitingForGoalAck,
    Pending,
    Active,
    WaitingForCancelAck,
    Recalling,
    Preempting,
    WaitingForResult,
    Done,
    Lost,
}

impl CommState {
    /// Done and Lost absorb every later observation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Lost)
    }
}

/// Explicit transition table: the state reached when `code` is observed in
/// `current`, or `None` for a protocol violation (the handle goes Lost).
///
/// Stale and duplicate observations never reach this table; the monotonic
/// rank merge in [`apply_status`] absorbs them first.
pub(crate) fn next_comm_state(current: CommState, code: StatusCode) -> Option<CommState> {
    use CommState as C;
    use StatusCode as S;

    let next = match (current, code) {
        (C::WaitingForGoalAck, S::Pending) => C::Pending,
        (C::WaitingForGoalAck, S::Active) => C::Active,
        (C::WaitingForGoalAck, S::Recalling) => C::Recalling,
        (C::WaitingForGoalAck, S::Preempting) => C::Preempting,
        (C::WaitingForGoalAck, code) if code.is_terminal() => C::WaitingForResult,

        (C::Pending, S::Pending) => C::Pending,
        (C::Pending, S::Active) => C::Active,
        (C::Pending, S::Recalling) => C::Recalling,
        (C::Pending, S::Preempting) => C::Preempting,
        (C::Pending, code) if code.is_terminal() => C::WaitingForResult,

        // A recall after the goal went active can only come from a
        // misbehaving server.
        (C::Active, S::Active) => C::Active,
        (C::Active, S::Preempting) => C::Preempting,
        (C::Active, S::Preempted | S::Succeeded | S::Aborted) => C::WaitingForResult,
        (C::Active, _) => return None,

        (C::WaitingForCancelAck, S::Pending | S::Active) => C::WaitingForCancelAck,
        (C::WaitingForCancelAck, S::Recalling) => C::Recalling,
        (C::WaitingForCancelAck, S::Preempting) => C::Preempting,
        (C::WaitingForCancelAck, code) if code.is_terminal() => C::WaitingForResult,

        (C::Recalling, S::Recalling) => C::Recalling,
        (C::Recalling, S::Preempting) => C::Preempting,
        (C::Recalling, code) if code.is_terminal() => C::WaitingForResult,
        (C::Recalling, _) => return None,

        (C::Preempting, S::Preempting) => C::Preempting,
        (C::Preempting, S::Preempted | S::Succeeded | S::Aborted) => C::WaitingForResult,
        (C::Preempting, _) => return None,

        (C::WaitingForResult, _) => C::WaitingForResult,
        (C::Done, _) => C::Done,
        (C::Lost, _) => C::Lost,

        _ => return None,
    };
    Some(next)
}

pub type TransitionCallback<A> = Arc<dyn Fn(&ClientGoalHandle<A>) + Send + Sync>;
pub type FeedbackCallback<A> =
    Arc<dyn Fn(&ClientGoalHandle<A>, &<A as Action>::Feedback) + Send + Sync>;

pub(crate) type GoalTable<A> = HashMap<String, Arc<GoalEntry<A>>>;

pub(crate) struct GoalEntry<A: Action> {
    pub(crate) goal_id: GoalId,
    pub(crate) sent_goal: A::Goal,
    pub(crate) on_transition: TransitionCallback<A>,
    pub(crate) on_feedback: FeedbackCallback<A>,
    pub(crate) state: Mutex<EntryState<A>>,
}

pub(crate) struct EntryState<A: Action> {
    pub(crate) comm: CommState,
    pub(crate) latest_status: Option<GoalStatus>,
    pub(crate) latest_result: Option<A::Result>,
    pub(crate) latest_feedback: Option<A::Feedback>,
    /// Set once any status/result/feedback referencing this goal arrived.
    pub(crate) acked: bool,
    /// End of the negotiation window; unacked entries go Lost past it.
    pub(crate) deadline: Instant,
}

impl<A: Action> GoalEntry<A> {
    pub(crate) fn new(
        goal_id: GoalId,
        sent_goal: A::Goal,
        on_transition: TransitionCallback<A>,
        on_feedback: FeedbackCallback<A>,
        negotiation_window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            goal_id,
            sent_goal,
            on_transition,
            on_feedback,
            state: Mutex::new(EntryState {
                comm: CommState::WaitingForGoalAck,
                latest_status: None,
                latest_result: None,
                latest_feedback: None,
                acked: false,
                deadline: Instant::now() + negotiation_window,
            }),
        })
    }
}

/// Caller-facing view of one tracked goal.
///
/// Handles are cheap to clone. The underlying entry stays in the client's
/// table until [`release`](ClientGoalHandle::release) is called; reaching
/// Done never removes it implicitly.
pub struct ClientGoalHandle<A: Action> {
    pub(crate) entry: Arc<GoalEntry<A>>,
    pub(crate) table: Weak<Mutex<GoalTable<A>>>,
}

impl<A: Action> Clone for ClientGoalHandle<A> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            table: self.table.clone(),
        }
    }
}

impl<A: Action> ClientGoalHandle<A> {
    pub fn goal_id(&self) -> &GoalId {
        &self.entry.goal_id
    }

    pub fn sent_goal(&self) -> &A::Goal {
        &self.entry.sent_goal
    }

    pub fn comm_state(&self) -> CommState {
        self.entry.state.lock().comm
    }

    pub fn is_done(&self) -> bool {
        self.comm_state().is_terminal()
    }

    pub fn latest_status(&self) -> Option<GoalStatus> {
        self.entry.state.lock().latest_status.clone()
    }

    pub fn latest_result(&self) -> Option<A::Result> {
        self.entry.state.lock().latest_result.clone()
    }

    pub fn latest_feedback(&self) -> Option<A::Feedback> {
        self.entry.state.lock().latest_feedback.clone()
    }

    /// Removes the goal from the client's table. After this, late messages
    /// for the goal are ignored as untracked.
    pub fn release(self) {
        if !self.is_done() {
            warn!(
                "[CLIENT] releasing goal {} before it reached a terminal state",
                self.entry.goal_id.id
            );
        }
        if let Some(table) = self.table.upgrade() {
            table.lock().remove(&self.entry.goal_id.id);
        }
    }
}

pub struct ActionClientConfig {
    /// How long to wait for the first status referencing a sent goal before
    /// declaring it Lost.
    pub negotiation_window: Duration,
    /// Period of the deadline sweep in the dispatch loop.
    pub lost_check_period: Duration,
    pub status_queue_depth: usize,
    pub result_queue_depth: usize,
    pub feedback_queue_depth: usize,
}

impl Default for ActionClientConfig {
    fn default() -> Self {
        Self {
            negotiation_window: Duration::from_secs(10),
            lost_check_period: Duration::from_millis(100),
            status_queue_depth: 64,
            result_queue_depth: 16,
            feedback_queue_depth: 16,
        }
    }
}

pub struct ActionClientBuilder<A: Action> {
    pub action_name: String,
    pub caller_id: String,
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<TypeRegistry>,
    pub config: ActionClientConfig,
    pub _phantom: PhantomData<A>,
}

impl<A: Action> ActionClientBuilder<A> {
    pub fn new(
        action_name: &str,
        caller_id: &str,
        transport: Arc<dyn Transport>,
        registry: Arc<TypeRegistry>,
    ) -> Self {
        Self {
            action_name: action_name.to_string(),
            caller_id: caller_id.to_string(),
            transport,
            registry,
            config: ActionClientConfig::default(),
            _phantom: PhantomData,
        }
    }

    pub fn with_config(mut self, config: ActionClientConfig) -> Self {
        self.config = config;
        self
    }
}

impl<A: Action> Builder for ActionClientBuilder<A> {
    type Output = ActionClient<A>;

    fn build(self) -> Result<Self::Output> {
        let goal_pub = PublisherBuilder::<GoalMessage<A>> {
            topic: super::goal_topic(&self.action_name),
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            _phantom: PhantomData,
        }
        .build()?;
        let cancel_pub = PublisherBuilder::<CancelMessage> {
            topic: super::cancel_topic(&self.action_name),
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            _phantom: PhantomData,
        }
        .build()?;
        let status_sub = SubscriberBuilder::<StatusArrayMessage> {
            topic: super::status_topic(&self.action_name),
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            _phantom: PhantomData,
        }
        .build()?;
        let result_sub = SubscriberBuilder::<ResultMessage<A>> {
            topic: super::result_topic(&self.action_name),
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            _phantom: PhantomData,
        }
        .build()?;
        let feedback_sub = SubscriberBuilder::<FeedbackMessage<A>> {
            topic: super::feedback_topic(&self.action_name),
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            _phantom: PhantomData,
        }
        .build()?;

        let table = Arc::new(Mutex::new(GoalTable::<A>::new()));
        let status_queue = Arc::new(AsyncQueue::new(
            self.config.status_queue_depth,
            OverflowPolicy::Block,
        ));
        let result_queue = Arc::new(AsyncQueue::new(
            self.config.result_queue_depth,
            OverflowPolicy::Block,
        ));
        // Feedback is best-effort: losing stale progress is acceptable,
        // stalling the transport is not.
        let feedback_queue = Arc::new(AsyncQueue::new(
            self.config.feedback_queue_depth,
            OverflowPolicy::DropOldest,
        ));
        let shutdown = CancellationToken::new();

        tokio::spawn(driver::forward(
            status_sub,
            status_queue.clone(),
            shutdown.clone(),
            StatusEvent::Array,
        ));
        tokio::spawn(driver::forward(
            result_sub,
            result_queue.clone(),
            shutdown.clone(),
            std::convert::identity,
        ));
        tokio::spawn(driver::forward(
            feedback_sub,
            feedback_queue.clone(),
            shutdown.clone(),
            std::convert::identity,
        ));
        tokio::spawn(driver::run_client_loop(driver::ClientLoopCtx {
            table: table.clone(),
            status_queue: status_queue.clone(),
            result_queue,
            feedback_queue,
            lost_check_period: self.config.lost_check_period,
            shutdown: shutdown.clone(),
        }));

        debug!(
            "[CLIENT] ready: action={} caller={}",
            self.action_name, self.caller_id
        );
        Ok(ActionClient {
            inner: Arc::new(ClientInner {
                action_name: self.action_name,
                caller_id: self.caller_id,
                goal_pub,
                cancel_pub,
                table,
                status_queue,
                negotiation_window: self.config.negotiation_window,
                shutdown,
            }),
        })
    }
}

pub(crate) struct ClientInner<A: Action> {
    action_name: String,
    caller_id: String,
    goal_pub: Publisher<GoalMessage<A>>,
    cancel_pub: Publisher<CancelMessage>,
    table: Arc<Mutex<GoalTable<A>>>,
    status_queue: Arc<AsyncQueue<StatusEvent>>,
    negotiation_window: Duration,
    shutdown: CancellationToken,
}

impl<A: Action> Drop for ClientInner<A> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Client half of the action protocol for one action name.
pub struct ActionClient<A: Action> {
    inner: Arc<ClientInner<A>>,
}

impl<A: Action> Clone for ActionClient<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Action> ActionClient<A> {
    pub fn action_name(&self) -> &str {
        &self.inner.action_name
    }

    /// Publishes a goal and registers a handle in `WaitingForGoalAck`.
    ///
    /// Returns immediately; acknowledgment is implicit via the first status
    /// broadcast containing the goal id. `on_transition` fires exactly once
    /// per distinct state the handle reaches, including Lost.
    pub fn send_goal(
        &self,
        goal: A::Goal,
        on_transition: impl Fn(&ClientGoalHandle<A>) + Send + Sync + 'static,
        on_feedback: impl Fn(&ClientGoalHandle<A>, &A::Feedback) + Send + Sync + 'static,
    ) -> Result<ClientGoalHandle<A>> {
        let goal_id = GoalId::generate(&self.inner.caller_id);
        let entry = GoalEntry::new(
            goal_id.clone(),
            goal.clone(),
            Arc::new(on_transition),
            Arc::new(on_feedback),
            self.inner.negotiation_window,
        );
        self.inner
            .table
            .lock()
            .insert(goal_id.id.clone(), entry.clone());

        let msg = GoalMessage {
            header: Header::new(self.inner.goal_pub.next_seq()),
            goal_id: goal_id.clone(),
            goal,
        };
        if let Err(e) = self.inner.goal_pub.publish(&msg) {
            self.inner.table.lock().remove(&goal_id.id);
            return Err(e);
        }
        debug!("[CLIENT] sent goal {}", goal_id.id);

        Ok(ClientGoalHandle {
            entry,
            table: Arc::downgrade(&self.inner.table),
        })
    }

    /// Requests cancellation of one tracked goal.
    ///
    /// Valid while the handle is in WaitingForGoalAck, Pending, Active, or
    /// WaitingForCancelAck; a logged no-op otherwise. The local state change
    /// to WaitingForCancelAck is routed through the dispatch loop so the
    /// loop stays the only writer of handle state.
    pub fn cancel(&self, handle: &ClientGoalHandle<A>) -> Result<()> {
        let comm = handle.comm_state();
        if !matches!(
            comm,
            CommState::WaitingForGoalAck
                | CommState::Pending
                | CommState::Active
                | CommState::WaitingForCancelAck
        ) {
            warn!(
                "[CLIENT] cancel ignored for goal {} in state {}",
                handle.entry.goal_id.id, comm
            );
            return Ok(());
        }

        self.inner.cancel_pub.publish(&CancelMessage {
            goal_id: handle.entry.goal_id.clone(),
        })?;
        if !self
            .inner
            .status_queue
            .try_enqueue(StatusEvent::CancelSent(handle.entry.goal_id.id.clone()))
        {
            // The next status broadcast still disambiguates the goal into
            // Recalling or Preempting; only the intermediate
            // WaitingForCancelAck observation is skipped.
            warn!(
                "[CLIENT] status queue refused cancel event for goal {}",
                handle.entry.goal_id.id
            );
        }
        Ok(())
    }

    /// Requests cancellation of every goal the server tracks.
    pub fn cancel_all_goals(&self) -> Result<()> {
        self.inner.cancel_pub.publish(&CancelMessage {
            goal_id: GoalId::none(),
        })
    }

    /// Requests cancellation of every goal sent at or before `stamp`.
    pub fn cancel_goals_at_and_before(&self, stamp: crate::msg::Stamp) -> Result<()> {
        self.inner.cancel_pub.publish(&CancelMessage {
            goal_id: GoalId {
                stamp,
                id: String::new(),
            },
        })
    }

    /// Number of goals currently tracked (not yet released).
    pub fn tracked_goals(&self) -> usize {
        self.inner.table.lock().len()
    }
}
