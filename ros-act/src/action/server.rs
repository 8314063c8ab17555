//! Server-side goal tracking, status broadcast, and retention.

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
use crate::{Builder, Error, Result};

use super::driver::{self, ServerEvent};
use super::messages::{
    CancelMessage, FeedbackMessage, GoalMessage, Header, ResultMessage, StatusArrayMessage,
};
use super::{Action, GoalId, GoalStatus, StatusCode};

pub struct ActionServerConfig {
    /// Period of the full status-table broadcast. This is the only channel
    /// by which clients learn of transitions, so it bounds end-to-end
    /// latency of the client state machine.
    pub status_period: Duration,
    /// How long terminal goals stay in the broadcast table before purge,
    /// so slow or late-joining clients still observe the outcome.
    pub retention_window: Duration,
    pub event_queue_depth: usize,
}

impl Default for ActionServerConfig {
    fn default() -> Self {
        Self {
            status_period: Duration::from_millis(200),
            retention_window: Duration::from_secs(5),
            event_queue_depth: 32,
        }
    }
}

pub type GoalCallback<A> = Arc<dyn Fn(ServerGoalHandle<A>) + Send + Sync>;
pub type CancelCallback<A> = Arc<dyn Fn(ServerGoalHandle<A>) + Send + Sync>;

pub struct ActionServerBuilder<A: Action> {
    pub action_name: String,
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<TypeRegistry>,
    pub config: ActionServerConfig,
    on_goal: Option<GoalCallback<A>>,
    on_cancel: Option<CancelCallback<A>>,
    pub _phantom: PhantomData<A>,
}

impl<A: Action> ActionServerBuilder<A> {
    pub fn new(
        action_name: &str,
        transport: Arc<dyn Transport>,
        registry: Arc<TypeRegistry>,
    ) -> Self {
        Self {
            action_name: action_name.to_string(),
            transport,
            registry,
            config: ActionServerConfig::default(),
            on_goal: None,
            on_cancel: None,
            _phantom: PhantomData,
        }
    }

    pub fn with_config(mut self, config: ActionServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Invoked on the driver task for every newly tracked goal. The handle
    /// starts in Pending; the callback (or whoever it hands the handle to)
    /// must move it with `set_accepted`/`set_rejected`/... — acceptance is
    /// never inferred.
    pub fn with_goal_callback(
        mut self,
        on_goal: impl Fn(ServerGoalHandle<A>) + Send + Sync + 'static,
    ) -> Self {
        self.on_goal = Some(Arc::new(on_goal));
        self
    }

    /// Invoked for every goal a cancel request moved into Recalling or
    /// Preempting.
    pub fn with_cancel_callback(
        mut self,
        on_cancel: impl Fn(ServerGoalHandle<A>) + Send + Sync + 'static,
    ) -> Self {
        self.on_cancel = Some(Arc::new(on_cancel));
        self
    }
}

impl<A: Action> Builder for ActionServerBuilder<A> {
    type Output = ActionServer<A>;

    fn build(self) -> Result<Self::Output> {
        let Some(on_goal) = self.on_goal else {
            return Err(Error::Transport(format!(
                "action server {} built without a goal callback",
                self.action_name
            )));
        };

        let goal_sub = SubscriberBuilder::<GoalMessage<A>> {
            topic: super::goal_topic(&self.action_name),
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            _phantom: PhantomData,
        }
        .build()?;
        let cancel_sub = SubscriberBuilder::<CancelMessage> {
            topic: super::cancel_topic(&self.action_name),
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            _phantom: PhantomData,
        }
        .build()?;
        let status_pub = PublisherBuilder::<StatusArrayMessage> {
            topic: super::status_topic(&self.action_name),
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            _phantom: PhantomData,
        }
        .build()?;
        let result_pub = PublisherBuilder::<ResultMessage<A>> {
            topic: super::result_topic(&self.action_name),
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            _phantom: PhantomData,
        }
        .build()?;
        let feedback_pub = PublisherBuilder::<FeedbackMessage<A>> {
            topic: super::feedback_topic(&self.action_name),
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            _phantom: PhantomData,
        }
        .build()?;

        // Goal and cancel messages must not be lost: blocking policy, with
        // the unbounded subscriber channel absorbing delivery bursts.
        let event_queue = Arc::new(AsyncQueue::new(
            self.config.event_queue_depth,
            OverflowPolicy::Block,
        ));
        let shutdown = CancellationToken::new();

        let inner = Arc::new(ServerInner {
            action_name: self.action_name,
            status_pub,
            result_pub,
            feedback_pub,
            goals: Mutex::new(HashMap::new()),
            on_goal,
            on_cancel: self.on_cancel,
            retention_window: self.config.retention_window,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(driver::forward(
            goal_sub,
            event_queue.clone(),
            shutdown.clone(),
            ServerEvent::Goal,
        ));
        tokio::spawn(driver::forward(
            cancel_sub,
            event_queue.clone(),
            shutdown.clone(),
            ServerEvent::Cancel,
        ));
        tokio::spawn(driver::run_server_loop(
            Arc::downgrade(&inner),
            event_queue,
            shutdown,
            self.config.status_period,
        ));

        debug!("[SERVER] ready: action={}", inner.action_name);
        Ok(ActionServer { inner })
    }
}

pub(crate) struct GoalRecord<A: Action> {
    pub(crate) goal_id: GoalId,
    pub(crate) goal: A::Goal,
    pub(crate) state: Mutex<RecordState>,
}

pub(crate) struct RecordState {
    pub(crate) status: StatusCode,
    pub(crate) text: String,
    pub(crate) terminal_at: Option<Instant>,
    pub(crate) purged: bool,
}

impl<A: Action> GoalRecord<A> {
    fn snapshot(&self) -> GoalStatus {
        let st = self.state.lock();
        GoalStatus::with_text(self.goal_id.clone(), st.status, st.text.clone())
    }

    /// Applies the cancel-request rule: Pending goals recall, Active goals
    /// preempt, terminal goals are left alone.
    pub(crate) fn begin_cancel(&self) -> bool {
        let mut st = self.state.lock();
        match st.status {
            StatusCode::Pending => {
                st.status = StatusCode::Recalling;
                true
            }
            StatusCode::Active => {
                st.status = StatusCode::Preempting;
                true
            }
            _ => false,
        }
    }
}

pub(crate) struct ServerInner<A: Action> {
    pub(crate) action_name: String,
    status_pub: Publisher<StatusArrayMessage>,
    result_pub: Publisher<ResultMessage<A>>,
    feedback_pub: Publisher<FeedbackMessage<A>>,
    goals: Mutex<HashMap<String, Arc<GoalRecord<A>>>>,
    pub(crate) on_goal: GoalCallback<A>,
    pub(crate) on_cancel: Option<CancelCallback<A>>,
    retention_window: Duration,
    shutdown: CancellationToken,
}

impl<A: Action> Drop for ServerInner<A> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<A: Action> ServerInner<A> {
    /// Starts tracking a received goal in Pending. Duplicate ids are
    /// dropped; the status broadcast already answers the client's retry.
    pub(crate) fn track_goal(
        self: &Arc<Self>,
        goal_id: GoalId,
        goal: A::Goal,
    ) -> Option<ServerGoalHandle<A>> {
        let mut goals = self.goals.lock();
        if goals.contains_key(&goal_id.id) {
            warn!("[SERVER] duplicate goal {} ignored", goal_id.id);
            return None;
        }
        let record = Arc::new(GoalRecord {
            goal_id: goal_id.clone(),
            goal,
            state: Mutex::new(RecordState {
                status: StatusCode::Pending,
                text: String::new(),
                terminal_at: None,
                purged: false,
            }),
        });
        goals.insert(goal_id.id.clone(), record.clone());
        drop(goals);
        debug!("[SERVER] tracking goal {}", goal_id.id);
        Some(ServerGoalHandle {
            record,
            server: Arc::downgrade(self),
        })
    }

    /// Goals selected by a cancel message: a non-empty id matches that
    /// goal; a non-zero stamp additionally matches every goal sent at or
    /// before it; an empty id with a zero stamp matches everything.
    pub(crate) fn matching_goals(&self, target: &GoalId) -> Vec<Arc<GoalRecord<A>>> {
        let by_id = !target.id.is_empty();
        let by_stamp = !target.stamp.is_zero();
        let cancel_all = !by_id && !by_stamp;
        self.goals
            .lock()
            .values()
            .filter(|record| {
                cancel_all
                    || (by_id && record.goal_id.id == target.id)
                    || (by_stamp && record.goal_id.stamp <= target.stamp)
            })
            .cloned()
            .collect()
    }

    /// Publishes the full status table.
    pub(crate) fn broadcast_status(&self) {
        let status_list: Vec<GoalStatus> = self
            .goals
            .lock()
            .values()
            .map(|record| record.snapshot())
            .collect();
        let msg = StatusArrayMessage {
            header: Header::new(self.status_pub.next_seq()),
            status_list,
        };
        if let Err(e) = self.status_pub.publish(&msg) {
            warn!("[SERVER] status broadcast failed: {e}");
        }
    }

    /// Drops goals that have been terminal for longer than the retention
    /// window; their status stops being broadcast.
    pub(crate) fn purge_expired(&self) {
        let now = Instant::now();
        let window = self.retention_window;
        let mut purged = Vec::new();
        self.goals.lock().retain(|id, record| {
            let mut st = record.state.lock();
            if let Some(terminal_at) = st.terminal_at {
                if now.duration_since(terminal_at) > window {
                    st.purged = true;
                    purged.push(id.clone());
                    return false;
                }
            }
            true
        });
        if !purged.is_empty() {
            debug!("[SERVER] purged {} goals: {:?}", purged.len(), purged);
        }
    }

    pub(crate) fn tracked_goals(&self) -> usize {
        self.goals.lock().len()
    }
}

/// Server half of the action protocol for one action name.
///
/// Dropping the server stops its driver loop and forward tasks.
pub struct ActionServer<A: Action> {
    inner: Arc<ServerInner<A>>,
}

impl<A: Action> ActionServer<A> {
    pub fn action_name(&self) -> &str {
        &self.inner.action_name
    }

    /// Number of goals currently in the broadcast table.
    pub fn tracked_goals(&self) -> usize {
        self.inner.tracked_goals()
    }
}

/// Server-side handle to one tracked goal.
///
/// Status only moves through the explicit `set_*` operations; each returns
/// whether the transition was applied, and anything invalid for the current
/// status is a logged no-op.
pub struct ServerGoalHandle<A: Action> {
    pub(crate) record: Arc<GoalRecord<A>>,
    pub(crate) server: Weak<ServerInner<A>>,
}

impl<A: Action> Clone for ServerGoalHandle<A> {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            server: self.server.clone(),
        }
    }
}

impl<A: Action> ServerGoalHandle<A> {
    pub fn goal_id(&self) -> &GoalId {
        &self.record.goal_id
    }

    pub fn goal(&self) -> &A::Goal {
        &self.record.goal
    }

    pub fn status_code(&self) -> StatusCode {
        self.record.state.lock().status
    }

    /// Current status snapshot, as it would appear in the broadcast table.
    pub fn status(&self) -> GoalStatus {
        self.record.snapshot()
    }

    /// Whether a cancel request moved this goal into Recalling/Preempting.
    pub fn is_cancel_requested(&self) -> bool {
        matches!(
            self.status_code(),
            StatusCode::Recalling | StatusCode::Preempting
        )
    }

    fn try_transition(&self, allowed: &[(StatusCode, StatusCode)], op: &str, text: &str) -> bool {
        let mut st = self.record.state.lock();
        if st.purged {
            warn!("[SERVER] {op} ignored: goal {} purged", self.record.goal_id.id);
            return false;
        }
        for (from, to) in allowed {
            if st.status == *from {
                debug!(
                    "[SERVER] goal {}: {} -> {} ({op})",
                    self.record.goal_id.id, from, to
                );
                st.status = *to;
                st.text = text.to_string();
                if to.is_terminal() {
                    st.terminal_at = Some(Instant::now());
                }
                return true;
            }
        }
        warn!(
            "[SERVER] {op} ignored for goal {} in status {}",
            self.record.goal_id.id, st.status
        );
        false
    }

    /// Pending -> Active; Recalling -> Preempting (the cancel request
    /// arrived first, so execution starts already preempted).
    pub fn set_accepted(&self, text: &str) -> bool {
        self.try_transition(
            &[
                (StatusCode::Pending, StatusCode::Active),
                (StatusCode::Recalling, StatusCode::Preempting),
            ],
            "set_accepted",
            text,
        )
    }

    /// Pending | Recalling -> Rejected.
    pub fn set_rejected(&self, text: &str) -> bool {
        self.try_transition(
            &[
                (StatusCode::Pending, StatusCode::Rejected),
                (StatusCode::Recalling, StatusCode::Rejected),
            ],
            "set_rejected",
            text,
        )
    }

    /// Active | Preempting -> Succeeded.
    pub fn set_succeeded(&self, text: &str) -> bool {
        self.try_transition(
            &[
                (StatusCode::Active, StatusCode::Succeeded),
                (StatusCode::Preempting, StatusCode::Succeeded),
            ],
            "set_succeeded",
            text,
        )
    }

    /// Active | Preempting -> Aborted.
    pub fn set_aborted(&self, text: &str) -> bool {
        self.try_transition(
            &[
                (StatusCode::Active, StatusCode::Aborted),
                (StatusCode::Preempting, StatusCode::Aborted),
            ],
            "set_aborted",
            text,
        )
    }

    /// Pending | Recalling -> Recalled; Active | Preempting -> Preempted.
    pub fn set_canceled(&self, text: &str) -> bool {
        self.try_transition(
            &[
                (StatusCode::Pending, StatusCode::Recalled),
                (StatusCode::Recalling, StatusCode::Recalled),
                (StatusCode::Active, StatusCode::Preempted),
                (StatusCode::Preempting, StatusCode::Preempted),
            ],
            "set_canceled",
            text,
        )
    }

    /// Publishes a feedback message stamped with the current status
    /// snapshot.
    pub fn publish_feedback(&self, feedback: A::Feedback) -> Result<()> {
        let server = self.upgrade()?;
        let msg = FeedbackMessage {
            header: Header::new(server.feedback_pub.next_seq()),
            status: self.status(),
            feedback,
        };
        server.feedback_pub.publish(&msg)
    }

    /// Publishes the terminal payload, stamped with the current status
    /// snapshot.
    pub fn publish_result(&self, result: A::Result) -> Result<()> {
        let server = self.upgrade()?;
        let msg = ResultMessage {
            header: Header::new(server.result_pub.next_seq()),
            status: self.status(),
            result,
        };
        server.result_pub.publish(&msg)
    }

    fn upgrade(&self) -> Result<Arc<ServerInner<A>>> {
        if self.record.state.lock().purged {
            return Err(Error::GoalPurged(self.record.goal_id.id.clone()));
        }
        self.server
            .upgrade()
            .ok_or_else(|| Error::Transport("action server dropped".to_string()))
    }
}
