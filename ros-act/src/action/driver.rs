//! Dispatch loops for both protocol sides.
//!
//! Transport delivery callbacks hand messages to per-endpoint forward
//! tasks, which enqueue into bounded [`AsyncQueue`]s; one dispatch loop per
//! entity drains those queues and is the only writer of per-goal state.
//! Cross-goal ordering is not guaranteed, per-queue FIFO is.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::msg::WireMessage;
use crate::pubsub::Subscriber;
use crate::queue::{AsyncQueue, QueueError};

use super::client::{ClientGoalHandle, CommState, GoalEntry, GoalTable, next_comm_state};
use super::messages::{CancelMessage, FeedbackMessage, GoalMessage, ResultMessage, StatusArrayMessage};
use super::server::{ServerGoalHandle, ServerInner};
use super::{Action, GoalStatus, StatusCode};

/// Events drained by the client dispatch loop from the status queue.
pub(crate) enum StatusEvent {
    /// A status broadcast from the transport.
    Array(StatusArrayMessage),
    /// A locally issued cancel; moves the goal to WaitingForCancelAck.
    CancelSent(String),
}

/// Events drained by the server driver loop.
pub(crate) enum ServerEvent<A: Action> {
    Goal(GoalMessage<A>),
    Cancel(CancelMessage),
}

/// Moves messages from a subscriber channel into a bounded queue,
/// suspending for backpressure without ever blocking a delivery thread.
pub(crate) async fn forward<M, E>(
    sub: Subscriber<M>,
    queue: Arc<AsyncQueue<E>>,
    shutdown: CancellationToken,
    map: fn(M) -> E,
) where
    M: WireMessage,
    E: Send + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = sub.rx.recv_async() => match res {
                Ok(msg) => {
                    if queue.enqueue(map(msg), &shutdown).await.is_err() {
                        break;
                    }
                }
                Err(_) => {
                    // Transport side gone: let the consumer drain and stop.
                    queue.complete();
                    break;
                }
            },
        }
    }
    trace!("[FWD] forward task for {} stopped", sub.topic());
}

pub(crate) struct ClientLoopCtx<A: Action> {
    pub(crate) table: Arc<Mutex<GoalTable<A>>>,
    pub(crate) status_queue: Arc<AsyncQueue<StatusEvent>>,
    pub(crate) result_queue: Arc<AsyncQueue<ResultMessage<A>>>,
    pub(crate) feedback_queue: Arc<AsyncQueue<FeedbackMessage<A>>>,
    pub(crate) lost_check_period: Duration,
    pub(crate) shutdown: CancellationToken,
}

/// Single consumer of the client's three queues. Applies every event to
/// the matching goal entry and runs the negotiation-deadline sweep.
pub(crate) async fn run_client_loop<A: Action>(ctx: ClientLoopCtx<A>) {
    debug!("[CLIENT] dispatch loop started");
    let mut lost_timer = time::interval(ctx.lost_check_period);
    lost_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = lost_timer.tick() => check_deadlines(&ctx.table),
            res = ctx.status_queue.dequeue(&ctx.shutdown) => match res {
                Ok(StatusEvent::Array(msg)) => apply_status_array(&ctx.table, &msg),
                Ok(StatusEvent::CancelSent(id)) => apply_cancel_sent(&ctx.table, &id),
                Err(QueueError::Faulted(reason)) => {
                    fail_all_goals(&ctx.table, &reason);
                    break;
                }
                Err(_) => break,
            },
            res = ctx.result_queue.dequeue(&ctx.shutdown) => match res {
                Ok(msg) => apply_result(&ctx.table, msg),
                Err(QueueError::Faulted(reason)) => {
                    fail_all_goals(&ctx.table, &reason);
                    break;
                }
                Err(_) => break,
            },
            res = ctx.feedback_queue.dequeue(&ctx.shutdown) => match res {
                Ok(msg) => apply_feedback(&ctx.table, &msg),
                Err(QueueError::Faulted(reason)) => {
                    fail_all_goals(&ctx.table, &reason);
                    break;
                }
                Err(_) => break,
            },
        }
    }
    debug!("[CLIENT] dispatch loop stopped");
}

fn lookup<A: Action>(table: &Arc<Mutex<GoalTable<A>>>, id: &str) -> Option<Arc<GoalEntry<A>>> {
    table.lock().get(id).cloned()
}

fn fire_transition<A: Action>(table: &Arc<Mutex<GoalTable<A>>>, entry: &Arc<GoalEntry<A>>) {
    let handle = ClientGoalHandle {
        entry: entry.clone(),
        table: Arc::downgrade(table),
    };
    (entry.on_transition)(&handle);
}

pub(crate) fn apply_status_array<A: Action>(
    table: &Arc<Mutex<GoalTable<A>>>,
    msg: &StatusArrayMessage,
) {
    for status in &msg.status_list {
        // Entries for goals this client never sent share the topic.
        let Some(entry) = lookup(table, &status.goal_id.id) else {
            continue;
        };
        apply_status(table, &entry, status);
    }
}

/// Merges one status observation into an entry.
///
/// Duplicates and stale observations are absorbed by the rank filter; an
/// accepted observation drives the transition table, and the transition
/// callback fires only when the resulting state is new.
pub(crate) fn apply_status<A: Action>(
    table: &Arc<Mutex<GoalTable<A>>>,
    entry: &Arc<GoalEntry<A>>,
    status: &GoalStatus,
) {
    let fire = {
        let mut st = entry.state.lock();
        if st.comm.is_terminal() {
            return;
        }
        st.acked = true;
        if let Some(prev) = &st.latest_status {
            if status.status.rank() <= prev.status.rank() {
                return;
            }
        }
        st.latest_status = Some(status.clone());
        match next_comm_state(st.comm, status.status) {
            Some(next) if next != st.comm => {
                trace!(
                    "[CLIENT] goal {}: {} -> {} on {}",
                    status.goal_id.id, st.comm, next, status.status
                );
                st.comm = next;
                true
            }
            Some(_) => false,
            None => {
                warn!(
                    "[CLIENT] protocol violation: goal {} observed {} in state {}",
                    status.goal_id.id, status.status, st.comm
                );
                st.comm = CommState::Lost;
                true
            }
        }
    };
    if fire {
        fire_transition(table, entry);
    }
}

pub(crate) fn apply_cancel_sent<A: Action>(table: &Arc<Mutex<GoalTable<A>>>, id: &str) {
    let Some(entry) = lookup(table, id) else {
        return;
    };
    let fire = {
        let mut st = entry.state.lock();
        match st.comm {
            CommState::WaitingForGoalAck | CommState::Pending | CommState::Active => {
                st.comm = CommState::WaitingForCancelAck;
                true
            }
            // The status stream already moved the goal past the point
            // where the cancel ack matters.
            _ => false,
        }
    };
    if fire {
        fire_transition(table, &entry);
    }
}

/// A result may legitimately race ahead of the final status broadcast: its
/// embedded status is merged first, then the handle is forced to Done.
pub(crate) fn apply_result<A: Action>(table: &Arc<Mutex<GoalTable<A>>>, msg: ResultMessage<A>) {
    let Some(entry) = lookup(table, &msg.status.goal_id.id) else {
        trace!("[CLIENT] result for untracked goal {}", msg.status.goal_id.id);
        return;
    };
    let fire = {
        let mut st = entry.state.lock();
        if st.comm.is_terminal() {
            return;
        }
        st.acked = true;
        let fresher = st
            .latest_status
            .as_ref()
            .is_none_or(|prev| msg.status.status.rank() > prev.status.rank());
        if fresher {
            st.latest_status = Some(msg.status.clone());
        }
        st.latest_result = Some(msg.result);
        st.comm = CommState::Done;
        true
    };
    if fire {
        fire_transition(table, &entry);
    }
}

pub(crate) fn apply_feedback<A: Action>(
    table: &Arc<Mutex<GoalTable<A>>>,
    msg: &FeedbackMessage<A>,
) {
    let Some(entry) = lookup(table, &msg.status.goal_id.id) else {
        return;
    };
    {
        let mut st = entry.state.lock();
        if st.comm.is_terminal() {
            return;
        }
        st.acked = true;
        st.latest_feedback = Some(msg.feedback.clone());
    }
    let handle = ClientGoalHandle {
        entry: entry.clone(),
        table: Arc::downgrade(table),
    };
    (entry.on_feedback)(&handle, &msg.feedback);
}

/// Moves unacked goals past their negotiation deadline to Lost, once.
pub(crate) fn check_deadlines<A: Action>(table: &Arc<Mutex<GoalTable<A>>>) {
    let now = std::time::Instant::now();
    let entries: Vec<Arc<GoalEntry<A>>> = table.lock().values().cloned().collect();
    for entry in entries {
        let fire = {
            let mut st = entry.state.lock();
            if st.acked || st.comm.is_terminal() || now < st.deadline {
                false
            } else {
                st.comm = CommState::Lost;
                st.latest_status = Some(GoalStatus::with_text(
                    entry.goal_id.clone(),
                    StatusCode::Lost,
                    "no status received within the negotiation window",
                ));
                true
            }
        };
        if fire {
            warn!("[CLIENT] goal {} lost: no status observed", entry.goal_id.id);
            fire_transition(table, &entry);
        }
    }
}

/// Terminal queue fault: every non-terminal goal is surfaced as Lost
/// through its transition callback.
pub(crate) fn fail_all_goals<A: Action>(table: &Arc<Mutex<GoalTable<A>>>, reason: &str) {
    error!("[CLIENT] queue fault, failing all tracked goals: {reason}");
    let entries: Vec<Arc<GoalEntry<A>>> = table.lock().values().cloned().collect();
    for entry in entries {
        let fire = {
            let mut st = entry.state.lock();
            if st.comm.is_terminal() {
                false
            } else {
                st.comm = CommState::Lost;
                st.latest_status = Some(GoalStatus::with_text(
                    entry.goal_id.clone(),
                    StatusCode::Lost,
                    reason,
                ));
                true
            }
        };
        if fire {
            fire_transition(table, &entry);
        }
    }
}

/// Single consumer of the server's event queue, plus the periodic status
/// broadcast and retention purge.
pub(crate) async fn run_server_loop<A: Action>(
    weak: Weak<ServerInner<A>>,
    queue: Arc<AsyncQueue<ServerEvent<A>>>,
    shutdown: CancellationToken,
    status_period: Duration,
) {
    debug!("[SERVER] driver loop started");
    let mut status_timer = time::interval(status_period);
    status_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = status_timer.tick() => {
                let Some(inner) = weak.upgrade() else { break };
                inner.purge_expired();
                inner.broadcast_status();
            }
            res = queue.dequeue(&shutdown) => {
                let Some(inner) = weak.upgrade() else { break };
                match res {
                    Ok(ServerEvent::Goal(msg)) => handle_goal(&inner, msg),
                    Ok(ServerEvent::Cancel(msg)) => handle_cancel(&inner, &msg),
                    Err(QueueError::Faulted(reason)) => {
                        error!("[SERVER] event queue fault: {reason}");
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
    }
    debug!("[SERVER] driver loop stopped");
}

fn handle_goal<A: Action>(inner: &Arc<ServerInner<A>>, msg: GoalMessage<A>) {
    let Some(handle) = inner.track_goal(msg.goal_id, msg.goal) else {
        return;
    };
    (inner.on_goal)(handle);
}

fn handle_cancel<A: Action>(inner: &Arc<ServerInner<A>>, msg: &CancelMessage) {
    for record in inner.matching_goals(&msg.goal_id) {
        let transitioned = record.begin_cancel();
        if transitioned {
            debug!("[SERVER] goal {} canceling", record.goal_id.id);
            if let Some(on_cancel) = &inner.on_cancel {
                on_cancel(ServerGoalHandle {
                    record: record.clone(),
                    server: Arc::downgrade(inner),
                });
            }
        }
    }
}
