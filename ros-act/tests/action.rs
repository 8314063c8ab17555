// End-to-end action protocol scenarios over the in-process bus.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use ros_act::action::client::{ActionClientBuilder, ActionClientConfig, CommState};
use ros_act::action::server::{ActionServerBuilder, ActionServerConfig, ServerGoalHandle};
use ros_act::action::{GoalStatus, StatusCode, register_action_types, status_topic};
use ros_act::action::messages::{Header, StatusArrayMessage};
use ros_act::msg::Stamp;
use ros_act::pubsub::PublisherBuilder;
use ros_act::registry::TypeRegistry;
use ros_act::transport::LocalBus;
use ros_act::{Builder, define_action};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestGoal {
    pub order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub value: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFeedback {
    pub progress: i32,
}

pub struct TestAction;

define_action! {
    TestAction,
    action_name: "/test_action",
    Goal: TestGoal,
    Result: TestResult,
    Feedback: TestFeedback,
}

fn setup() -> (Arc<TypeRegistry>, Arc<LocalBus>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let registry = Arc::new(TypeRegistry::new());
    register_action_types::<TestAction>(&registry);
    let bus = LocalBus::new(registry.clone());
    (registry, bus)
}

fn fast_server_config() -> ActionServerConfig {
    ActionServerConfig {
        status_period: Duration::from_millis(50),
        retention_window: Duration::from_secs(1),
        event_queue_depth: 32,
    }
}

#[derive(Default)]
struct Recorder {
    transitions: Mutex<Vec<CommState>>,
    feedbacks: Mutex<Vec<i32>>,
}

async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_goal_succeeds_end_to_end() {
    let (registry, bus) = setup();

    let _server = ActionServerBuilder::<TestAction>::new("/test_action", bus.clone(), registry.clone())
        .with_config(fast_server_config())
        .with_goal_callback(|handle: ServerGoalHandle<TestAction>| {
            // Accept synchronously so Pending is never broadcast.
            assert!(handle.set_accepted("started"));
            tokio::spawn(async move {
                // Let at least one broadcast carry Active first.
                tokio::time::sleep(Duration::from_millis(120)).await;
                assert!(handle.set_succeeded("done"));
                handle.publish_result(TestResult { value: 123 }).unwrap();
            });
        })
        .build()
        .unwrap();

    let client =
        ActionClientBuilder::<TestAction>::new("/test_action", "/succeed_client", bus, registry)
            .build()
            .unwrap();

    let rec = Arc::new(Recorder::default());
    let on_transition = {
        let rec = rec.clone();
        move |h: &ros_act::action::client::ClientGoalHandle<TestAction>| {
            rec.transitions.lock().push(h.comm_state());
        }
    };
    let on_feedback = {
        let rec = rec.clone();
        move |_: &ros_act::action::client::ClientGoalHandle<TestAction>, fb: &TestFeedback| {
            rec.feedbacks.lock().push(fb.progress);
        }
    };
    let handle = client
        .send_goal(TestGoal { order: 1 }, on_transition, on_feedback)
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            rec.transitions.lock().last() == Some(&CommState::Done)
        })
        .await
    );
    assert_eq!(
        rec.transitions.lock().clone(),
        vec![CommState::Active, CommState::Done]
    );
    assert_eq!(handle.latest_result().map(|r| r.value), Some(123));
    assert_eq!(
        handle.latest_status().map(|s| s.status),
        Some(StatusCode::Succeeded)
    );

    // Handles are only removed by explicit release.
    assert_eq!(client.tracked_goals(), 1);
    handle.release();
    assert_eq!(client.tracked_goals(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_before_ack_recalls_goal() {
    let (registry, bus) = setup();

    let server_config = ActionServerConfig {
        status_period: Duration::from_millis(80),
        ..fast_server_config()
    };
    let _server = ActionServerBuilder::<TestAction>::new("/test_action", bus.clone(), registry.clone())
        .with_config(server_config)
        // Leave the goal Pending; only the cancel path moves it.
        .with_goal_callback(|_handle: ServerGoalHandle<TestAction>| {})
        .with_cancel_callback(|handle: ServerGoalHandle<TestAction>| {
            assert_eq!(handle.status_code(), StatusCode::Recalling);
            tokio::spawn(async move {
                // Hold each phase across broadcasts so the client observes
                // Recalling, then Recalled, then the result.
                tokio::time::sleep(Duration::from_millis(200)).await;
                assert!(handle.set_canceled("recalled"));
                tokio::time::sleep(Duration::from_millis(200)).await;
                handle.publish_result(TestResult { value: 0 }).unwrap();
            });
        })
        .build()
        .unwrap();

    let client =
        ActionClientBuilder::<TestAction>::new("/test_action", "/recall_client", bus, registry)
            .build()
            .unwrap();

    let rec = Arc::new(Recorder::default());
    let on_transition = {
        let rec = rec.clone();
        move |h: &ros_act::action::client::ClientGoalHandle<TestAction>| {
            rec.transitions.lock().push(h.comm_state());
        }
    };
    let handle = client
        .send_goal(TestGoal { order: 2 }, on_transition, |_, _: &TestFeedback| {})
        .unwrap();

    // Let the goal reach the server, then cancel before any status
    // referencing it was broadcast.
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.cancel(&handle).unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            rec.transitions.lock().last() == Some(&CommState::Done)
        })
        .await
    );
    assert_eq!(
        rec.transitions.lock().clone(),
        vec![
            CommState::WaitingForCancelAck,
            CommState::Recalling,
            CommState::WaitingForResult,
            CommState::Done
        ]
    );
    assert_eq!(
        handle.latest_status().map(|s| s.status),
        Some(StatusCode::Recalled)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_feedback_interleaves_with_status() {
    let (registry, bus) = setup();

    let _server = ActionServerBuilder::<TestAction>::new("/test_action", bus.clone(), registry.clone())
        .with_config(fast_server_config())
        .with_goal_callback(|handle: ServerGoalHandle<TestAction>| {
            assert!(handle.set_accepted(""));
            handle.publish_feedback(TestFeedback { progress: 10 }).unwrap();
            handle.publish_feedback(TestFeedback { progress: 20 }).unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                assert!(handle.set_succeeded(""));
                handle.publish_result(TestResult { value: 7 }).unwrap();
            });
        })
        .build()
        .unwrap();

    let client =
        ActionClientBuilder::<TestAction>::new("/test_action", "/feedback_client", bus, registry)
            .build()
            .unwrap();

    let rec = Arc::new(Recorder::default());
    let on_transition = {
        let rec = rec.clone();
        move |h: &ros_act::action::client::ClientGoalHandle<TestAction>| {
            rec.transitions.lock().push(h.comm_state());
        }
    };
    let on_feedback = {
        let rec = rec.clone();
        move |_: &ros_act::action::client::ClientGoalHandle<TestAction>, fb: &TestFeedback| {
            rec.feedbacks.lock().push(fb.progress);
        }
    };
    let handle = client
        .send_goal(TestGoal { order: 3 }, on_transition, on_feedback)
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            rec.transitions.lock().last() == Some(&CommState::Done)
        })
        .await
    );

    // Both feedback callbacks fired, in order, and never moved the state.
    assert_eq!(rec.feedbacks.lock().clone(), vec![10, 20]);
    assert_eq!(
        rec.transitions.lock().clone(),
        vec![CommState::Active, CommState::Done]
    );
    assert_eq!(handle.latest_feedback().map(|f| f.progress), Some(20));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unanswered_goal_goes_lost_once() {
    let (registry, bus) = setup();

    // No server: nothing ever references the goal.
    let client_config = ActionClientConfig {
        negotiation_window: Duration::from_millis(150),
        lost_check_period: Duration::from_millis(25),
        ..ActionClientConfig::default()
    };
    let client = ActionClientBuilder::<TestAction>::new(
        "/test_action",
        "/lost_client",
        bus.clone(),
        registry.clone(),
    )
    .with_config(client_config)
    .build()
    .unwrap();

    let rec = Arc::new(Recorder::default());
    let on_transition = {
        let rec = rec.clone();
        move |h: &ros_act::action::client::ClientGoalHandle<TestAction>| {
            rec.transitions.lock().push(h.comm_state());
        }
    };
    let handle = client
        .send_goal(TestGoal { order: 4 }, on_transition, |_, _: &TestFeedback| {})
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            handle.comm_state() == CommState::Lost
        })
        .await
    );
    assert_eq!(rec.transitions.lock().clone(), vec![CommState::Lost]);
    assert_eq!(
        handle.latest_status().map(|s| s.status),
        Some(StatusCode::Lost)
    );

    // A delayed status arriving after Lost must change nothing.
    let status_pub = PublisherBuilder::<StatusArrayMessage> {
        topic: status_topic("/test_action"),
        transport: bus,
        registry,
        _phantom: std::marker::PhantomData,
    }
    .build()
    .unwrap();
    status_pub
        .publish(&StatusArrayMessage {
            header: Header::new(0),
            status_list: vec![GoalStatus::new(handle.goal_id().clone(), StatusCode::Active)],
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.comm_state(), CommState::Lost);
    assert_eq!(rec.transitions.lock().clone(), vec![CommState::Lost]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_before_stamp_recalls_everything_and_purges() {
    let (registry, bus) = setup();

    let server_config = ActionServerConfig {
        status_period: Duration::from_millis(50),
        retention_window: Duration::from_millis(300),
        event_queue_depth: 32,
    };
    let server = ActionServerBuilder::<TestAction>::new("/test_action", bus.clone(), registry.clone())
        .with_config(server_config)
        .with_goal_callback(|_handle: ServerGoalHandle<TestAction>| {})
        .with_cancel_callback(|handle: ServerGoalHandle<TestAction>| {
            assert!(handle.set_canceled("bulk recall"));
        })
        .build()
        .unwrap();

    let client =
        ActionClientBuilder::<TestAction>::new("/test_action", "/bulk_client", bus, registry)
            .build()
            .unwrap();

    let first = client
        .send_goal(TestGoal { order: 5 }, |_| {}, |_, _: &TestFeedback| {})
        .unwrap();
    let second = client
        .send_goal(TestGoal { order: 6 }, |_| {}, |_, _: &TestFeedback| {})
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || server.tracked_goals() == 2).await);

    client.cancel_goals_at_and_before(Stamp::now()).unwrap();

    // Both goals recall, both clients converge on WaitingForResult with a
    // Recalled status, and the server purges them after retention.
    for handle in [&first, &second] {
        assert!(
            wait_until(Duration::from_secs(2), || {
                handle.comm_state() == CommState::WaitingForResult
            })
            .await
        );
        assert_eq!(
            handle.latest_status().map(|s| s.status),
            Some(StatusCode::Recalled)
        );
    }
    assert!(wait_until(Duration::from_secs(2), || server.tracked_goals() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_goal_completes_with_result() {
    let (registry, bus) = setup();

    let _server = ActionServerBuilder::<TestAction>::new("/test_action", bus.clone(), registry.clone())
        .with_config(fast_server_config())
        .with_goal_callback(|handle: ServerGoalHandle<TestAction>| {
            assert!(handle.set_rejected("busy"));
            // A second terminal move is a no-op.
            assert!(!handle.set_accepted(""));
            handle.publish_result(TestResult { value: -1 }).unwrap();
        })
        .build()
        .unwrap();

    let client =
        ActionClientBuilder::<TestAction>::new("/test_action", "/reject_client", bus, registry)
            .build()
            .unwrap();

    let rec = Arc::new(Recorder::default());
    let on_transition = {
        let rec = rec.clone();
        move |h: &ros_act::action::client::ClientGoalHandle<TestAction>| {
            rec.transitions.lock().push(h.comm_state());
        }
    };
    let handle = client
        .send_goal(TestGoal { order: 7 }, on_transition, |_, _: &TestFeedback| {})
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            rec.transitions.lock().last() == Some(&CommState::Done)
        })
        .await
    );
    assert_eq!(
        handle.latest_status().map(|s| s.status),
        Some(StatusCode::Rejected)
    );
    assert_eq!(handle.latest_result().map(|r| r.value), Some(-1));
}
