use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

use wampbench::activity::{ActivityKind, ActivityLog, ActivityLogError, DEFAULT_RETAINED};
use wampbench::wamp::config::BenchSettings;
use wampbench::wamp::transport::LoopbackTransport;
use wampbench::wamp::{InboundMessage, Realm, ScheduleSpec, SessionError, SessionState};
use wampbench::{PublishRequest, PublishTarget, Workbench};

fn realm(name: &str) -> Realm {
    Realm::new(name, "ws://h/ws").unwrap()
}

fn bench(router: &LoopbackTransport) -> (Workbench, ActivityLog) {
    let activity = ActivityLog::new();
    let workbench = Workbench::new(
        Arc::new(router.clone()),
        activity.clone(),
        BenchSettings::default(),
    );
    (workbench, activity)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn publish_without_session_has_no_side_effects() {
    let router = LoopbackTransport::new();
    let (workbench, activity) = bench(&router);

    let result = workbench
        .publish("R1", "t1", json!({"a": 1}), &ScheduleSpec::Immediate)
        .await;

    assert!(matches!(result, Err(SessionError::NoActiveSession)));
    assert!(activity.is_empty());
    assert!(router.publications().is_empty());
}

#[tokio::test]
async fn immediate_publish_is_recorded_and_sent() {
    let router = LoopbackTransport::new();
    let (workbench, activity) = bench(&router);

    let status = workbench.start_publisher(&realm("R1")).await.unwrap();
    assert_eq!(status.borrow().state, SessionState::Joined);

    let delay = workbench
        .publish("R1", "t1", json!({"a": 1}), &ScheduleSpec::Immediate)
        .await
        .unwrap();
    assert_eq!(delay, 0);

    eventually("publication", || router.publications().len() == 1).await;
    let publication = &router.publications()[0];
    assert_eq!(publication.realm, "R1");
    assert_eq!(publication.topic, "t1");
    assert_eq!(publication.payload, json!({"a": 1}));

    let publishes: Vec<_> = activity
        .entries()
        .into_iter()
        .filter(|r| r.kind == ActivityKind::Publish)
        .collect();
    assert_eq!(publishes.len(), 1);
    assert_eq!(publishes[0].realm, "R1");
    assert_eq!(publishes[0].topic, "t1");
    assert_eq!(publishes[0].payload_text, r#"{"a":1}"#);

    eventually("sent counter", || status.borrow().messages_sent == 1).await;
    workbench.shutdown().await.unwrap();
}

#[tokio::test]
async fn subscriber_callback_runs_once_per_delivery() {
    let router = LoopbackTransport::new();
    let (workbench, activity) = bench(&router);

    let seen: Arc<Mutex<Vec<InboundMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let topics = vec!["t1".to_string(), "t2".to_string()];
    workbench
        .start_subscriber(&realm("R1"), &topics, move |message: InboundMessage| {
            sink.lock().unwrap().push(message);
        })
        .await
        .unwrap();

    assert_eq!(router.inject("R1", "t2", json!({"v": 1})), 1);
    eventually("callback", || seen.lock().unwrap().len() == 1).await;
    sleep(Duration::from_millis(50)).await;
    workbench.stop_subscriber().await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].realm, "R1");
    assert_eq!(seen[0].topic, "t2");
    assert_eq!(seen[0].payload, json!({"args": [], "kwargs": {"v": 1}}));

    let kinds: Vec<ActivityKind> = activity.entries().into_iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        [
            ActivityKind::Connect,
            ActivityKind::Subscribe,
            ActivityKind::Subscribe,
            ActivityKind::Receive,
            ActivityKind::Disconnect
        ]
    );
}

#[tokio::test]
async fn per_topic_order_is_kept() {
    let router = LoopbackTransport::new();
    let (workbench, _) = bench(&router);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    workbench
        .start_subscriber(&realm("R1"), &["t1".to_string()], move |m: InboundMessage| {
            sink.lock().unwrap().push(m.payload["args"][0].clone());
        })
        .await
        .unwrap();

    for i in 0..100 {
        router.inject("R1", "t1", json!(i));
    }
    workbench.stop_subscriber().await.unwrap();

    let expected: Vec<Value> = (0..100).map(|i| json!(i)).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
}

#[tokio::test]
async fn replacing_a_session_closes_the_previous_one_first() {
    let router = LoopbackTransport::new();
    let (workbench, _) = bench(&router);

    let first = workbench.start_publisher(&realm("R1")).await.unwrap();
    assert_eq!(router.joined_sessions("R1"), 1);

    let second = workbench.start_publisher(&realm("R2")).await.unwrap();
    assert_eq!(first.borrow().state, SessionState::Closed);
    assert_eq!(second.borrow().state, SessionState::Joined);
    assert_eq!(router.joined_sessions("R1"), 0);
    assert_eq!(router.joined_sessions("R2"), 1);

    assert!(matches!(
        workbench
            .publish("R1", "t1", json!(1), &ScheduleSpec::Immediate)
            .await,
        Err(SessionError::RealmMismatch { .. })
    ));
    workbench.shutdown().await.unwrap();
}

#[tokio::test]
async fn replaced_subscriber_stops_receiving() {
    let router = LoopbackTransport::new();
    let (workbench, _) = bench(&router);
    let topics = vec!["t1".to_string()];

    let first_hits = Arc::new(Mutex::new(0usize));
    let hits = first_hits.clone();
    workbench
        .start_subscriber(&realm("R1"), &topics, move |_: InboundMessage| {
            *hits.lock().unwrap() += 1;
        })
        .await
        .unwrap();
    workbench
        .start_subscriber(&realm("R2"), &topics, |_: InboundMessage| {})
        .await
        .unwrap();

    assert_eq!(router.inject("R1", "t1", json!("late")), 0);
    assert_eq!(*first_hits.lock().unwrap(), 0);
    workbench.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_starts_leave_one_session_joined() {
    let router = LoopbackTransport::new();
    let (workbench, _) = bench(&router);
    let workbench = Arc::new(workbench);

    let starts: Vec<_> = ["R1", "R2", "R3", "R4"]
        .into_iter()
        .map(|name| {
            let workbench = workbench.clone();
            tokio::spawn(async move { workbench.start_publisher(&realm(name)).await })
        })
        .collect();
    for start in starts {
        start.await.unwrap().unwrap();
    }

    let joined: usize = ["R1", "R2", "R3", "R4"]
        .iter()
        .map(|name| router.joined_sessions(name))
        .sum();
    assert_eq!(joined, 1);
    workbench.shutdown().await.unwrap();
}

#[tokio::test]
async fn connect_failure_is_reported_and_leaves_no_session() {
    let router = LoopbackTransport::new();
    router.refuse_realm("nope");
    let (workbench, activity) = bench(&router);

    let result = workbench.start_publisher(&realm("nope")).await;
    match result {
        Err(SessionError::ConnectFailed(reason)) => assert!(reason.contains("no_such_realm")),
        other => panic!("expected ConnectFailed, got {:?}", other.map(|_| ())),
    }
    assert_eq!(workbench.publisher_state().await, None);
    assert!(matches!(
        workbench
            .publish("nope", "t1", json!(1), &ScheduleSpec::Immediate)
            .await,
        Err(SessionError::NoActiveSession)
    ));
    assert!(activity.is_empty());
}

#[tokio::test]
async fn stop_is_idempotent() {
    let router = LoopbackTransport::new();
    let (workbench, _) = bench(&router);

    workbench.start_publisher(&realm("R1")).await.unwrap();
    workbench.stop_publisher().await.unwrap();
    workbench.stop_publisher().await.unwrap();
    assert_eq!(workbench.publisher_state().await, None);
    assert_eq!(router.joined_sessions("R1"), 0);
}

#[tokio::test]
async fn stop_drops_pending_delayed_publish() {
    let router = LoopbackTransport::new();
    let (workbench, _) = bench(&router);
    workbench.start_publisher(&realm("R1")).await.unwrap();

    let delay = workbench
        .publish(
            "R1",
            "t1",
            json!("later"),
            &ScheduleSpec::parse("duration", "00:00:01").unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(delay, 1);

    workbench.stop_publisher().await.unwrap();
    sleep(Duration::from_millis(1300)).await;
    assert!(router.publications().is_empty());
}

#[tokio::test]
async fn batch_publish_reports_each_target() {
    let router = LoopbackTransport::new();
    let (workbench, _) = bench(&router);
    workbench.start_publisher(&realm("R1")).await.unwrap();

    let targets = [
        PublishTarget::new("R1", "t1"),
        PublishTarget::new("R1", "t2"),
        PublishTarget::new("R2", "t1"),
    ];
    let results = workbench
        .publish_batch(&targets, json!({"all": true}), &ScheduleSpec::Immediate)
        .await;

    assert_eq!(results.len(), 3);
    assert!(results[0].1.is_ok());
    assert!(results[1].1.is_ok());
    assert!(matches!(
        results[2].1,
        Err(SessionError::RealmMismatch { .. })
    ));

    eventually("two publications", || router.publications().len() == 2).await;
    workbench.shutdown().await.unwrap();
}

#[tokio::test]
async fn router_loss_is_observable() {
    let router = LoopbackTransport::new();
    let (workbench, _) = bench(&router);
    let status = workbench.start_publisher(&realm("R1")).await.unwrap();

    router.disconnect_all("router restart");
    eventually("closed state", || status.borrow().state == SessionState::Closed).await;
    assert!(matches!(
        workbench
            .publish("R1", "t1", json!(1), &ScheduleSpec::Immediate)
            .await,
        Err(SessionError::NoActiveSession)
    ));

    // A new start replaces the dead session.
    workbench.start_publisher(&realm("R1")).await.unwrap();
    assert_eq!(router.joined_sessions("R1"), 1);
    workbench.shutdown().await.unwrap();
}

#[tokio::test]
async fn audit_trail_gets_one_line_per_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("log.txt");
    let router = LoopbackTransport::new();
    let (activity, worker) = ActivityLog::with_audit_file(&path, DEFAULT_RETAINED);
    let workbench = Workbench::new(
        Arc::new(router.clone()),
        activity.clone(),
        BenchSettings::default(),
    );

    workbench.start_publisher(&realm("R1")).await.unwrap();
    workbench
        .publish("R1", "t1", json!({"a": 1}), &ScheduleSpec::Immediate)
        .await
        .unwrap();
    workbench.shutdown().await.unwrap();

    drop(workbench);
    drop(activity);
    worker.await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("| publisher | connect | R1 |"));
    assert!(lines[1].ends_with(r#"| publisher | publish | R1 | t1 | {"a":1}"#));
    assert!(lines[2].contains("| publisher | disconnect | R1 |"));
}

#[tokio::test]
async fn unavailable_audit_sink_does_not_fail_publish() {
    let dir = tempfile::tempdir().unwrap();
    let router = LoopbackTransport::new();
    // A directory cannot be opened for appending.
    let (activity, _worker) = ActivityLog::with_audit_file(dir.path(), DEFAULT_RETAINED);
    let mut errors = activity.errors();
    let workbench = Workbench::new(
        Arc::new(router.clone()),
        activity.clone(),
        BenchSettings::default(),
    );

    workbench.start_publisher(&realm("R1")).await.unwrap();
    let result = workbench
        .publish("R1", "t1", json!({"a": 1}), &ScheduleSpec::Immediate)
        .await;
    assert!(result.is_ok());

    let error = timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(error, ActivityLogError::LogSinkUnavailable(_)));

    eventually("publication", || router.publications().len() == 1).await;
    assert_eq!(activity.len(), 2);
    workbench.shutdown().await.unwrap();
}

#[tokio::test]
async fn submitted_request_defaults_to_immediate() {
    let router = LoopbackTransport::new();
    let (workbench, _) = bench(&router);
    workbench.start_publisher(&realm("R1")).await.unwrap();

    let request: PublishRequest =
        serde_json::from_value(json!({"realm": "R1", "topic": "t9", "payload": [1, 2]})).unwrap();
    assert_eq!(request.schedule, ScheduleSpec::Immediate);
    assert_eq!(workbench.submit(request).await.unwrap(), 0);

    eventually("publication", || router.publications().len() == 1).await;
    assert_eq!(router.publications()[0].payload, json!([1, 2]));
    workbench.shutdown().await.unwrap();
}
