use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use wampbench::activity::ActivityLog;
use wampbench::wamp::config::BenchSettings;
use wampbench::wamp::transport::{JoinedLink, Transport, TransportEvent, WebSocketTransport};
use wampbench::wamp::error::TransportError;
use wampbench::wamp::{InboundMessage, Realm, ScheduleSpec, SessionError};
use wampbench::Workbench;

const SUBSCRIPTION: u64 = 7;

/// Recorded in the frame list when the client sends a close frame
const CLOSE_MARKER: &str = "close";

type Frames = Arc<Mutex<Vec<Value>>>;

/// How the fake router answers SUBSCRIBE and UNSUBSCRIBE
#[derive(Debug, Clone, Copy, PartialEq)]
enum Behaviour {
    Cooperative,
    SilentOnSubscribe,
    SilentOnUnsubscribe,
    RejectSubscribe,
}

/// Minimal router: welcomes every realm except "nope", acknowledges
/// subscriptions with one event and answers GOODBYE.
async fn fake_router() -> (Url, Frames) {
    fake_router_with(Behaviour::Cooperative).await
}

async fn fake_router_with(behaviour: Behaviour) -> (Url, Frames) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let frames: Frames = Arc::new(Mutex::new(Vec::new()));

    let seen = frames.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, seen.clone(), behaviour));
        }
    });

    let url = Url::parse(&format!("ws://{}/ws", addr)).unwrap();
    (url, frames)
}

async fn serve(stream: TcpStream, frames: Frames, behaviour: Behaviour) {
    let callback = |_request: &Request, mut response: Response| {
        response
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("wamp.2.json"));
        Ok::<Response, ErrorResponse>(response)
    };
    let mut ws = accept_hdr_async(stream, callback).await.unwrap();

    while let Some(Ok(message)) = ws.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => {
                frames.lock().unwrap().push(json!(CLOSE_MARKER));
                break;
            }
            _ => continue,
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        frames.lock().unwrap().push(frame.clone());

        let replies = match frame[0].as_u64().unwrap() {
            1 if frame[1] == "nope" => vec![json!([3, {}, "wamp.error.no_such_realm"])],
            1 => vec![json!([2, 42, {}])],
            32 if behaviour == Behaviour::SilentOnSubscribe => Vec::new(),
            32 if behaviour == Behaviour::RejectSubscribe => {
                vec![json!([8, 32, frame[1], {}, "wamp.error.not_authorized"])]
            }
            34 if behaviour == Behaviour::SilentOnUnsubscribe => Vec::new(),
            32 => vec![
                json!([33, frame[1], SUBSCRIPTION]),
                json!([36, SUBSCRIPTION, 1, {}, [], {"hello": "world"}]),
            ],
            34 => vec![json!([35, frame[1]])],
            6 => vec![json!([6, {}, "wamp.close.goodbye_and_out"])],
            _ => Vec::new(),
        };

        for reply in replies {
            ws.send(Message::Text(reply.to_string().into()))
                .await
                .unwrap();
        }
        if frame[0] == 1 && frame[1] == "nope" {
            break;
        }
    }
}

async fn frames_with_code(frames: &Frames, code: u64) -> Vec<Value> {
    for _ in 0..200 {
        let found: Vec<Value> = frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f[0] == code)
            .cloned()
            .collect();
        if !found.is_empty() {
            return found;
        }
        sleep(Duration::from_millis(10)).await;
    }
    Vec::new()
}

async fn saw_close(frames: &Frames) -> bool {
    for _ in 0..200 {
        if frames.lock().unwrap().contains(&json!(CLOSE_MARKER)) {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn link_speaks_wamp_json() {
    let (url, frames) = fake_router().await;
    let transport = WebSocketTransport::default();

    let JoinedLink {
        mut link,
        mut events,
    } = transport.join("R1", &url).await.unwrap();

    let subscription = link.subscribe("t1").await.unwrap();
    assert_eq!(subscription, SUBSCRIPTION);

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        TransportEvent::Event {
            subscription: SUBSCRIPTION,
            payload: json!({"args": [], "kwargs": {"hello": "world"}}),
        }
    );

    link.publish("t1", &json!({"a": 1})).await.unwrap();
    link.publish("t1", &json!("plain")).await.unwrap();
    link.unsubscribe(subscription).await.unwrap();
    link.leave().await.unwrap();
    link.leave().await.unwrap();

    let hello = frames_with_code(&frames, 1).await;
    assert_eq!(hello[0][1], "R1");

    let publishes = frames_with_code(&frames, 16).await;
    assert_eq!(publishes[0], json!([16, 2, {}, "t1", [], {"a": 1}]));
    assert_eq!(publishes[1], json!([16, 3, {}, "t1", ["plain"], {}]));

    let goodbye = frames_with_code(&frames, 6).await;
    assert_eq!(goodbye[0][2], "wamp.close.normal");

    let closed = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap();
    assert!(matches!(closed, Some(TransportEvent::Closed(_))));
    assert!(saw_close(&frames).await);
}

#[tokio::test]
async fn abort_fails_the_join() {
    let (url, _) = fake_router().await;
    let transport = WebSocketTransport::default();

    let result = transport.join("nope", &url).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn unreachable_router_is_connect_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let workbench = Workbench::new(
        Arc::new(WebSocketTransport::new(Duration::from_secs(2))),
        ActivityLog::new(),
        BenchSettings::default(),
    );
    let realm = Realm::new("R1", &format!("ws://{}/ws", addr)).unwrap();

    assert!(matches!(
        workbench.start_publisher(&realm).await,
        Err(SessionError::ConnectFailed(_))
    ));
}

#[tokio::test]
async fn workbench_round_trip_over_websocket() {
    let (url, frames) = fake_router().await;
    let workbench = Workbench::new(
        Arc::new(WebSocketTransport::default()),
        ActivityLog::new(),
        BenchSettings::default(),
    );
    let realm = Realm::new("R1", url.as_str()).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    workbench
        .start_subscriber(&realm, &["t1".to_string()], move |m: InboundMessage| {
            sink.lock().unwrap().push(m);
        })
        .await
        .unwrap();

    workbench.start_publisher(&realm).await.unwrap();
    workbench
        .publish("R1", "news", json!({"n": 5}), &ScheduleSpec::Immediate)
        .await
        .unwrap();

    let publishes = frames_with_code(&frames, 16).await;
    assert_eq!(publishes[0][3], "news");
    assert_eq!(publishes[0][5], json!({"n": 5}));

    workbench.shutdown().await.unwrap();

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].topic, "t1");
    assert_eq!(received[0].payload["kwargs"]["hello"], "world");
}

fn short_timeouts() -> BenchSettings {
    BenchSettings {
        join_timeout_secs: 1,
        ..BenchSettings::default()
    }
}

#[tokio::test]
async fn silent_subscribe_fails_the_start() {
    let (url, frames) = fake_router_with(Behaviour::SilentOnSubscribe).await;
    let workbench = Workbench::new(
        Arc::new(WebSocketTransport::new(Duration::from_secs(1))),
        ActivityLog::new(),
        short_timeouts(),
    );
    let realm = Realm::new("R1", url.as_str()).unwrap();

    let started = timeout(
        Duration::from_secs(10),
        workbench.start_subscriber(&realm, &["t1".to_string()], |_m: InboundMessage| {}),
    )
    .await
    .expect("start_subscriber must not hang on a silent router");
    assert!(matches!(started, Err(SessionError::ConnectFailed(_))));
    assert_eq!(workbench.subscriber_state().await, None);

    // The role is not wedged: stop returns right away.
    timeout(Duration::from_secs(2), workbench.stop_subscriber())
        .await
        .unwrap()
        .unwrap();
    assert!(!frames_with_code(&frames, 6).await.is_empty());
}

#[tokio::test]
async fn silent_unsubscribe_does_not_block_stop() {
    let (url, frames) = fake_router_with(Behaviour::SilentOnUnsubscribe).await;
    let workbench = Workbench::new(
        Arc::new(WebSocketTransport::new(Duration::from_secs(1))),
        ActivityLog::new(),
        short_timeouts(),
    );
    let realm = Realm::new("R1", url.as_str()).unwrap();

    workbench
        .start_subscriber(&realm, &["t1".to_string()], |_m: InboundMessage| {})
        .await
        .unwrap();

    timeout(Duration::from_secs(10), workbench.stop_subscriber())
        .await
        .expect("stop_subscriber must not hang on a silent router")
        .unwrap();
    assert_eq!(workbench.subscriber_state().await, None);

    assert!(!frames_with_code(&frames, 34).await.is_empty());
    assert!(!frames_with_code(&frames, 6).await.is_empty());
}

#[tokio::test]
async fn unanswered_subscribe_times_out_on_the_link() {
    let (url, _) = fake_router_with(Behaviour::SilentOnSubscribe).await;
    let transport = WebSocketTransport::new(Duration::from_millis(300));

    let JoinedLink { mut link, .. } = transport.join("R1", &url).await.unwrap();
    let result = timeout(Duration::from_secs(5), link.subscribe("t1"))
        .await
        .unwrap();
    assert!(matches!(result, Err(TransportError::Timeout(_))));
}

#[tokio::test]
async fn rejected_subscribe_is_connect_failed() {
    let (url, frames) = fake_router_with(Behaviour::RejectSubscribe).await;
    let workbench = Workbench::new(
        Arc::new(WebSocketTransport::default()),
        ActivityLog::new(),
        BenchSettings::default(),
    );
    let realm = Realm::new("R1", url.as_str()).unwrap();

    let started = workbench
        .start_subscriber(&realm, &["t1".to_string()], |_m: InboundMessage| {})
        .await;
    let reason = match started {
        Err(SessionError::ConnectFailed(reason)) => reason,
        Err(other) => panic!("expected ConnectFailed, got {}", other),
        Ok(_) => panic!("subscriber started against a rejecting router"),
    };
    assert!(reason.contains("rejected"), "{}", reason);
    assert!(reason.contains("wamp.error.not_authorized"), "{}", reason);
    assert!(!reason.contains("Protocol violation"), "{}", reason);

    assert_eq!(workbench.subscriber_state().await, None);
    let goodbye = frames_with_code(&frames, 6).await;
    assert_eq!(goodbye[0][2], "wamp.close.normal");
}

#[tokio::test]
async fn router_error_reply_is_a_rejection() {
    let (url, _) = fake_router_with(Behaviour::RejectSubscribe).await;
    let transport = WebSocketTransport::default();

    let JoinedLink { mut link, .. } = transport.join("R1", &url).await.unwrap();
    match link.subscribe("t1").await {
        Err(TransportError::Rejected(error)) => assert_eq!(error, "wamp.error.not_authorized"),
        other => panic!("expected a rejection, got {:?}", other),
    }
    link.leave().await.unwrap();
}

#[tokio::test]
async fn closed_session_thread_still_closes_the_socket() {
    let (url, frames) = fake_router().await;
    let workbench = Workbench::new(
        Arc::new(WebSocketTransport::default()),
        ActivityLog::new(),
        BenchSettings::default(),
    );
    let realm = Realm::new("R1", url.as_str()).unwrap();

    workbench.start_publisher(&realm).await.unwrap();
    workbench.stop_publisher().await.unwrap();

    // The session runtime is gone by now; the close frame must have been
    // sent from inside it.
    assert!(
        saw_close(&frames).await,
        "router never saw a close frame: {:?}",
        frames.lock().unwrap()
    );
}
