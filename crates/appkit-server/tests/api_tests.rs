//! HTTP-level tests: the router driven with `oneshot`, plus client/server
//! runs over a real TCP listener.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use appkit_client::{ConnectOptions, Payload, SseMessage, SseParser, StreamClient, StreamEnd};
use appkit_server::{create_app, serve, AppState, StreamSource, TickerSource};
use appkit_stream::{Capability, StreamOptions, StreamStatus};
use appkit_types::{BufferConfig, SseErrorCode, StreamConfig};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ticker() -> Capability<Arc<dyn StreamSource>> {
    Capability::Enabled(Arc::new(TickerSource::default()) as Arc<dyn StreamSource>)
}

fn state() -> AppState {
    AppState::new(StreamConfig::default(), ticker()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str, last_event_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(id) = last_event_id {
        builder = builder.header("Last-Event-ID", id);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn decode(response: Response) -> Vec<SseMessage> {
    let text = body_text(response).await;
    let feed = SseParser::default().feed(text.as_bytes());
    assert!(feed.overflow.is_none());
    feed.messages
}

fn ids(messages: &[SseMessage]) -> Vec<String> {
    messages.iter().filter_map(|m| m.id.clone()).collect()
}

async fn wait_for_status(state: &AppState, stream_id: &str, status: StreamStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.manager.status(stream_id) != Some(status) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

// ---------------------------------------------------------------------------
// Router tests
// ---------------------------------------------------------------------------

// 1. Health check
#[tokio::test]
async fn health_returns_ok() {
    let app = create_app(state());
    let response = send(&app, get("/health", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");
}

// 2. POST starts the stream and delivers every event plus completion
#[tokio::test]
async fn post_starts_stream_and_streams_to_completion() {
    let app = create_app(state());
    let response = send(
        &app,
        post("/api/stream/s1", json!({ "payload": { "count": 3, "intervalMs": 1 } })),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert!(headers["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(headers["cache-control"], "no-cache");
    assert_eq!(headers["x-accel-buffering"], "no");

    let messages = decode(response).await;
    assert_eq!(ids(&messages), vec!["1", "2", "3", "4"]);
    let types: Vec<&str> = messages.iter().map(|m| m.event_type()).collect();
    assert_eq!(types, vec!["tick", "tick", "tick", "complete"]);
    let first: Value = serde_json::from_str(&messages[0].data).unwrap();
    assert_eq!(first, json!({ "type": "tick", "n": 1, "count": 3 }));
}

// 3. Resuming a finished stream replays only what came after the resume point
#[tokio::test]
async fn resume_after_completion_replays_tail() {
    let state = state();
    let app = create_app(state.clone());
    let response = send(
        &app,
        post("/api/stream/s1", json!({ "payload": { "count": 3, "intervalMs": 1 } })),
    )
    .await;
    body_text(response).await;
    wait_for_status(&state, "s1", StreamStatus::Completed).await;

    let resumed = decode(send(&app, get("/api/stream/s1", Some("2"))).await).await;
    assert_eq!(ids(&resumed), vec!["3", "4"]);
    assert_eq!(resumed[1].event_type(), "complete");

    let via_query = decode(send(&app, get("/api/stream/s1?lastEventId=3", None)).await).await;
    assert_eq!(ids(&via_query), vec!["4"]);

    let full = decode(send(&app, get("/api/stream/s1", None)).await).await;
    assert_eq!(ids(&full), vec!["1", "2", "3", "4"]);
}

// 4. A lost resume point yields a restart warning, then the retained events
#[tokio::test]
async fn evicted_resume_point_sends_restart_warning() {
    let config = StreamConfig {
        buffer: BufferConfig::new(2, 1024 * 1024),
        ..StreamConfig::default()
    };
    let state = AppState::new(config, ticker()).unwrap();
    let app = create_app(state.clone());
    let response = send(
        &app,
        post("/api/stream/s1", json!({ "payload": { "count": 5, "intervalMs": 1 } })),
    )
    .await;
    drop(response);
    wait_for_status(&state, "s1", StreamStatus::Completed).await;

    let messages = decode(send(&app, get("/api/stream/s1", Some("1"))).await).await;
    assert_eq!(messages[0].event_type(), "warning");
    assert_eq!(messages[0].id, None);
    let warning: Value = serde_json::from_str(&messages[0].data).unwrap();
    assert_eq!(warning["code"], "BUFFER_OVERFLOW_RESTART");
    assert_eq!(ids(&messages), vec!["5", "6"]);
}

// 5. Unknown stream: 404 without a resume point, STREAM_EVICTED event with one
#[tokio::test]
async fn unknown_stream_handling() {
    let app = create_app(state());

    let response = send(&app, get("/api/stream/missing", None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert!(body["error"].as_str().unwrap().contains("not found"));

    let response = send(&app, get("/api/stream/missing", Some("12"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let messages = decode(response).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].event_type(), "error");
    let payload: Value = serde_json::from_str(&messages[0].data).unwrap();
    assert_eq!(payload["code"], "STREAM_EVICTED");

    // POST with a resume point does not start a fresh stream.
    let response = send(&app, post("/api/stream/missing", json!({ "lastEventId": "12" }))).await;
    let messages = decode(response).await;
    assert_eq!(messages[0].event_type(), "error");
}

// 6. Bad requests are JSON 400s
#[tokio::test]
async fn invalid_requests_are_rejected() {
    let app = create_app(state());

    let response = send(&app, post("/api/stream/s1", json!({ "payload": { "bogus": true } }))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["code"], "INVALID_REQUEST");

    let request = Request::builder()
        .method("POST")
        .uri("/api/stream/s2")
        .body(Body::from("{not json"))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// 7. A disabled source cannot start streams
#[tokio::test]
async fn disabled_source_rejects_new_streams() {
    let state = AppState::new(
        StreamConfig::default(),
        Capability::Disabled {
            feature: "demo_source",
        },
    )
    .unwrap();
    let app = create_app(state);
    let response = send(&app, post("/api/stream/s1", json!({}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert!(body["error"].as_str().unwrap().contains("disabled"));
}

// 8. DELETE aborts; later readers see STREAM_ABORTED
#[tokio::test]
async fn delete_aborts_stream() {
    let state = state();
    let app = create_app(state.clone());
    let response = send(
        &app,
        post("/api/stream/slow", json!({ "payload": { "count": 100, "intervalMs": 1000 } })),
    )
    .await;
    drop(response);
    wait_for_status(&state, "slow", StreamStatus::Running).await;

    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/api/stream/slow")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(state.manager.status("slow"), Some(StreamStatus::Aborted));

    let messages = decode(send(&app, get("/api/stream/slow", None)).await).await;
    let last = messages.last().unwrap();
    assert_eq!(last.event_type(), "error");
    let payload: Value = serde_json::from_str(&last.data).unwrap();
    assert_eq!(payload["code"], "STREAM_ABORTED");

    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/api/stream/nope")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// 9. A single-consumer stream ends with its only connection; the request
//    operation lives exactly as long as the response
#[tokio::test]
async fn single_consumer_aborts_on_disconnect() {
    let state = state();
    let app = create_app(state.clone());
    let response = send(
        &app,
        post(
            "/api/stream/solo",
            json!({ "singleConsumer": true, "payload": { "count": 100, "intervalMs": 1000 } }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.operations.len(), 1);
    assert_eq!(state.manager.client_count("solo"), Some(1));

    drop(response);
    assert_eq!(state.manager.status("solo"), Some(StreamStatus::Aborted));
    assert!(state.operations.is_empty());
}

// 10. A plain disconnect leaves the generator running
#[tokio::test]
async fn disconnect_keeps_shared_stream_running() {
    let state = state();
    let app = create_app(state.clone());
    let response = send(
        &app,
        post("/api/stream/shared", json!({ "payload": { "count": 100, "intervalMs": 1000 } })),
    )
    .await;
    drop(response);
    wait_for_status(&state, "shared", StreamStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(state.manager.status("shared"), Some(StreamStatus::Running));
    assert_eq!(state.manager.client_count("shared"), Some(0));
}

// 11. Stream listing
#[tokio::test]
async fn list_streams() {
    let state = state();
    let app = create_app(state.clone());
    for id in ["b", "a"] {
        let response = send(
            &app,
            post(
                &format!("/api/stream/{id}"),
                json!({ "payload": { "count": 100, "intervalMs": 1000 } }),
            ),
        )
        .await;
        drop(response);
        wait_for_status(&state, id, StreamStatus::Running).await;
    }

    let response = send(&app, get("/api/streams", None)).await;
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(
        body,
        json!([
            { "id": "a", "status": "running", "clients": 0 },
            { "id": "b", "status": "running", "clients": 0 },
        ])
    );
}

// 12. An open connection keeps its stream from looking least recently used
#[tokio::test(start_paused = true)]
async fn watched_stream_survives_lru_eviction() {
    let config = StreamConfig {
        max_active_streams: 2,
        heartbeat_interval: Duration::from_secs(1),
        ..StreamConfig::default()
    };
    let state = AppState::new(config, ticker()).unwrap();
    let app = create_app(state.clone());

    let watching = send(
        &app,
        post(
            "/api/stream/watched",
            json!({ "payload": { "count": 5, "intervalMs": 600000 } }),
        ),
    )
    .await;
    assert_eq!(watching.status(), StatusCode::OK);
    state
        .manager
        .start_stream(
            StreamOptions::with_id("idle"),
            futures::stream::pending::<appkit_types::Result<Value>>(),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    state
        .manager
        .start_stream(
            StreamOptions::with_id("newest"),
            futures::stream::pending::<appkit_types::Result<Value>>(),
        )
        .unwrap();

    assert_eq!(
        state.manager.stream_ids(),
        vec!["newest".to_string(), "watched".to_string()]
    );
    drop(watching);
}

// ---------------------------------------------------------------------------
// Client and server over TCP
// ---------------------------------------------------------------------------

struct Running {
    base: String,
    state: AppState,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<appkit_types::Result<()>>,
}

impl Running {
    async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let state = state();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, state.clone(), async move {
            let _ = stopped.await;
        }));
        Self {
            base,
            state,
            stop: Some(stop),
            task,
        }
    }

    fn url(&self, stream_id: &str) -> String {
        format!("{}/api/stream/{stream_id}", self.base)
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

// 13. A client that leaves mid-stream resumes exactly after its last event
#[tokio::test]
async fn client_resumes_over_tcp_without_duplicates() {
    let server = Running::start().await;

    let cancel = CancellationToken::new();
    let mut first = Vec::new();
    let summary = StreamClient::new()
        .connect(
            ConnectOptions::new(server.url("job"))
                .payload(Payload::Json(json!({ "payload": { "count": 6, "intervalMs": 20 } }))),
            |m| {
                first.push(m.id.clone().unwrap_or_default());
                if first.len() == 3 {
                    cancel.cancel();
                }
            },
            |e| panic!("unexpected error: {e}"),
            cancel.clone(),
        )
        .await
        .unwrap();
    assert_eq!(summary.end, StreamEnd::Cancelled);
    assert_eq!(summary.last_event_id.as_deref(), Some("3"));
    assert_eq!(first, vec!["1", "2", "3"]);

    let mut second = Vec::new();
    let summary = StreamClient::new()
        .connect(
            ConnectOptions::new(server.url("job")).last_event_id("3"),
            |m| second.push(m.id.unwrap_or_default()),
            |e| panic!("unexpected error: {e}"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(summary.end, StreamEnd::Completed);
    assert_eq!(second, vec!["4", "5", "6", "7"]);

    server.stop().await;
}

// 14. Shutdown delivers STREAM_ABORTED to open connections
#[tokio::test]
async fn shutdown_ends_open_streams() {
    let server = Running::start().await;
    let state = server.state.clone();
    let url = server.url("long");

    let received = Arc::new(AtomicUsize::new(0));
    let client = {
        let received = received.clone();
        tokio::spawn(async move {
            StreamClient::new()
                .connect(
                    ConnectOptions::new(url)
                        .payload(Payload::Json(
                            json!({ "payload": { "count": 1000, "intervalMs": 1000 } }),
                        ))
                        .max_retries(0),
                    move |_| {
                        received.fetch_add(1, Ordering::SeqCst);
                    },
                    |_| {},
                    CancellationToken::new(),
                )
                .await
        })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while received.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(state.manager.client_count("long"), Some(1));

    server.stop().await;
    let summary = tokio::time::timeout(Duration::from_secs(5), client)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match summary.end {
        StreamEnd::Failed(payload) => assert_eq!(payload.code, SseErrorCode::StreamAborted),
        other => panic!("unexpected end: {other:?}"),
    }
    assert!(state.manager.is_empty());
    assert!(state.operations.is_empty());
}
