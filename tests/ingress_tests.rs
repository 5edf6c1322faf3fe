//--------------------------------------------------------------------------------------------------
// TEST MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module contains integration tests for the HTTP ingress.
// It drives the router directly and verifies validation, queueing, overload
// behavior, and end-to-end delivery through the dispatcher.
//--------------------------------------------------------------------------------------------------

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use hyper::Response;
use parking_lot::Mutex;
use serde_json::{Value, from_slice, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use event_connector::{
    ConnectionState, Dispatcher, Event, EventHandler, EventQueue, HandlerRegistry, HandlerResult,
    OverflowPolicy, OverloadPolicy, ShutdownMode,
    ingress::{self, IngressState},
};

/// Handler that records every event it receives
struct RecordingHandler {
    seen: Arc<Mutex<Vec<Event>>>,
}

#[async_trait::async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: Event) -> HandlerResult<()> {
        self.seen.lock().push(event);
        Ok(())
    }
}

/// Sets up a test router over a fresh queue.
/// Returns the router and the queue so tests can inspect it directly.
fn setup_test_router(capacity: usize, overload_policy: OverloadPolicy) -> (Router, Arc<EventQueue>) {
    let queue = Arc::new(EventQueue::new(capacity, OverflowPolicy::DropOldest));
    let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
    // The sender side is dropped; the receiver keeps serving the last value
    let state = Arc::new(IngressState {
        queue: Arc::clone(&queue),
        overload_policy,
        connection: state_rx,
    });
    (ingress::router(state, "/events"), queue)
}

/// Helper to parse JSON responses
async fn parse_json_response(response: Response<Body>) -> Value {
    let body_bytes = to_bytes(response.into_body(), 1024 * 1024) // 1MB limit
        .await
        .unwrap();
    from_slice(&body_bytes).unwrap()
}

fn post_event(body: &Value) -> Request<Body> {
    Request::post("/events")
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_valid_event_is_accepted_and_enqueued() {
    let (app, queue) = setup_test_router(8, OverloadPolicy::Accept);

    let response = app
        .clone()
        .oneshot(post_event(&json!({
            "type": "sensor.reading",
            "payload": {"value": 42},
            "correlationId": "req-7"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = parse_json_response(response).await;
    assert_eq!(body["status"], "accepted");

    assert_eq!(queue.len(), 1);
    let event = queue.try_pop().unwrap();
    assert_eq!(event.event_type, "sensor.reading");
    assert_eq!(event.payload, json!({"value": 42}));
    assert_eq!(event.correlation_id.as_deref(), Some("req-7"));
}

#[tokio::test]
async fn test_malformed_body_is_rejected_without_enqueueing() {
    let (app, queue) = setup_test_router(8, OverloadPolicy::Accept);

    // Not JSON at all
    let response = app
        .clone()
        .oneshot(
            Request::post("/events")
                .header("Content-Type", "application/json")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.status().is_client_error());

    // Missing the type field
    let response = app
        .clone()
        .oneshot(post_event(&json!({"payload": {}})))
        .await
        .unwrap();
    assert!(response.status().is_client_error());

    // Blank type
    let response = app
        .clone()
        .oneshot(post_event(&json!({"type": "  ", "payload": {}})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = parse_json_response(response).await;
    assert_eq!(body["error"]["code"], 400);

    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_missing_payload_is_rejected() {
    let (app, queue) = setup_test_router(8, OverloadPolicy::Accept);

    let response = app
        .clone()
        .oneshot(post_event(&json!({"type": "sensor.reading"})))
        .await
        .unwrap();

    assert!(response.status().is_client_error());
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_reject_policy_returns_429_when_queue_is_full() {
    let (app, queue) = setup_test_router(2, OverloadPolicy::Reject);

    for i in 0..2 {
        let response = app
            .clone()
            .oneshot(post_event(&json!({"type": "fill", "payload": {"n": i}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let response = app
        .clone()
        .oneshot(post_event(&json!({"type": "overflow", "payload": {}})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = parse_json_response(response).await;
    assert_eq!(body["error"]["code"], 429);

    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn test_accept_policy_acknowledges_despite_displacement() {
    let (app, queue) = setup_test_router(2, OverloadPolicy::Accept);

    for i in 0..3 {
        let response = app
            .clone()
            .oneshot(post_event(&json!({"type": format!("e{}", i), "payload": {}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    // The oldest event was displaced; the newest two remain
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.dropped_count(), 1);
    assert_eq!(queue.try_pop().unwrap().event_type, "e1");
    assert_eq!(queue.try_pop().unwrap().event_type, "e2");
}

#[tokio::test]
async fn test_health_endpoint_reports_queue_and_connection() {
    let (app, queue) = setup_test_router(8, OverloadPolicy::Accept);
    queue
        .push(Event::new(
            "x",
            json!({}),
            event_connector::EventSource::Http,
        ))
        .await;

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_json_response(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connection"], "connected");
    assert_eq!(body["queued"], 1);
    assert_eq!(body["dropped"], 0);
}

#[tokio::test]
async fn test_concurrent_sources_lose_nothing_within_capacity() {
    let (app, queue) = setup_test_router(64, OverloadPolicy::Accept);

    let registry = Arc::new(HandlerRegistry::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    registry.register(
        "mixed",
        Arc::new(RecordingHandler {
            seen: Arc::clone(&seen),
        }),
    );

    let token = CancellationToken::new();
    let handle = Dispatcher::new(Arc::clone(&queue), Arc::clone(&registry))
        .with_poll_interval(Duration::from_millis(10))
        .with_shutdown(
            token.clone(),
            Arc::new(Mutex::new(Duration::from_secs(2))),
            ShutdownMode::Drain,
        )
        .spawn();

    // One producer feeding the queue directly, one going through the router
    let direct = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            for i in 0..16 {
                queue
                    .push(Event::new(
                        "mixed",
                        json!({"direct": i}),
                        event_connector::EventSource::Broker,
                    ))
                    .await;
            }
        })
    };
    let posted = {
        let app = app.clone();
        tokio::spawn(async move {
            for i in 0..16 {
                let response = app
                    .clone()
                    .oneshot(post_event(&json!({"type": "mixed", "payload": {"http": i}})))
                    .await
                    .unwrap();
                assert_eq!(response.status(), StatusCode::ACCEPTED);
            }
        })
    };
    direct.await.unwrap();
    posted.await.unwrap();

    token.cancel();
    handle.await.unwrap();

    // All 32 events were delivered exactly once, none dropped
    assert_eq!(seen.lock().len(), 32);
    assert_eq!(queue.dropped_count(), 0);
}

#[tokio::test]
async fn test_ingested_events_reach_registered_handlers() {
    let (app, queue) = setup_test_router(64, OverloadPolicy::Accept);

    let registry = Arc::new(HandlerRegistry::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    registry.register(
        "order.created",
        Arc::new(RecordingHandler {
            seen: Arc::clone(&seen),
        }),
    );

    let token = CancellationToken::new();
    let handle = Dispatcher::new(Arc::clone(&queue), Arc::clone(&registry))
        .with_poll_interval(Duration::from_millis(10))
        .with_shutdown(
            token.clone(),
            Arc::new(Mutex::new(Duration::from_millis(200))),
            ShutdownMode::Drain,
        )
        .spawn();

    for i in 0..10 {
        let response = app
            .clone()
            .oneshot(post_event(
                &json!({"type": "order.created", "payload": {"n": i}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    token.cancel();
    handle.await.unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 10);
    for (i, event) in seen.iter().enumerate() {
        assert_eq!(event.payload["n"], i);
        assert_eq!(event.source, event_connector::EventSource::Http);
    }
}
