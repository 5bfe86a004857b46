//! End-to-end scenarios from the protocol's testable-properties list:
//! handshake, message send/receive, and connect rejection, driven straight
//! through the [`Dispatcher`] without a real socket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use engineio::dispatcher::{Dispatched, Environ};
use engineio::{ConnectResult, Dispatcher, EngineError, Packet, ServerConfig};
use http::{HeaderMap, Method};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> ServerConfig {
    ServerConfig {
        ping_interval: Duration::from_millis(200),
        ping_timeout: Duration::from_millis(200),
        monitor_clients: false,
        ..ServerConfig::default()
    }
}

fn get(query: &str) -> Environ {
    Environ {
        method: Method::GET,
        path: "/engine.io/".to_owned(),
        query: Environ::parse_query(query),
        headers: HeaderMap::new(),
        body: bytes::Bytes::new(),
        remote_addr: None,
    }
}

fn post(query: &str, body: &'static str) -> Environ {
    Environ {
        method: Method::POST,
        path: "/engine.io/".to_owned(),
        query: Environ::parse_query(query),
        headers: HeaderMap::new(),
        body: bytes::Bytes::from_static(body.as_bytes()),
        remote_addr: None,
    }
}

fn expect_response(dispatched: Dispatched) -> engineio::DispatchResponse {
    match dispatched {
        Dispatched::Response(response) => response,
        Dispatched::Upgrade { .. } => panic!("expected a plain response, got an upgrade"),
    }
}

/// Pull `sid` out of an encoded OPEN packet body (`0{"sid":"...",...}`).
fn extract_sid(open_body: &str) -> String {
    let json: serde_json::Value = serde_json::from_str(&open_body[1..]).unwrap();
    json["sid"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn handshake_then_send_then_long_poll() {
    init_tracing();
    let dispatcher = Dispatcher::new(test_config());

    let handshake = expect_response(
        dispatcher
            .handle_request(get("EIO=4&transport=polling"))
            .await
            .unwrap(),
    );
    assert_eq!(handshake.status, http::StatusCode::OK);
    let body = String::from_utf8(handshake.body.to_vec()).unwrap();
    assert!(body.starts_with("0{\"sid\":\""));
    assert!(body.contains("\"upgrades\":[\"websocket\"]"));

    let sid = extract_sid(&body);

    dispatcher.send(&sid, Packet::message_text("hi")).await;

    let polled = expect_response(
        dispatcher
            .handle_request(get(&format!("EIO=4&transport=polling&sid={sid}")))
            .await
            .unwrap(),
    );
    assert_eq!(polled.body, bytes::Bytes::from_static(b"4hi"));
}

#[tokio::test]
async fn message_post_invokes_handler() {
    init_tracing();
    let dispatcher = Dispatcher::new(test_config());
    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);

    dispatcher.on_message(move |sid, data| {
        if let engineio::Data::Text(text) = data {
            received_clone.lock().unwrap().push(format!("{sid}:{text}"));
        }
    });

    let handshake = expect_response(
        dispatcher
            .handle_request(get("EIO=4&transport=polling"))
            .await
            .unwrap(),
    );
    let body = String::from_utf8(handshake.body.to_vec()).unwrap();
    let sid = extract_sid(&body);

    let response = expect_response(
        dispatcher
            .handle_request(post(
                &format!("EIO=4&transport=polling&sid={sid}"),
                "4hello",
            ))
            .await
            .unwrap(),
    );
    assert_eq!(response.body, bytes::Bytes::from_static(b"ok"));

    let log = received.lock().unwrap();
    assert_eq!(log.as_slice(), [format!("{sid}:hello")]);
}

#[tokio::test]
async fn rejected_connect_returns_401_and_retains_no_session() {
    init_tracing();
    let dispatcher = Dispatcher::new(test_config());
    dispatcher.on_connect(|_sid, _environ| {
        ConnectResult::Reject(Some(serde_json::json!({"error": "nope"})))
    });

    let err = dispatcher
        .handle_request(get("EIO=4&transport=polling"))
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), http::StatusCode::UNAUTHORIZED);
    match err {
        EngineError::Unauthorized(Some(payload)) => {
            assert_eq!(payload, serde_json::json!({"error": "nope"}));
        }
        other => panic!("expected Unauthorized(Some(_)), got {other:?}"),
    }
    assert!(dispatcher.registry().is_empty());
}

#[tokio::test]
async fn disconnect_without_sid_closes_every_session() {
    init_tracing();
    let dispatcher = Dispatcher::new(test_config());

    for _ in 0..3 {
        dispatcher
            .handle_request(get("EIO=4&transport=polling"))
            .await
            .unwrap();
    }
    assert_eq!(dispatcher.registry().len(), 3);

    dispatcher.disconnect(None).await;
    assert!(dispatcher.registry().is_empty());
}
