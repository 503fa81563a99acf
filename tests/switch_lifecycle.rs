//! Integration tests for the switch listening lifecycle.
//!
//! These tests validate listener start/stop semantics: single-socket
//! enforcement, idempotent teardown, subscription closure, and restart.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test switch_lifecycle -- --nocapture

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Once;
use std::time::Duration;

use serde_json::json;
use teleswitch::{ListenOutcome, Switch, derive_identity};
use tokio::time::timeout;

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Initialize tracing for tests.
/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("debug")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(48000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn switch_addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().expect("valid address")
}

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Single-listener enforcement
// ============================================================================

#[tokio::test]
async fn started_then_already_listening() {
    init_tracing();
    let port = next_port();
    let other_port = next_port();

    let switch = Switch::new("b");
    assert_eq!(
        switch.start_listening(port).await.expect("start failed"),
        ListenOutcome::Started
    );
    assert_eq!(
        switch
            .start_listening(other_port)
            .await
            .expect("second start failed"),
        ListenOutcome::AlreadyListening
    );

    // The original socket is untouched and no second one was bound.
    assert_eq!(switch.listening_port().await, port);
    assert!(
        tokio::net::UdpSocket::bind(("0.0.0.0", other_port))
            .await
            .is_ok(),
        "second start must not bind a socket"
    );

    switch.stop_listening().await;
}

#[tokio::test]
async fn cloned_handles_share_one_listener() {
    init_tracing();
    let port = next_port();

    let switch = Switch::new("b");
    let clone = switch.clone();

    assert_eq!(
        switch.start_listening(port).await.expect("start failed"),
        ListenOutcome::Started
    );
    assert_eq!(
        clone
            .start_listening(next_port())
            .await
            .expect("start via clone failed"),
        ListenOutcome::AlreadyListening
    );

    clone.stop_listening().await;
    assert!(!switch.is_listening().await);
}

#[tokio::test]
async fn ephemeral_port_resolved() {
    init_tracing();

    let switch = Switch::new("b");
    assert_eq!(switch.listening_port().await, 0);

    switch.start_listening(0).await.expect("start failed");
    let port = switch.listening_port().await;
    assert_ne!(port, 0, "port 0 must resolve to the kernel-assigned port");

    // The resolved port is the one datagrams actually reach.
    let mut telexes = switch.subscribe().await;
    let sender = Switch::new("a");
    sender
        .send(r#"{"msg":"hi"}"#, switch_addr(port))
        .await
        .expect("send failed");
    let received = timeout(TEST_TIMEOUT, telexes.recv())
        .await
        .expect("timed out waiting for telex")
        .expect("stream closed early");
    assert_eq!(received.telex.payload().get("msg"), Some(&json!("hi")));

    switch.stop_listening().await;
    assert_eq!(switch.listening_port().await, 0);
}

// ============================================================================
// Teardown semantics
// ============================================================================

#[tokio::test]
async fn stop_is_idempotent() {
    init_tracing();
    let port = next_port();

    let switch = Switch::new("b");
    switch.stop_listening().await; // never started: no-op

    switch.start_listening(port).await.expect("start failed");
    switch.stop_listening().await;
    switch.stop_listening().await; // second stop: no-op

    assert!(!switch.is_listening().await);
    assert!(
        tokio::net::UdpSocket::bind(("0.0.0.0", port)).await.is_ok(),
        "port must be released after stop"
    );
}

#[tokio::test]
async fn subscriptions_end_after_stop() {
    init_tracing();
    let port = next_port();

    let switch = Switch::new("b");
    switch.start_listening(port).await.expect("start failed");
    let mut telexes = switch.subscribe().await;

    switch.stop_listening().await;

    let outcome = timeout(TEST_TIMEOUT, telexes.recv())
        .await
        .expect("timed out waiting for stream end");
    assert!(outcome.is_none(), "stream must end after stop");
}

#[tokio::test]
async fn no_dispatch_after_stop() {
    init_tracing();
    let port = next_port();

    let switch = Switch::new("b");
    switch.start_listening(port).await.expect("start failed");
    let mut telexes = switch.subscribe().await;

    switch.stop_listening().await;

    // A datagram arriving after the stop is never dispatched.
    let probe = tokio::net::UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("bind failed");
    let _ = probe.send_to(br#"{"+late":"+1"}"#, switch_addr(port)).await;

    let outcome = timeout(TEST_TIMEOUT, telexes.recv())
        .await
        .expect("timed out waiting for stream end");
    assert!(outcome.is_none(), "no telex may arrive after stop");
}

#[tokio::test]
async fn stop_while_datagrams_in_flight() {
    init_tracing();
    let port = next_port();

    let switch = Switch::new("b");
    switch.start_listening(port).await.expect("start failed");
    let mut telexes = switch.subscribe().await;

    let sender = Switch::new("a");
    let target = switch_addr(port);
    let feeder = tokio::spawn(async move {
        for n in 0..200u32 {
            let _ = sender.send(&format!(r#"{{"n":{}}}"#, n), target).await;
        }
    });

    // Let some traffic flow, then stop in the middle of the stream.
    let first = timeout(TEST_TIMEOUT, telexes.recv())
        .await
        .expect("timed out waiting for telex")
        .expect("stream closed early");
    assert!(first.telex.payload().get("n").is_some());

    timeout(TEST_TIMEOUT, switch.stop_listening())
        .await
        .expect("stop must complete while datagrams are in flight");

    // Whatever was dispatched before the stop drains, then the stream ends.
    loop {
        match timeout(TEST_TIMEOUT, telexes.recv())
            .await
            .expect("timed out draining stream")
        {
            Some(_) => continue,
            None => break,
        }
    }

    let _ = feeder.await;
}

// ============================================================================
// Restart and subscriptions
// ============================================================================

#[tokio::test]
async fn restart_after_stop() {
    init_tracing();
    let port_a = next_port();
    let port_b = next_port();

    let switch = Switch::new("b");
    switch.start_listening(port_a).await.expect("start failed");
    let mut old_stream = switch.subscribe().await;
    switch.stop_listening().await;

    let outcome = timeout(TEST_TIMEOUT, old_stream.recv())
        .await
        .expect("timed out waiting for stream end");
    assert!(outcome.is_none(), "old stream ends with the old listener");

    assert_eq!(
        switch.start_listening(port_b).await.expect("restart failed"),
        ListenOutcome::Started
    );
    assert_eq!(switch.listening_port().await, port_b);

    let mut new_stream = switch.subscribe().await;
    let sender = Switch::new("a");
    sender
        .send(r#"{"msg":"again"}"#, switch_addr(port_b))
        .await
        .expect("send failed");

    let received = timeout(TEST_TIMEOUT, new_stream.recv())
        .await
        .expect("timed out waiting for telex")
        .expect("stream closed early");
    assert_eq!(received.telex.payload().get("msg"), Some(&json!("again")));

    switch.stop_listening().await;
}

#[tokio::test]
async fn dropping_one_subscription_keeps_others() {
    init_tracing();
    let port = next_port();

    let switch = Switch::new("b");
    switch.start_listening(port).await.expect("start failed");

    let first = switch.subscribe().await;
    let mut second = switch.subscribe().await;
    drop(first);

    let sender = Switch::new("a");
    sender
        .send(r#"{"msg":"still here"}"#, switch_addr(port))
        .await
        .expect("send failed");

    let received = timeout(TEST_TIMEOUT, second.recv())
        .await
        .expect("timed out waiting for telex")
        .expect("stream closed early");
    assert_eq!(
        received.telex.payload().get("msg"),
        Some(&json!("still here"))
    );

    switch.stop_listening().await;
}

// ============================================================================
// Accessors
// ============================================================================

#[tokio::test]
async fn identity_and_listening_accessors() {
    init_tracing();
    let addr: SocketAddr = "198.51.100.3:42424".parse().expect("valid address");

    let switch = Switch::new(derive_identity(&addr));
    assert_eq!(switch.identity().len(), 40, "identity is 40 hex chars");
    assert!(!switch.is_listening().await);

    let port = next_port();
    switch.start_listening(port).await.expect("start failed");
    assert!(switch.is_listening().await);

    switch.shutdown().await;
    assert!(!switch.is_listening().await);
}
