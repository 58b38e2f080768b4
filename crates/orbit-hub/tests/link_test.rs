//! Integration tests for the hub link and session against a local WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use orbit_hub::{
    HubConfig, HubLink, HubSession, HubUplink, LinkConfig, LinkState, LinkTarget, NoCallbacks,
    SessionEvent,
};
use orbit_proto::{Measurement, OutboundMessage};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ==================== Helper Functions ====================

/// Address nothing listens on.
async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn fast_link() -> LinkConfig {
    LinkConfig::new()
        .with_retry_delay(Duration::from_millis(20))
        .with_timeout_wait(Duration::from_millis(500))
        .with_open_confirm(Duration::from_millis(50))
        .with_send_retry(Duration::from_millis(50))
}

/// A hub stand-in. Every connection gets `greeting` (if any), the first
/// `close_first` connections are closed cleanly right after, and every text
/// frame received is forwarded to the returned channel.
struct FakeHub {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<String>,
    connections: mpsc::UnboundedReceiver<usize>,
}

impl FakeHub {
    async fn start(greeting: Option<&'static str>, close_first: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frame_tx, received) = mpsc::unbounded_channel();
        let (conn_tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut count = 0;
            while let Ok((stream, _)) = listener.accept().await {
                count += 1;
                let _ = conn_tx.send(count);
                let frame_tx = frame_tx.clone();
                let close_now = count <= close_first;
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    if let Some(greeting) = greeting {
                        ws.send(Message::Text(greeting.into())).await.unwrap();
                    }
                    if close_now {
                        let _ = ws.close(None).await;
                        return;
                    }
                    while let Some(Ok(message)) = ws.next().await {
                        if let Message::Text(text) = message {
                            let _ = frame_tx.send(text.to_string());
                        }
                    }
                });
            }
        });

        Self {
            addr,
            received,
            connections,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/gateway_api/v1.0?gateway_token=test", self.addr)
    }

    async fn next_frame(&mut self) -> String {
        timeout(TEST_TIMEOUT, self.received.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("fake hub stopped")
    }
}

async fn wait_for_state(link: &HubLink, state: LinkState) {
    timeout(TEST_TIMEOUT, async {
        while link.state() != state {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("link never reached expected state");
}

// ==================== HubLink Tests ====================

#[tokio::test]
async fn test_link_is_lazy() {
    let hub = FakeHub::start(None, 0).await;
    let (link, _inbound) = HubLink::spawn(LinkTarget::new(hub.url()), fast_link());

    sleep(Duration::from_millis(100)).await;
    assert_eq!(link.state(), LinkState::Idle);
    link.close();
}

#[tokio::test]
async fn test_link_gives_up_after_max_retries() {
    let addr = closed_addr().await;
    let (link, _inbound) = HubLink::spawn(
        LinkTarget::new(format!("ws://{addr}/gateway_api/v1.0")),
        fast_link().with_max_retries(3),
    );

    link.open();
    wait_for_state(&link, LinkState::Closed).await;

    assert_eq!(link.retry_attempts(), 3);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(link.state(), LinkState::Closed);
}

#[tokio::test]
async fn test_link_delivers_frames_both_ways() {
    let mut hub = FakeHub::start(Some(r#"{"type":"hello"}"#), 0).await;
    let (link, mut inbound) = HubLink::spawn(LinkTarget::new(hub.url()), fast_link());

    link.open();
    let greeting = timeout(TEST_TIMEOUT, inbound.recv()).await.unwrap().unwrap();
    assert_eq!(greeting, r#"{"type":"hello"}"#);
    assert_eq!(link.state(), LinkState::Open);

    link.send("ping".to_string()).unwrap();
    assert_eq!(hub.next_frame().await, "ping");
    link.close();
}

#[tokio::test]
async fn test_send_before_open_connects_and_flushes() {
    let mut hub = FakeHub::start(None, 0).await;
    let (link, _inbound) = HubLink::spawn(LinkTarget::new(hub.url()), fast_link());

    link.send("first".to_string()).unwrap();
    link.send("second".to_string()).unwrap();

    assert_eq!(hub.next_frame().await, "first");
    assert_eq!(hub.next_frame().await, "second");
    assert_eq!(link.pending(), 0);
    link.close();
}

#[tokio::test]
async fn test_clean_close_reconnects_without_counting() {
    let mut hub = FakeHub::start(None, 1).await;
    let (link, _inbound) = HubLink::spawn(
        LinkTarget::new(hub.url()),
        fast_link().with_max_retries(1),
    );

    link.open();
    for expected in 1..=2 {
        let n = timeout(TEST_TIMEOUT, hub.connections.recv()).await.unwrap().unwrap();
        assert_eq!(n, expected);
    }

    wait_for_state(&link, LinkState::Open).await;
    assert_eq!(link.retry_attempts(), 0);
    link.close();
}

#[tokio::test]
async fn test_link_pending_cap() {
    let addr = closed_addr().await;
    let (link, _inbound) = HubLink::spawn(
        LinkTarget::new(format!("ws://{addr}")),
        fast_link().with_max_retries(0).with_max_pending(2),
    );

    link.send("a".to_string()).unwrap();
    link.send("b".to_string()).unwrap();
    assert!(link.send("c".to_string()).is_err());
    link.close();
}

// ==================== HubSession Tests ====================

#[tokio::test]
async fn test_session_holds_traffic_until_hello() {
    let mut hub = FakeHub::start(Some(r#"{"type":"hello","hello":{}}"#), 0).await;
    let config = HubConfig::new(hub.addr.to_string(), "test")
        .with_insecure(true)
        .with_link(fast_link());
    let session = HubSession::new(config, Arc::new(NoCallbacks));
    let mut events = session.subscribe();

    session
        .transmit(&OutboundMessage::measurements(vec![Measurement::new("A", "b", "c", 5)]))
        .unwrap();
    assert_eq!(session.pending(), 1);

    session.connect().unwrap();

    let event = timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, SessionEvent::Hello(_)));

    let frame: serde_json::Value = serde_json::from_str(&hub.next_frame().await).unwrap();
    assert_eq!(frame["type"], "measurements");
    assert_eq!(frame["measurements"][0]["metric"], "c");
    assert!(frame["measurements"][0]["timestamp"].is_i64());

    session.close();
}
