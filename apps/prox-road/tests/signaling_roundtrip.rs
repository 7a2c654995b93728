use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use prox_road::liveness::LivenessConfig;
use prox_road::AppState;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn start(liveness: LivenessConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(None);
        let (tx, rx) = oneshot::channel::<()>();
        let serve_state = state.clone();
        tokio::spawn(async move {
            let _ = prox_road::serve(listener, serve_state, liveness, async {
                let _ = rx.await;
            })
            .await;
        });
        Self {
            addr,
            state,
            shutdown: Some(tx),
        }
    }

    async fn connect(&self) -> Ws {
        let (ws, _) = connect_async(format!("ws://{}/ws", self.addr))
            .await
            .unwrap();
        ws
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv_text(ws: &mut Ws, wait: Duration) -> Option<String> {
    timeout(wait, async {
        while let Some(message) = ws.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

async fn recv(ws: &mut Ws) -> Value {
    let text = recv_text(ws, Duration::from_secs(5))
        .await
        .expect("expected a frame");
    serde_json::from_str(&text).unwrap()
}

async fn join(ws: &mut Ws, key: &str) -> String {
    send(ws, json!({"type": "JOIN", "publicKey": key})).await;
    let peers = recv(ws).await;
    assert_eq!(peers["type"], "PEERS");
    peers["sessionId"].as_str().unwrap().to_string()
}

#[test_timeout::tokio_timeout_test(30)]
async fn offer_is_relayed_verbatim_between_identities() {
    let server = TestServer::start(LivenessConfig::default()).await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    join(&mut b, "B").await;
    send(&mut a, json!({"type": "JOIN", "publicKey": "A"})).await;
    let peers = recv(&mut a).await;
    assert_eq!(peers["peers"], json!(["B"]));

    let announced = recv(&mut b).await;
    assert_eq!(announced["type"], "JOIN");
    assert_eq!(announced["publicKey"], "A");

    let offer = json!({
        "type": "SIGNAL",
        "toPublicKey": "B",
        "from": "A",
        "signal": {"type": "offer", "sdp": "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n"}
    })
    .to_string();
    a.send(Message::Text(offer.clone())).await.unwrap();
    let relayed = recv_text(&mut b, Duration::from_secs(5)).await.unwrap();
    assert_eq!(relayed, offer);

    send(&mut b, json!({"type": "LIST"})).await;
    assert_eq!(recv(&mut b).await["peers"], json!(["A"]));
}

#[test_timeout::tokio_timeout_test(30)]
async fn session_token_pins_delivery_to_one_device() {
    let server = TestServer::start(LivenessConfig::default()).await;
    let mut a = server.connect().await;
    let mut b1 = server.connect().await;
    let mut b2 = server.connect().await;

    join(&mut a, "A").await;
    let b1_session = join(&mut b1, "B").await;
    recv(&mut a).await;
    join(&mut b2, "B").await;
    recv(&mut a).await;
    recv(&mut b1).await;

    send(
        &mut a,
        json!({
            "type": "SIGNAL",
            "toPublicKey": "B",
            "toSessionId": b1_session,
            "from": "A",
            "signal": {"type": "candidate", "candidate": "c1", "sdpMid": "0", "sdpMLineIndex": 0}
        }),
    )
    .await;
    assert_eq!(recv(&mut b1).await["signal"]["candidate"], "c1");
    assert!(recv_text(&mut b2, Duration::from_millis(300)).await.is_none());

    send(
        &mut a,
        json!({
            "type": "SIGNAL",
            "toPublicKey": "B",
            "from": "A",
            "signal": {"type": "candidate", "candidate": "c2"}
        }),
    )
    .await;
    assert_eq!(recv(&mut b1).await["signal"]["candidate"], "c2");
    assert_eq!(recv(&mut b2).await["signal"]["candidate"], "c2");
}

#[test_timeout::tokio_timeout_test(30)]
async fn closing_a_socket_announces_leave() {
    let server = TestServer::start(LivenessConfig::default()).await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    join(&mut a, "A").await;
    let b_session = join(&mut b, "B").await;
    recv(&mut a).await;

    b.close(None).await.unwrap();
    drop(b);

    let leave = recv(&mut a).await;
    assert_eq!(
        leave,
        json!({"type": "LEAVE", "publicKey": "B", "sessionId": b_session})
    );
    assert!(server.state.registry.sessions_for("B").is_empty());
}

#[test_timeout::tokio_timeout_test(30)]
async fn malformed_frames_leave_the_connection_open() {
    let server = TestServer::start(LivenessConfig::default()).await;
    let mut a = server.connect().await;
    join(&mut a, "A").await;

    a.send(Message::Text("{{{".into())).await.unwrap();
    send(&mut a, json!({"type": "SIGNAL", "from": "A"})).await;
    send(&mut a, json!({"type": "LIST"})).await;

    let peers = recv(&mut a).await;
    assert_eq!(peers["type"], "PEERS");
    assert_eq!(peers["peers"], json!([]));
}

#[test_timeout::tokio_timeout_test(30)]
async fn silent_session_is_reaped() {
    let liveness =
        LivenessConfig::new(Duration::from_millis(500), Duration::from_millis(1500)).unwrap();
    let server = TestServer::start(liveness).await;
    let mut a = server.connect().await;
    let mut silent = server.connect().await;

    join(&mut a, "A").await;
    let silent_session = join(&mut silent, "Z").await;

    // `silent` is never polled again, so its pongs are never written.
    let mut leaves = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    while tokio::time::Instant::now() < deadline {
        let Some(text) = recv_text(&mut a, Duration::from_millis(250)).await else {
            continue;
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        if frame["type"] == "LEAVE" {
            leaves.push(frame);
        }
    }

    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0]["publicKey"], "Z");
    assert_eq!(leaves[0]["sessionId"], silent_session.as_str());
    assert_eq!(server.state.registry.sessions_for("A").len(), 1);
    drop(silent);
}
