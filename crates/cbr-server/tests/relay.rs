//! End-to-end tests over real TCP: login, chat fan-out, command calls,
//! keepalive, and reconnect supersession.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cbr_client::{BridgeHandler, ClientOptions, RelayClient};
use cbr_proto::{
    CallResult, Decoded, Envelope, FrameCodec, LOGIN_FAIL, LOGIN_SUCCESS, SessionCipher,
    result_kind,
};
use cbr_server::{CallOutcome, ClientEntry, ServerConfig, ServerState, serve};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

const KEY: &str = "integration-secret";
const WAIT: Duration = Duration::from_secs(5);

async fn start_server(names: &[&str], call_timeout_ms: u64) -> (Arc<ServerState>, SocketAddr) {
    let config = ServerConfig {
        aes_key: KEY.to_string(),
        clients: names
            .iter()
            .map(|n| ClientEntry {
                name: (*n).to_string(),
                password: format!("pw-{n}"),
                client_type: "test".to_string(),
            })
            .collect(),
        timing: cbr_server::TimingConfig {
            call_timeout_ms,
            ..Default::default()
        },
        ..Default::default()
    };

    let state = Arc::new(ServerState::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let serving = state.clone();
    tokio::spawn(async move {
        let _ = serve(listener, serving).await;
    });

    (state, addr)
}

struct Recorder {
    chats: mpsc::UnboundedSender<(String, String, String)>,
}

impl BridgeHandler for Recorder {
    fn on_chat(&self, client: &str, player: &str, message: &str) {
        let _ = self
            .chats
            .send((client.to_string(), player.to_string(), message.to_string()));
    }

    fn on_command(&self, command: &str) -> CallResult {
        if command == "list" {
            CallResult::answered(result_kind::SUCCESS, serde_json::json!("3 players"))
        } else {
            CallResult::answered(result_kind::UNSUPPORTED, serde_json::Value::Null)
        }
    }
}

fn bridge(
    addr: SocketAddr,
    name: &str,
) -> (
    RelayClient,
    mpsc::UnboundedReceiver<(String, String, String)>,
) {
    let (chats, chat_rx) = mpsc::unbounded_channel();
    let mut options = ClientOptions::new(addr.to_string(), name, format!("pw-{name}"));
    options.aes_key = KEY.to_string();
    options.client_type = "test".to_string();

    let client = RelayClient::new(options, Arc::new(Recorder { chats }));
    client.start();
    (client, chat_rx)
}

type RawConn = Framed<TcpStream, FrameCodec>;

async fn raw_connect(addr: SocketAddr, key: &str) -> RawConn {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, FrameCodec::new(Arc::new(SessionCipher::new(key))))
}

async fn raw_next(conn: &mut RawConn) -> Option<Envelope> {
    match tokio::time::timeout(WAIT, conn.next()).await.unwrap()? {
        Ok(Decoded::Envelope(envelope)) => Some(envelope),
        other => panic!("expected envelope, got {other:?}"),
    }
}

async fn raw_login(addr: SocketAddr, name: &str, password: &str) -> RawConn {
    let mut conn = raw_connect(addr, KEY).await;
    conn.send(Envelope::login(name, password, "raw")).await.unwrap();

    match raw_next(&mut conn).await {
        Some(Envelope::Result { result }) => assert_eq!(result, LOGIN_SUCCESS),
        other => panic!("expected login reply, got {other:?}"),
    }
    conn
}

#[tokio::test]
async fn login_and_broadcast() {
    let (state, addr) = start_server(&["a", "b", "c", "d"], 2000).await;

    let (client_a, mut chats_a) = bridge(addr, "a");
    let (client_b, mut chats_b) = bridge(addr, "b");
    let (client_c, mut chats_c) = bridge(addr, "c");
    // d stays offline

    for client in [&client_a, &client_b, &client_c] {
        tokio::time::timeout(WAIT, client.wait_connected())
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(state.registry.online_names(), vec!["a", "b", "c"]);

    client_a.send_chat("Steve", "hi").await.unwrap();

    for chats in [&mut chats_b, &mut chats_c] {
        let (client, player, message) =
            tokio::time::timeout(WAIT, chats.recv()).await.unwrap().unwrap();
        assert_eq!(client, "a");
        assert_eq!(player, "Steve");
        assert_eq!(message, "hi");
        assert!(chats.try_recv().is_err(), "exactly one frame per target");
    }

    // The sender must not hear its own message back.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(chats_a.try_recv().is_err());

    client_a.shutdown().await;
    client_b.shutdown().await;
    client_c.shutdown().await;
}

#[tokio::test]
async fn directed_message_reaches_only_receiver() {
    let (_state, addr) = start_server(&["a", "b", "c"], 2000).await;

    let (client_a, _chats_a) = bridge(addr, "a");
    let (client_b, mut chats_b) = bridge(addr, "b");
    let (client_c, mut chats_c) = bridge(addr, "c");
    for client in [&client_a, &client_b, &client_c] {
        tokio::time::timeout(WAIT, client.wait_connected())
            .await
            .unwrap()
            .unwrap();
    }

    client_a.send_direct("Steve", "psst", "b").await.unwrap();

    let (_, _, message) = tokio::time::timeout(WAIT, chats_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message, "psst");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(chats_c.try_recv().is_err());

    client_a.shutdown().await;
    client_b.shutdown().await;
    client_c.shutdown().await;
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let (state, addr) = start_server(&["a"], 2000).await;

    let mut conn = raw_connect(addr, KEY).await;
    conn.send(Envelope::login("a", "wrong", "raw")).await.unwrap();

    match raw_next(&mut conn).await {
        Some(Envelope::Result { result }) => assert_eq!(result, LOGIN_FAIL),
        other => panic!("expected login fail, got {other:?}"),
    }

    // The server closes the connection after rejecting.
    assert!(raw_next(&mut conn).await.is_none());
    assert!(state.registry.online_names().is_empty());
}

#[tokio::test]
async fn unknown_name_is_rejected() {
    let (_state, addr) = start_server(&["a"], 2000).await;

    let mut conn = raw_connect(addr, KEY).await;
    conn.send(Envelope::login("nobody", "pw", "raw")).await.unwrap();

    match raw_next(&mut conn).await {
        Some(Envelope::Result { result }) => assert_eq!(result, LOGIN_FAIL),
        other => panic!("expected login fail, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_key_closes_unauthenticated_connection() {
    let (_state, addr) = start_server(&["a"], 2000).await;

    let mut conn = raw_connect(addr, "a different key").await;
    conn.send(Envelope::login("a", "pw-a", "raw")).await.unwrap();

    // The server cannot decode the login frame and drops the connection.
    assert!(raw_next(&mut conn).await.is_none());
}

#[tokio::test]
async fn command_call_round_trip() {
    let (state, addr) = start_server(&["a"], 2000).await;

    let (client, _chats) = bridge(addr, "a");
    tokio::time::timeout(WAIT, client.wait_connected())
        .await
        .unwrap()
        .unwrap();

    let outcome = state.call_command("a", "list").await;
    let result = outcome.into_result().expect("command should be answered");
    assert_eq!(result.kind, Some(result_kind::SUCCESS));
    assert_eq!(result.result, Some(serde_json::json!("3 players")));

    client.shutdown().await;
}

#[tokio::test]
async fn command_call_times_out_and_clears_slot() {
    let (state, addr) = start_server(&["a"], 300).await;

    // A raw session that logs in but never answers.
    let _conn = raw_login(addr, "a", "pw-a").await;

    let started = tokio::time::Instant::now();
    let outcome = state.call_command("a", "list").await;
    assert_eq!(outcome, CallOutcome::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(300));

    // The slot is free again: the next call fails by timeout too, not by
    // being superseded.
    let outcome = state.call_command("a", "list").await;
    assert_eq!(outcome, CallOutcome::Timeout);
}

#[tokio::test]
async fn command_call_to_offline_target_is_unreachable() {
    let (state, _addr) = start_server(&["a"], 2000).await;

    let started = tokio::time::Instant::now();
    let outcome = state.call_command("a", "list").await;
    assert_eq!(outcome, CallOutcome::Unreachable);
    assert!(started.elapsed() < Duration::from_millis(200), "no wait");
}

#[tokio::test]
async fn keepalive_ping_is_answered() {
    let (_state, addr) = start_server(&["a"], 2000).await;

    let mut conn = raw_login(addr, "a", "pw-a").await;
    conn.send(Envelope::ping()).await.unwrap();

    assert_eq!(raw_next(&mut conn).await, Some(Envelope::pong()));
}

#[tokio::test]
async fn probe_reports_latency() {
    let (state, addr) = start_server(&["a"], 2000).await;

    let (client, _chats) = bridge(addr, "a");
    tokio::time::timeout(WAIT, client.wait_connected())
        .await
        .unwrap()
        .unwrap();

    let latency = state.probe("a").await.expect("client should answer");
    assert!(latency < WAIT);

    client.shutdown().await;
}

#[tokio::test]
async fn stop_marks_client_offline() {
    let (state, addr) = start_server(&["a"], 2000).await;

    let mut conn = raw_login(addr, "a", "pw-a").await;
    assert_eq!(state.registry.online_names(), vec!["a"]);

    conn.send(Envelope::Stop).await.unwrap();
    assert!(raw_next(&mut conn).await.is_none());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(state.registry.online_names().is_empty());
}

#[tokio::test]
async fn reconnect_supersedes_previous_session() {
    let (state, addr) = start_server(&["a"], 2000).await;

    let mut first = raw_login(addr, "a", "pw-a").await;
    let _second = raw_login(addr, "a", "pw-a").await;

    // The first connection is closed by the takeover...
    assert!(raw_next(&mut first).await.is_none());

    // ...and its teardown must not mark the fresh session offline.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state.registry.online_names(), vec!["a"]);
}
