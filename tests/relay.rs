use futures_util::{SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async};
use vibe_coach_rs::config::{Config, RelayConfig};
use vibe_coach_rs::net_link::{ConnectionState, LiveClient, NetEvent};
use vibe_coach_rs::relay;

const WAIT: Duration = Duration::from_secs(5);

struct Relay {
    addr: SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

async fn start_relay(upstream_url: String, api_key: Option<&str>) -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, signal) = oneshot::channel::<()>();
    let config = RelayConfig {
        bind: addr.to_string(),
        upstream_url,
        api_key: api_key.map(str::to_string),
    };
    tokio::spawn(relay::serve(listener, config, async {
        let _ = signal.await;
    }));
    Relay {
        addr,
        _shutdown: shutdown,
    }
}

enum Seen {
    Uri(String),
    Frame(Message),
}

/// Fake agent: reports the upgrade URI and every frame, greets with "ready", echoes
/// text frames with a prefix, and can be told to send frames of its own.
async fn fake_upstream() -> (String, mpsc::UnboundedReceiver<Seen>, mpsc::UnboundedSender<Message>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws/agent?alt=json", listener.local_addr().unwrap());
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let uri_tx = seen_tx.clone();
        let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let _ = uri_tx.send(Seen::Uri(req.uri().to_string()));
            Ok(resp)
        })
        .await
        .unwrap();
        let (mut write, mut read) = ws.split();
        let _ = write.send(Message::Text("ready".into())).await;
        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(msg)) => {
                        let echo = match &msg {
                            Message::Text(text) => Some(Message::Text(format!("echo:{}", text.as_str()).into())),
                            _ => None,
                        };
                        let _ = seen_tx.send(Seen::Frame(msg));
                        if let Some(echo) = echo {
                            let _ = write.send(echo).await;
                        }
                    }
                    _ => break,
                },
                Some(msg) = out_rx.recv() => {
                    let _ = write.send(msg).await;
                }
            }
        }
    });
    (url, seen_rx, out_tx)
}

/// Waits for the upstream's greeting, which the relay forwards once bridged.
async fn wait_ready<S>(ws: &mut S)
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let first = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(first, Message::Text("ready".into()));
}

async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

async fn expect_close<S>(ws: &mut S) -> Option<CloseFrame>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => continue,
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn health_reports_credential_presence() {
    let with_key = start_relay("ws://127.0.0.1:9/".into(), Some("k")).await;
    let without_key = start_relay("ws://127.0.0.1:9/".into(), None).await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", with_key.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["env"]["hasApiKey"], true);
    let time = body["time"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(time).is_ok());

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", without_key.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["env"]["hasApiKey"], false);
}

#[tokio::test]
async fn missing_credential_closes_with_policy_code() {
    let (url, mut seen, _out) = fake_upstream().await;
    let relay = start_relay(url, None).await;

    let (mut ws, _) = connect_async(format!("ws://{}/", relay.addr)).await.unwrap();
    let frame = expect_close(&mut ws).await.unwrap();
    assert_eq!(u16::from(frame.code), relay::CLOSE_CREDENTIAL_MISSING);
    // Never dialled upstream.
    assert!(timeout(Duration::from_millis(300), seen.recv()).await.is_err());
}

#[tokio::test]
async fn unreachable_upstream_closes_with_error_code() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = format!("ws://{}/", listener.local_addr().unwrap());
    drop(listener);
    let relay = start_relay(dead, Some("secret")).await;

    let (mut ws, _) = connect_async(format!("ws://{}/", relay.addr)).await.unwrap();
    let frame = expect_close(&mut ws).await.unwrap();
    assert_eq!(u16::from(frame.code), relay::CLOSE_UPSTREAM_FAILED);
    assert!(!frame.reason.as_str().contains("secret"));
}

#[tokio::test]
async fn frames_are_forwarded_verbatim_both_ways() {
    let (url, mut seen, out) = fake_upstream().await;
    let relay = start_relay(url, Some("s3cr3t")).await;

    let (mut ws, _) = connect_async(format!("ws://{}/", relay.addr)).await.unwrap();

    let Seen::Uri(uri) = next_seen(&mut seen).await else {
        panic!("expected upgrade request first");
    };
    assert_eq!(uri, "/ws/agent?alt=json&key=s3cr3t");
    wait_ready(&mut ws).await;

    ws.send(Message::Text(r#"{"setup":{}}"#.into())).await.unwrap();
    let Seen::Frame(Message::Text(text)) = next_seen(&mut seen).await else {
        panic!("expected text frame");
    };
    assert_eq!(text.as_str(), r#"{"setup":{}}"#);

    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, Message::Text(r#"echo:{"setup":{}}"#.into()));

    out.send(Message::Binary(vec![1, 2, 3].into())).unwrap();
    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, Message::Binary(vec![1, 2, 3].into()));

    ws.send(Message::Binary(vec![9, 8].into())).await.unwrap();
    let Seen::Frame(Message::Binary(data)) = next_seen(&mut seen).await else {
        panic!("expected binary frame");
    };
    assert_eq!(&data[..], &[9u8, 8]);
}

#[tokio::test]
async fn client_close_reaches_upstream_with_same_code() {
    let (url, mut seen, _out) = fake_upstream().await;
    let relay = start_relay(url, Some("k")).await;

    let (mut ws, _) = connect_async(format!("ws://{}/", relay.addr)).await.unwrap();
    assert!(matches!(next_seen(&mut seen).await, Seen::Uri(_)));
    wait_ready(&mut ws).await;

    ws.close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "bye".into(),
    }))
    .await
    .unwrap();

    loop {
        match next_seen(&mut seen).await {
            Seen::Frame(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason.as_str(), "bye");
                break;
            }
            Seen::Frame(Message::Close(None)) => panic!("close code lost"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn upstream_close_reaches_client_with_same_code() {
    let (url, mut seen, out) = fake_upstream().await;
    let relay = start_relay(url, Some("k")).await;

    let (mut ws, _) = connect_async(format!("ws://{}/", relay.addr)).await.unwrap();
    assert!(matches!(next_seen(&mut seen).await, Seen::Uri(_)));
    wait_ready(&mut ws).await;

    out.send(Message::Close(Some(CloseFrame {
        code: CloseCode::from(4000),
        reason: "session over".into(),
    })))
    .unwrap();

    let frame = expect_close(&mut ws).await.unwrap();
    assert_eq!(u16::from(frame.code), 4000);
    assert_eq!(frame.reason.as_str(), "session over");
}

/// Fake agent whose WebSocket handshake is held until `open` fires. Reports every text
/// frame it receives after that.
async fn gated_upstream() -> (String, oneshot::Sender<()>, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/", listener.local_addr().unwrap());
    let (open_tx, open_rx) = oneshot::channel::<()>();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = open_rx.await;
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let _ = seen_tx.send(text.as_str().to_string());
            }
        }
    });
    (url, open_tx, seen_rx)
}

#[tokio::test]
async fn client_handshake_waits_for_upstream() {
    let (url, open, mut seen) = gated_upstream().await;
    let relay = start_relay(url, Some("k")).await;

    let connect = tokio::spawn(connect_async(format!("ws://{}/", relay.addr)));
    tokio::time::sleep(Duration::from_millis(300)).await;
    // No open client socket, so there is nothing the relay could queue.
    assert!(!connect.is_finished());

    open.send(()).unwrap();
    let (mut ws, _) = timeout(WAIT, connect).await.unwrap().unwrap().unwrap();
    ws.send(Message::Text("first".into())).await.unwrap();
    ws.send(Message::Text("second".into())).await.unwrap();

    assert_eq!(timeout(WAIT, seen.recv()).await.unwrap().unwrap(), "first");
    assert_eq!(timeout(WAIT, seen.recv()).await.unwrap().unwrap(), "second");
}

#[tokio::test]
async fn live_client_through_relay_sends_setup_first() {
    let (url, open, mut seen) = gated_upstream().await;
    let relay = start_relay(url, Some("k")).await;

    let mut config = Config::new().unwrap();
    config.proxy_url = format!("ws://{}/", relay.addr);
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut client = LiveClient::new(&config, tx);
    assert!(client.connect());

    // Frames offered while the upstream handshake is pending are not sent at all.
    let opener = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        open.send(()).unwrap();
    });
    let mut offered = 0;
    loop {
        client.send_audio(format!("EARLY{}", offered));
        offered += 1;
        match timeout(Duration::from_millis(20), events.recv()).await {
            Ok(Some(NetEvent::State { state: ConnectionState::Connected, .. })) => break,
            Ok(Some(NetEvent::State { state, .. })) => {
                assert_eq!(state, ConnectionState::Connecting);
            }
            Ok(other) => panic!("unexpected event {:?}", other),
            Err(_) => assert!(offered < 250, "never connected"),
        }
    }
    opener.await.unwrap();

    client.send_audio("AAAA".into());
    client.send_audio("BBBB".into());

    let first: serde_json::Value =
        serde_json::from_str(&timeout(WAIT, seen.recv()).await.unwrap().unwrap()).unwrap();
    assert!(first.get("setup").is_some(), "first upstream frame: {}", first);
    for data in ["AAAA", "BBBB"] {
        let frame: serde_json::Value =
            serde_json::from_str(&timeout(WAIT, seen.recv()).await.unwrap().unwrap()).unwrap();
        assert_eq!(frame["realtime_input"]["media_chunks"][0]["data"], data);
    }
    client.disconnect();
}
