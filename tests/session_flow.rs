use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use vibe_coach_rs::audio::codec::encode_pcm16_le;
use vibe_coach_rs::audio::replay::ReplayIo;
use vibe_coach_rs::config::Config;
use vibe_coach_rs::controller::{ControlCommand, CoreController, SessionStatus, SessionUpdate};
use vibe_coach_rs::net_link::ConnectionState;
use vibe_coach_rs::score::SessionScore;

const WAIT: Duration = Duration::from_secs(5);

fn model_turn(part: serde_json::Value) -> Message {
    let frame = serde_json::json!({ "serverContent": { "modelTurn": { "parts": [part] } } });
    Message::Text(frame.to_string().into())
}

/// Plays the agent: expects setup plus three microphone frames, answers with one audio
/// chunk and a score split over two text messages, then waits for the client to leave.
async fn fake_agent() -> (std::net::SocketAddr, oneshot::Receiver<Vec<serde_json::Value>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut received = Vec::new();
        while received.len() < 4 {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    received.push(serde_json::from_str(text.as_str()).unwrap());
                }
                Some(Ok(_)) => {}
                _ => break,
            }
        }

        let pcm = encode_pcm16_le(&vec![0.25f32; 2400]);
        ws.send(model_turn(serde_json::json!({
            "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": BASE64.encode(&pcm) }
        })))
        .await
        .unwrap();
        ws.send(model_turn(serde_json::json!({ "text": "Well done! {\"fluency_score\":80," })))
            .await
            .unwrap();
        ws.send(model_turn(serde_json::json!({
            "text": "\"vocabulary_score\":70,\"confidence_score\":60,\"key_phrases\":[\"a\",\"b\"],\"feedback\":\"ok\"}"
        })))
        .await
        .unwrap();

        // Drain until the client closes.
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
        let _ = done_tx.send(received);
    });
    (addr, done_rx)
}

async fn next_update(rx: &mut mpsc::UnboundedReceiver<SessionUpdate>) -> SessionUpdate {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn full_session_round_trip() {
    let (addr, agent_done) = fake_agent().await;

    let mut config = Config::new().unwrap();
    config.proxy_url = format!("ws://{}", addr);
    config.capture_sample_rate = 16000;

    let io = ReplayIo::new(16000, vec![vec![0.1; 160], vec![-0.1; 160], vec![0.2; 160]]);
    let render_log = io.render_log();
    let capture_flag = io.capture_flag();

    let (update_tx, mut updates) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let controller = CoreController::new(&config, Box::new(io), update_tx);
    let handle = tokio::spawn(controller.run(command_rx, async {
        let _ = stop_rx.await;
    }));

    command_tx.send(ControlCommand::Toggle).await.unwrap();

    let mut statuses = Vec::new();
    let mut transcript = String::new();
    let mut score = None;
    let mut output_levels = 0;
    while score.is_none() {
        match next_update(&mut updates).await {
            SessionUpdate::Status { status } => statuses.push(status),
            SessionUpdate::Transcript { text } => transcript.push_str(&text),
            SessionUpdate::Score { score: s } => score = Some(s),
            SessionUpdate::OutputLevel { level } => {
                assert!(level > 0.0);
                output_levels += 1;
            }
            SessionUpdate::InputLevel { .. } => {}
        }
    }

    assert_eq!(
        score,
        Some(SessionScore {
            fluency_score: 80.0,
            vocabulary_score: 70.0,
            confidence_score: 60.0,
            key_phrases: vec!["a".into(), "b".into()],
            feedback: "ok".into(),
        })
    );
    assert!(transcript.starts_with("Well done!"));
    assert_eq!(output_levels, 1);

    command_tx.send(ControlCommand::Toggle).await.unwrap();
    loop {
        if let SessionUpdate::Status { status } = next_update(&mut updates).await {
            statuses.push(status);
            if status == SessionStatus::Disconnected {
                break;
            }
        }
    }

    assert_eq!(
        statuses,
        vec![
            SessionStatus::Connecting,
            SessionStatus::Connected,
            SessionStatus::Listening,
            SessionStatus::Speaking,
            SessionStatus::Disconnected,
        ]
    );
    assert!(!capture_flag.load(Ordering::SeqCst));

    let submissions = render_log.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].0, 0.0);
    assert_eq!(submissions[0].1.len(), 2400);

    let received = timeout(WAIT, agent_done).await.unwrap().unwrap();
    assert!(received[0].get("setup").is_some());
    for frame in &received[1..] {
        let data = frame["realtime_input"]["media_chunks"][0]["data"].as_str().unwrap();
        assert_eq!(BASE64.decode(data).unwrap().len(), 320);
    }

    stop_tx.send(()).unwrap();
    let controller = timeout(WAIT, handle).await.unwrap().unwrap();
    assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
    assert_eq!(controller.status(), SessionStatus::Disconnected);
    assert_eq!(controller.score().map(|s| s.fluency_score), Some(80.0));
}

#[tokio::test]
async fn missing_microphone_fails_the_session() {
    let (addr, _agent_done) = fake_agent().await;

    let mut config = Config::new().unwrap();
    config.proxy_url = format!("ws://{}", addr);

    let io = ReplayIo::new(16000, Vec::new()).without_microphone();
    let (update_tx, mut updates) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let controller = CoreController::new(&config, Box::new(io), update_tx);
    let handle = tokio::spawn(controller.run(command_rx, async {
        let _ = stop_rx.await;
    }));
    command_tx.send(ControlCommand::Connect).await.unwrap();

    let mut statuses = Vec::new();
    while statuses.last() != Some(&SessionStatus::Error) {
        if let SessionUpdate::Status { status } = next_update(&mut updates).await {
            statuses.push(status);
        }
    }
    assert_eq!(statuses, vec![SessionStatus::Connecting, SessionStatus::Error]);

    stop_tx.send(()).unwrap();
    let controller = timeout(WAIT, handle).await.unwrap().unwrap();
    assert_eq!(controller.connection_state(), ConnectionState::Error);
}
