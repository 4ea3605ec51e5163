//! Credential-holding WebSocket relay between local clients and the voice agent.
//!
//! Each inbound connection gets exactly one upstream connection, opened before the
//! inbound upgrade is answered. Frames are forwarded verbatim in both directions and a
//! close on either side closes the other with the same code and reason. The credential is appended to the upstream URL here and is
//! never sent to the client or written to the log.

use crate::config::RelayConfig;
use crate::error::SessionError;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

/// Close code sent to the client when no credential is configured.
pub const CLOSE_CREDENTIAL_MISSING: u16 = close_code::POLICY;
/// Close code for upstream failures and transport errors on either side.
pub const CLOSE_UPSTREAM_FAILED: u16 = close_code::ERROR;

/// Close reasons must fit a control frame.
const MAX_CLOSE_REASON: usize = 123;

pub fn router(config: RelayConfig) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(config))
}

/// Serve on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, config: RelayConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    log::info!("Relay listening on {}", addr);
    log::info!("Health check: http://{}/health", addr);
    if !config.has_api_key() {
        log::warn!("No credential configured, sessions will be refused");
    }
    axum::serve(listener, router(config))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health(State(config): State<Arc<RelayConfig>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "time": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "env": { "hasApiKey": config.has_api_key() },
    }))
}

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The upstream is dialled before the client's upgrade completes, so the client only
/// sees an open socket once both sides can carry frames.
async fn ws_handler(ws: WebSocketUpgrade, State(config): State<Arc<RelayConfig>>) -> Response {
    let id = Uuid::new_v4();
    log::info!("[{}] Client connecting", id);

    let Some(key) = config.api_key.clone() else {
        log::error!("[{}] {}", id, SessionError::CredentialMissing);
        return ws.on_upgrade(move |mut client| async move {
            close_client(&mut client, CLOSE_CREDENTIAL_MISSING, "credential not configured").await;
        });
    };

    match open_upstream(id, &config.upstream_url, &key).await {
        Ok(upstream) => ws.on_upgrade(move |client| relay_session(id, client, upstream, key)),
        Err(reason) => ws.on_upgrade(move |mut client| async move {
            close_client(&mut client, CLOSE_UPSTREAM_FAILED, reason).await;
        }),
    }
}

fn upstream_url(base: &str, key: &str) -> Result<url::Url, SessionError> {
    let mut url = url::Url::parse(base)
        .map_err(|e| SessionError::Config(format!("invalid upstream url: {}", e)))?;
    url.query_pairs_mut().append_pair("key", key);
    Ok(url)
}

/// Connect upstream. The error is the close reason for the client.
async fn open_upstream(id: Uuid, base: &str, key: &str) -> Result<Upstream, &'static str> {
    let url = upstream_url(base, key).map_err(|e| {
        log::error!("[{}] {}", id, e);
        "upstream misconfigured"
    })?;

    log::info!("[{}] Connecting upstream {}", id, base);
    match connect_async(url.as_str()).await {
        Ok((upstream, _)) => {
            log::info!("[{}] Connected upstream", id);
            Ok(upstream)
        }
        Err(e) => {
            log::error!("[{}] Upstream connect failed: {}", id, e.to_string().replace(key, "<redacted>"));
            Err("upstream unavailable")
        }
    }
}

async fn relay_session(id: Uuid, client: WebSocket, upstream: Upstream, key: String) {
    log::info!("[{}] Client connected", id);
    let key = key.as_str();

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    loop {
        tokio::select! {
            msg = client_rx.next() => {
                let forward = match msg {
                    Some(Ok(Message::Text(text))) => UpstreamMessage::Text(text.as_str().to_owned().into()),
                    Some(Ok(Message::Binary(data))) => UpstreamMessage::Binary(data),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("[{}] Client closed: {:?}", id, frame);
                        let frame = frame.map(|f| UpstreamCloseFrame {
                            code: CloseCode::from(f.code),
                            reason: f.reason.as_str().to_owned().into(),
                        });
                        let _ = upstream_tx.send(UpstreamMessage::Close(frame)).await;
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("[{}] Client error: {}", id, e);
                        let frame = UpstreamCloseFrame {
                            code: CloseCode::from(CLOSE_UPSTREAM_FAILED),
                            reason: close_reason(&e.to_string()).into(),
                        };
                        let _ = upstream_tx.send(UpstreamMessage::Close(Some(frame))).await;
                        break;
                    }
                    None => {
                        log::info!("[{}] Client went away", id);
                        let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = upstream_tx.send(forward).await {
                    log::warn!("[{}] Dropped client frame: {}", id, e);
                }
            }
            msg = upstream_rx.next() => {
                let forward = match msg {
                    Some(Ok(UpstreamMessage::Text(text))) => Message::Text(text.as_str().to_owned().into()),
                    Some(Ok(UpstreamMessage::Binary(data))) => Message::Binary(data),
                    Some(Ok(UpstreamMessage::Close(frame))) => {
                        log::info!("[{}] Upstream closed: {:?}", id, frame);
                        let frame = frame.map(|f| CloseFrame {
                            code: u16::from(f.code),
                            reason: f.reason.as_str().to_owned().into(),
                        });
                        let _ = client_tx.send(Message::Close(frame)).await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let text = e.to_string().replace(key, "<redacted>");
                        log::error!("[{}] Upstream error: {}", id, text);
                        let frame = CloseFrame {
                            code: CLOSE_UPSTREAM_FAILED,
                            reason: close_reason(&text).into(),
                        };
                        let _ = client_tx.send(Message::Close(Some(frame))).await;
                        break;
                    }
                    None => {
                        log::info!("[{}] Upstream went away", id);
                        let _ = client_tx.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = client_tx.send(forward).await {
                    log::warn!("[{}] Dropped upstream frame: {}", id, e);
                }
            }
        }
    }

    log::info!("[{}] Session closed", id);
}

async fn close_client(client: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_owned().into(),
    };
    if let Err(e) = client.send(Message::Close(Some(frame))).await {
        log::debug!("Close frame not delivered: {}", e);
    }
}

fn close_reason(text: &str) -> String {
    if text.len() <= MAX_CLOSE_REASON {
        return text.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
