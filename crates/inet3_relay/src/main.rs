/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn};

mod routing;

use routing::{classify, Inbound, PeerLink, PeerTable};

#[derive(Clone, Debug)]
struct RelayConfig {
    bind: SocketAddr,
    max_message_bytes: usize,
    queue: usize,
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<RelayConfig>,
    peers: Arc<RwLock<PeerTable>>,
    next_conn: Arc<AtomicU64>,
}

impl AppState {
    fn new(cfg: RelayConfig) -> Self {
        Self {
            cfg: Arc::new(cfg),
            peers: Arc::new(RwLock::new(PeerTable::default())),
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cfg = load_config()?;
    let addr = cfg.bind;
    let app = app(AppState::new(cfg));

    info!("inet3_relay listening on ws://{addr}/ws");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("serve")?;
    Ok(())
}

fn load_config() -> Result<RelayConfig> {
    let bind = std::env::var("INET3_RELAY_BIND").unwrap_or_else(|_| "0.0.0.0:8790".to_string());
    let bind: SocketAddr = bind.parse().context("INET3_RELAY_BIND invalid")?;
    let max_message_bytes = std::env::var("INET3_RELAY_MAX_MESSAGE_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256 * 1024)
        .max(4 * 1024)
        .min(4 * 1024 * 1024);
    let queue = std::env::var("INET3_RELAY_QUEUE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(64)
        .max(8)
        .min(1024);
    Ok(RelayConfig {
        bind,
        max_message_bytes,
        queue,
    })
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
            info_span!("http", method = %req.method(), uri = %req.uri())
        }))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let max = state.cfg.max_message_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(state, peer, socket))
}

async fn handle_socket(state: AppState, peer: SocketAddr, socket: WebSocket) {
    let conn_id = state.next_conn.fetch_add(1, Ordering::Relaxed);
    debug!(%peer, conn_id, "socket opened");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.cfg.queue);

    let cancel = CancellationToken::new();
    let cancel_writer = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_writer.cancelled() => break,
                msg = rx.recv() => {
                    let Some(json) = msg else { break; };
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut user: Option<String> = None;
    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%peer, conn_id, "socket read failed: {e}");
                break;
            }
        };
        match classify(user.as_deref(), &text) {
            Ok(Inbound::Announce { user_id, username }) => {
                if let Some(current) = user.as_deref() {
                    if current != user_id {
                        warn!(%peer, %current, announced=%user_id, "re-announce with another id ignored");
                    }
                    continue;
                }
                let replaced = state.peers.write().await.register(
                    &user_id,
                    PeerLink {
                        conn_id,
                        tx: tx.clone(),
                    },
                );
                if replaced.is_some() {
                    info!(user=%user_id, "newer connection replaces previous one");
                }
                info!(user=%user_id, %username, %peer, "peer announced");
                user = Some(user_id);
            }
            Ok(Inbound::Forward { target, json }) => {
                let link = state.peers.read().await.get(&target).cloned();
                let Some(link) = link else {
                    debug!(from=?user, %target, "unknown target, dropped");
                    continue;
                };
                if let Err(e) = link.tx.try_send(json) {
                    warn!(from=?user, %target, "target queue unavailable, dropped: {e}");
                }
            }
            Err(e) => {
                debug!(%peer, from=?user, "dropped: {e}");
            }
        }
    }

    cancel.cancel();
    let _ = writer.await;
    if let Some(user_id) = user {
        if state.peers.write().await.unregister(&user_id, conn_id) {
            info!(user=%user_id, "peer disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn spawn_relay() -> SocketAddr {
        let state = AppState::new(RelayConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            max_message_bytes: 64 * 1024,
            queue: 16,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(state).into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });
        addr
    }

    type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn announce(addr: SocketAddr, id: &str) -> Client {
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let hello = format!(r#"{{"type":"announce","userId":"{id}","username":"{id}","publicKey":""}}"#);
        ws.send(WsMessage::Text(hello)).await.unwrap();
        ws
    }

    async fn next_text(ws: &mut Client) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(t) = msg {
                return serde_json::from_str(&t).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn routes_between_announced_peers() {
        let addr = spawn_relay().await;
        let mut alice = announce(addr, "alice").await;
        let mut bob = announce(addr, "bob").await;
        // Give both announces time to register.
        tokio::time::sleep(Duration::from_millis(100)).await;

        alice.send(WsMessage::Text("not json".into())).await.unwrap();
        alice
            .send(WsMessage::Text(
                r#"{"type":"offer","sender":"x","target":"carol","offer":{"type":"offer","sdp":"lost"}}"#.into(),
            ))
            .await
            .unwrap();
        alice
            .send(WsMessage::Text(
                r#"{"type":"offer","sender":"x","target":"bob","offer":{"type":"offer","sdp":"v=0"}}"#.into(),
            ))
            .await
            .unwrap();

        let got = next_text(&mut bob).await;
        assert_eq!(got["type"], "offer");
        assert_eq!(got["sender"], "alice");
        assert_eq!(got["offer"]["sdp"], "v=0");

        bob.send(WsMessage::Text(
            r#"{"type":"answer","sender":"bob","target":"alice","answer":{"type":"answer","sdp":"v=1"}}"#.into(),
        ))
        .await
        .unwrap();
        let got = next_text(&mut alice).await;
        assert_eq!(got["type"], "answer");
        assert_eq!(got["answer"]["sdp"], "v=1");
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let addr = spawn_relay().await;
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.ends_with("ok"));
    }
}
