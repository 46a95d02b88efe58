/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use inet3_protocol::Envelope;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::identity::LocalIdentity;

const OUTBOUND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 256;
const PING_EVERY: Duration = Duration::from_secs(15);

/// Sending half of a relay connection. Cheap to clone.
#[derive(Clone, Debug)]
pub struct RelayHandle {
    tx: mpsc::Sender<Envelope>,
    connected: watch::Receiver<bool>,
}

impl RelayHandle {
    /// Handle not backed by a socket: outbound envelopes show up on the
    /// returned receiver and connectivity is driven through the sender.
    pub fn detached(buffer: usize) -> (Self, mpsc::Receiver<Envelope>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (connected_tx, connected) = watch::channel(true);
        (Self { tx, connected }, rx, connected_tx)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow() && !self.tx.is_closed()
    }

    pub async fn send(&self, envelope: Envelope) -> SessionResult<()> {
        if !self.is_connected() {
            return Err(SessionError::SignalingUnavailable);
        }
        self.tx
            .send(envelope)
            .await
            .map_err(|_| SessionError::SignalingUnavailable)
    }
}

pub fn decode_envelope(text: &str) -> SessionResult<Envelope> {
    serde_json::from_str(text).map_err(|e| SessionError::MalformedFrame(format!("relay envelope: {e}")))
}

pub struct RelayClient;

impl RelayClient {
    /// Opens the relay socket and announces `identity`. Inbound envelopes are
    /// delivered on the returned receiver until the socket or `shutdown` ends.
    pub async fn connect(
        relay_ws_url: &str,
        identity: &LocalIdentity,
        mut shutdown: watch::Receiver<bool>,
    ) -> SessionResult<(RelayHandle, mpsc::Receiver<Envelope>)> {
        info!(url=%relay_ws_url, peer=%identity.peer_id, "connecting relay");
        let (ws, _) = match tokio_tungstenite::connect_async(relay_ws_url).await {
            Ok(v) => v,
            Err(e) => {
                warn!(url=%relay_ws_url, "relay connect failed: {e}");
                return Err(SessionError::SignalingUnavailable);
            }
        };
        let (mut ws_tx, mut ws_rx) = ws.split();

        let announce = serde_json::to_string(&identity.announce()).map_err(SessionError::transport)?;
        if let Err(e) = ws_tx.send(tungstenite::Message::Text(announce)).await {
            warn!("relay announce failed: {e}");
            return Err(SessionError::SignalingUnavailable);
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);
        let (in_tx, in_rx) = mpsc::channel::<Envelope>(INBOUND_QUEUE);
        let (connected_tx, connected_rx) = watch::channel(true);
        let peer_id = identity.peer_id.clone();

        tokio::spawn(async move {
            let mut ping = tokio::time::interval(PING_EVERY);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ping.tick().await;

            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            let _ = ws_tx.send(tungstenite::Message::Close(None)).await;
                            break;
                        }
                    }
                    _ = ping.tick() => {
                        if let Err(e) = ws_tx.send(tungstenite::Message::Ping(Vec::new())).await {
                            warn!("relay ping failed: {e}");
                            break;
                        }
                    }
                    out = out_rx.recv() => {
                        let Some(env) = out else { break; };
                        let json = match serde_json::to_string(&env) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(kind=env.kind(), "envelope encode failed: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = ws_tx.send(tungstenite::Message::Text(json)).await {
                            warn!("relay send failed: {e}");
                            break;
                        }
                    }
                    msg = ws_rx.next() => {
                        let Some(msg) = msg else { break; };
                        let msg = match msg {
                            Ok(m) => m,
                            Err(e) => {
                                warn!("relay read failed: {e}");
                                break;
                            }
                        };
                        let text = match msg {
                            tungstenite::Message::Text(t) => t,
                            tungstenite::Message::Ping(p) => {
                                let _ = ws_tx.send(tungstenite::Message::Pong(p)).await;
                                continue;
                            }
                            tungstenite::Message::Close(_) => break,
                            _ => continue,
                        };
                        let env = match decode_envelope(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                debug!("dropping relay message: {e}");
                                continue;
                            }
                        };
                        if in_tx.send(env).await.is_err() {
                            break;
                        }
                    }
                }
            }

            connected_tx.send_replace(false);
            info!(peer=%peer_id, "relay connection closed");
        });

        Ok((
            RelayHandle {
                tx: out_tx,
                connected: connected_rx,
            },
            in_rx,
        ))
    }
}
