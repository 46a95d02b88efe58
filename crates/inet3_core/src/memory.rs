/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-process transport: peers living in the same process "connect" once
//! both sides have exchanged descriptions (and, optionally, at least one
//! candidate each). Used by the tests and for local demos; no sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use inet3_protocol::{IceCandidate, SessionDescription};
use tracing::debug;

use crate::error::{SessionError, SessionResult};
use crate::transport::{
    ChannelMessage, DataChannel, EventSink, PeerTransport, TransportEventKind, TransportFactory, TransportState,
};

type EndpointKey = (String, String);

struct Endpoint {
    session: u64,
    sink: EventSink,
    label: Option<String>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates_applied: usize,
    channel_open: Option<Arc<AtomicBool>>,
}

#[derive(Default)]
struct NetState {
    endpoints: HashMap<EndpointKey, Endpoint>,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
    require_candidates: bool,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connectivity additionally needs one applied remote candidate per side,
    /// the way ICE needs a usable pair.
    pub fn requiring_candidates() -> Self {
        Self {
            state: Arc::default(),
            require_candidates: true,
        }
    }

    pub fn factory(&self, local_id: &str) -> Arc<dyn TransportFactory> {
        Arc::new(MemoryTransportFactory {
            net: self.clone(),
            local_id: local_id.to_string(),
        })
    }

    /// Number of remote candidates applied on `local`'s side of the pair.
    pub fn candidates_applied(&self, local: &str, remote: &str) -> usize {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.endpoints
            .get(&(local.to_string(), remote.to_string()))
            .map(|e| e.candidates_applied)
            .unwrap_or(0)
    }

    /// Simulates an ICE failure between two peers.
    pub fn fail_link(&self, a: &str, b: &str) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for key in [(a.to_string(), b.to_string()), (b.to_string(), a.to_string())] {
            if let Some(ep) = st.endpoints.get_mut(&key) {
                if let Some(open) = ep.channel_open.take() {
                    open.store(false, Ordering::SeqCst);
                }
                ep.sink.emit(TransportEventKind::StateChanged(TransportState::Failed));
            }
        }
    }

    fn with_endpoint<T>(
        &self,
        key: &EndpointKey,
        session: u64,
        f: impl FnOnce(&mut Endpoint) -> SessionResult<T>,
    ) -> SessionResult<T> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ep = st
            .endpoints
            .get_mut(key)
            .filter(|ep| ep.session == session)
            .ok_or_else(|| SessionError::Transport("memory transport closed".to_string()))?;
        let out = f(ep)?;
        try_connect(&mut st, key, self.require_candidates);
        Ok(out)
    }
}

fn ready(ep: &Endpoint, require_candidates: bool) -> bool {
    ep.local.is_some()
        && ep.remote.is_some()
        && ep.channel_open.is_none()
        && (!require_candidates || ep.candidates_applied > 0)
}

fn try_connect(st: &mut NetState, key: &EndpointKey, require_candidates: bool) {
    let other_key = (key.1.clone(), key.0.clone());
    let both_ready = match (st.endpoints.get(key), st.endpoints.get(&other_key)) {
        (Some(a), Some(b)) => ready(a, require_candidates) && ready(b, require_candidates),
        _ => false,
    };
    if !both_ready {
        return;
    }
    let open = Arc::new(AtomicBool::new(true));
    let (Some(a), Some(b)) = (st.endpoints.get(key), st.endpoints.get(&other_key)) else {
        return;
    };
    let label = a
        .label
        .clone()
        .or_else(|| b.label.clone())
        .unwrap_or_else(|| "memory".to_string());
    let a_sink = a.sink.clone();
    let b_sink = b.sink.clone();
    let a_channel: Arc<dyn DataChannel> = Arc::new(MemoryChannel {
        peer_id: key.1.clone(),
        label: label.clone(),
        open: open.clone(),
        remote: b_sink.clone(),
    });
    let b_channel: Arc<dyn DataChannel> = Arc::new(MemoryChannel {
        peer_id: key.0.clone(),
        label,
        open: open.clone(),
        remote: a_sink.clone(),
    });
    for (k, sink, channel) in [(key.clone(), a_sink, a_channel), (other_key, b_sink, b_channel)] {
        if let Some(ep) = st.endpoints.get_mut(&k) {
            ep.channel_open = Some(open.clone());
        }
        sink.emit(TransportEventKind::StateChanged(TransportState::Connected));
        sink.emit(TransportEventKind::ChannelOpen(channel));
    }
    debug!(a=%key.0, b=%key.1, "memory link up");
}

struct MemoryTransportFactory {
    net: MemoryNetwork,
    local_id: String,
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create(&self, peer_id: &str, events: EventSink) -> SessionResult<Arc<dyn PeerTransport>> {
        let key = (self.local_id.clone(), peer_id.to_string());
        let session = events.session();
        {
            let mut st = self.net.state.lock().unwrap_or_else(|e| e.into_inner());
            st.endpoints.insert(
                key.clone(),
                Endpoint {
                    session,
                    sink: events,
                    label: None,
                    local: None,
                    remote: None,
                    candidates_applied: 0,
                    channel_open: None,
                },
            );
        }
        Ok(Arc::new(MemoryTransport {
            net: self.net.clone(),
            key,
            session,
        }))
    }
}

struct MemoryTransport {
    net: MemoryNetwork,
    key: EndpointKey,
    session: u64,
}

impl MemoryTransport {
    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:memory 1 udp 1 {} 0 typ host", self.key.0),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_offer(&self) -> SessionResult<SessionDescription> {
        let candidate = self.local_candidate();
        self.net.with_endpoint(&self.key, self.session, |ep| {
            let offer = SessionDescription {
                kind: "offer".to_string(),
                sdp: format!("memory {} -> {}", self.key.0, self.key.1),
            };
            ep.label = Some("memory".to_string());
            ep.local = Some(offer.clone());
            ep.sink.emit(TransportEventKind::LocalCandidate(candidate));
            Ok(offer)
        })
    }

    async fn create_answer(&self) -> SessionResult<SessionDescription> {
        let candidate = self.local_candidate();
        self.net.with_endpoint(&self.key, self.session, |ep| {
            if ep.remote.is_none() {
                return Err(SessionError::Transport("no remote offer to answer".to_string()));
            }
            let answer = SessionDescription {
                kind: "answer".to_string(),
                sdp: format!("memory {} -> {}", self.key.0, self.key.1),
            };
            ep.local = Some(answer.clone());
            ep.sink.emit(TransportEventKind::LocalCandidate(candidate));
            Ok(answer)
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> SessionResult<()> {
        self.net.with_endpoint(&self.key, self.session, |ep| {
            ep.remote = Some(desc);
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> SessionResult<()> {
        self.net.with_endpoint(&self.key, self.session, |ep| {
            if ep.remote.is_none() {
                return Err(SessionError::Transport("remote description not set".to_string()));
            }
            ep.candidates_applied += 1;
            Ok(())
        })
    }

    async fn close(&self) -> SessionResult<()> {
        let mut st = self.net.state.lock().unwrap_or_else(|e| e.into_inner());
        let owned = st
            .endpoints
            .get(&self.key)
            .map(|ep| ep.session == self.session)
            .unwrap_or(false);
        if !owned {
            return Ok(());
        }
        let Some(ep) = st.endpoints.remove(&self.key) else {
            return Ok(());
        };
        if let Some(open) = ep.channel_open {
            open.store(false, Ordering::SeqCst);
            let other_key = (self.key.1.clone(), self.key.0.clone());
            if let Some(other) = st.endpoints.get_mut(&other_key) {
                other.channel_open = None;
                other.sink.emit(TransportEventKind::StateChanged(TransportState::Closed));
            }
        }
        Ok(())
    }
}

struct MemoryChannel {
    peer_id: String,
    label: String,
    open: Arc<AtomicBool>,
    /// Sink of the opposite end; its peer id is this end's identity.
    remote: EventSink,
}

impl MemoryChannel {
    fn deliver(&self, message: ChannelMessage) -> SessionResult<()> {
        if !self.is_open() {
            return Err(SessionError::ChannelNotOpen(self.peer_id.clone()));
        }
        self.remote.emit(TransportEventKind::ChannelMessage(message));
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> SessionResult<()> {
        self.deliver(ChannelMessage::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> SessionResult<()> {
        self.deliver(ChannelMessage::Binary(data))
    }

    async fn close(&self) -> SessionResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.remote.emit(TransportEventKind::ChannelClosed);
        }
        Ok(())
    }
}
