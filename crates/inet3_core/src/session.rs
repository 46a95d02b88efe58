/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;
use std::time::{Duration, Instant};

use inet3_protocol::{IceCandidate, SessionDescription};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::framer::{FrameDecoder, Inbound};
use crate::transport::{ChannelMessage, DataChannel, PeerTransport, TransportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    OfferSent,
    AnswerSent,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn is_negotiating(self) -> bool {
        matches!(self, SessionState::New | SessionState::OfferSent | SessionState::AnswerSent)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::New => "new",
            SessionState::OfferSent => "offer-sent",
            SessionState::AnswerSent => "answer-sent",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// One remote peer: transport handle, data channel once open, queued
/// candidates and the inbound reassembly state.
pub struct PeerSession {
    peer_id: String,
    public_key: String,
    id: u64,
    role: Role,
    state: SessionState,
    state_since: Instant,
    transport: Arc<dyn PeerTransport>,
    channel: Option<Arc<dyn DataChannel>>,
    remote_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    decoder: FrameDecoder,
    state_tx: watch::Sender<SessionState>,
    channel_tx: watch::Sender<Option<Arc<dyn DataChannel>>>,
    send_lock: Arc<Mutex<()>>,
}

impl PeerSession {
    pub fn new(
        peer_id: &str,
        public_key: &str,
        id: u64,
        role: Role,
        transport: Arc<dyn PeerTransport>,
        max_transfer_bytes: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            peer_id: peer_id.to_string(),
            public_key: public_key.to_string(),
            id,
            role,
            state: SessionState::New,
            state_since: now,
            transport,
            channel: None,
            remote_applied: false,
            pending_candidates: Vec::new(),
            decoder: FrameDecoder::new(peer_id, max_transfer_bytes),
            state_tx: watch::Sender::new(SessionState::New),
            channel_tx: watch::Sender::new(None),
            send_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.clone()
    }

    pub fn channel_watch(&self) -> watch::Receiver<Option<Arc<dyn DataChannel>>> {
        self.channel_tx.subscribe()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn send_lock(&self) -> Arc<Mutex<()>> {
        self.send_lock.clone()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            peer_id: self.peer_id.clone(),
            session_id: self.id,
            state_rx: self.state_tx.subscribe(),
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        debug!(peer=%self.peer_id, session=self.id, from=%self.state, to=%next, "session state");
        self.state = next;
        self.state_since = Instant::now();
        self.state_tx.send_replace(next);
    }

    /// New -> OfferSent.
    pub async fn start_offer(&mut self) -> SessionResult<SessionDescription> {
        if self.role != Role::Offerer || self.state != SessionState::New {
            return Err(SessionError::violation(&self.peer_id, format!("offer from state {}", self.state)));
        }
        let offer = self.transport.create_offer().await?;
        self.set_state(SessionState::OfferSent);
        Ok(offer)
    }

    /// New -> AnswerSent. Applies the remote offer, replays queued candidates
    /// and returns the local answer.
    pub async fn accept_offer(&mut self, offer: SessionDescription) -> SessionResult<SessionDescription> {
        if self.role != Role::Answerer || self.state != SessionState::New {
            return Err(SessionError::violation(&self.peer_id, format!("offer in state {}", self.state)));
        }
        self.transport.set_remote_description(offer).await?;
        self.remote_applied = true;
        self.flush_candidates().await;
        let answer = self.transport.create_answer().await?;
        self.set_state(SessionState::AnswerSent);
        Ok(answer)
    }

    /// OfferSent -> Connected.
    pub async fn apply_answer(&mut self, answer: SessionDescription) -> SessionResult<()> {
        if self.role != Role::Offerer || self.state != SessionState::OfferSent {
            return Err(SessionError::violation(&self.peer_id, format!("answer in state {}", self.state)));
        }
        self.transport.set_remote_description(answer).await?;
        self.remote_applied = true;
        self.flush_candidates().await;
        self.set_state(SessionState::Connected);
        Ok(())
    }

    /// Queues the candidate until the remote description is applied.
    pub async fn add_candidate(&mut self, candidate: IceCandidate) -> SessionResult<()> {
        if self.state.is_terminal() {
            return Err(SessionError::violation(
                &self.peer_id,
                format!("candidate in state {}", self.state),
            ));
        }
        if !self.remote_applied {
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.transport.add_ice_candidate(candidate).await
    }

    /// Adopts candidates that arrived before this session existed.
    pub fn queue_candidates(&mut self, mut early: Vec<IceCandidate>) {
        early.append(&mut self.pending_candidates);
        self.pending_candidates = early;
    }

    /// Candidates not yet applied; used when a replacement session takes over.
    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }

    async fn flush_candidates(&mut self) {
        let queued = std::mem::take(&mut self.pending_candidates);
        if !queued.is_empty() {
            debug!(peer=%self.peer_id, count=queued.len(), "replaying queued candidates");
        }
        for c in queued {
            if let Err(e) = self.transport.add_ice_candidate(c).await {
                warn!(peer=%self.peer_id, "queued candidate rejected: {e}");
            }
        }
    }

    /// Returns the new state if the transport report changed it.
    pub fn on_transport_state(&mut self, st: TransportState) -> Option<SessionState> {
        let before = self.state;
        match st {
            TransportState::Connecting => {}
            TransportState::Connected => {
                if !self.state.is_terminal() {
                    self.set_state(SessionState::Connected);
                }
            }
            TransportState::Disconnected => {
                debug!(peer=%self.peer_id, "transport disconnected, waiting for recovery");
            }
            TransportState::Failed => {
                if !self.state.is_terminal() {
                    self.set_state(SessionState::Failed);
                }
            }
            TransportState::Closed => {
                if !self.state.is_terminal() {
                    self.set_state(SessionState::Closed);
                }
            }
        }
        (self.state != before).then_some(self.state)
    }

    pub fn on_channel_open(&mut self, channel: Arc<dyn DataChannel>) -> Option<SessionState> {
        if self.state.is_terminal() {
            return None;
        }
        info!(peer=%self.peer_id, label=%channel.label(), "data channel open");
        self.channel = Some(channel.clone());
        self.channel_tx.send_replace(Some(channel));
        let before = self.state;
        self.set_state(SessionState::Connected);
        (self.state != before).then_some(self.state)
    }

    pub fn on_channel_closed(&mut self) -> Option<SessionState> {
        self.channel = None;
        self.channel_tx.send_replace(None);
        if self.decoder.abort().is_some() {
            debug!(peer=%self.peer_id, "inbound transfer dropped with channel");
        }
        if self.state.is_terminal() {
            return None;
        }
        self.set_state(SessionState::Closed);
        Some(SessionState::Closed)
    }

    pub fn fail(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        warn!(peer=%self.peer_id, session=self.id, "session failed: {reason}");
        self.decoder.abort();
        self.set_state(SessionState::Failed);
    }

    pub fn ingest(&mut self, message: ChannelMessage) -> SessionResult<Option<Inbound>> {
        self.decoder.ingest(message)
    }

    pub fn expire_transfer(&mut self, now: Instant, idle: Duration) -> Option<SessionError> {
        self.decoder.expire_stale(now, idle)
    }

    pub fn has_transfer(&self) -> bool {
        self.decoder.in_progress().is_some()
    }

    /// Negotiation (or channel open after Connected) has not completed
    /// within `timeout`.
    pub fn is_stalled(&self, now: Instant, timeout: Duration) -> bool {
        let waiting = self.state.is_negotiating() || (self.state == SessionState::Connected && self.channel.is_none());
        waiting && now.saturating_duration_since(self.state_since) >= timeout
    }

    /// Closes the data channel, then the transport. Any partial inbound
    /// transfer is dropped.
    pub async fn close(&mut self) {
        self.decoder.abort();
        if let Some(ch) = self.channel.take() {
            if let Err(e) = ch.close().await {
                debug!(peer=%self.peer_id, "channel close: {e}");
            }
        }
        self.channel_tx.send_replace(None);
        if let Err(e) = self.transport.close().await {
            debug!(peer=%self.peer_id, "transport close: {e}");
        }
        if !self.state.is_terminal() {
            self.set_state(SessionState::Closed);
        }
    }
}

/// Caller-side view of a session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    peer_id: String,
    session_id: u64,
    state_rx: watch::Receiver<SessionState>,
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id && self.peer_id == other.peer_id
    }
}

impl SessionHandle {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Resolves once Connected; `PeerUnreachable` on Failed, Closed or timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> SessionResult<()> {
        let mut rx = self.state_rx.clone();
        let peer = self.peer_id.clone();
        let wait = async move {
            loop {
                let st = *rx.borrow_and_update();
                match st {
                    SessionState::Connected => return Ok(()),
                    SessionState::Failed | SessionState::Closed => {
                        return Err(SessionError::PeerUnreachable(format!("{peer}: session {st}")))
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    let st = *rx.borrow();
                    if st == SessionState::Connected {
                        return Ok(());
                    }
                    return Err(SessionError::PeerUnreachable(format!("{peer}: session {st}")));
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(res) => res,
            Err(_) => Err(SessionError::PeerUnreachable(format!("{}: connect timed out", self.peer_id))),
        }
    }
}
