/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Session registry and the single task that mutates it.
//!
//! Relay envelopes and transport events are both drained by one dispatcher
//! loop; public operations take the same registry lock. Transports never touch
//! the registry directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use inet3_protocol::{Envelope, IceCandidate, SessionDescription};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::{CoreConfig, DEFAULT_CHUNK_SIZE};
use crate::error::{SessionError, SessionResult};
use crate::framer::{self, FileUpload, Inbound, ReceivedFile};
use crate::identity::{ContactIdentity, IdentityProvider, LocalIdentity};
use crate::relay_client::RelayHandle;
use crate::session::{PeerSession, Role, SessionHandle, SessionState};
use crate::transport::{DataChannel, EventSink, TransportEvent, TransportEventKind, TransportFactory};

/// One entry of the per-peer conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: String,
    pub content: String,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged { peer_id: String, state: SessionState },
    Chat { peer_id: String, message: Message },
    FileReceived { peer_id: String, file: ReceivedFile },
    Error { peer_id: String, error: SessionError },
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub connect_timeout: Duration,
    pub transfer_idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub chunk_size: usize,
    pub max_transfer_bytes: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            transfer_idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(2),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_transfer_bytes: 256 * 1024 * 1024,
        }
    }
}

impl From<&CoreConfig> for ManagerSettings {
    fn from(cfg: &CoreConfig) -> Self {
        Self {
            connect_timeout: cfg.connect_timeout(),
            transfer_idle_timeout: cfg.transfer_idle_timeout(),
            sweep_interval: cfg.sweep_interval(),
            chunk_size: cfg.chunk_size(),
            max_transfer_bytes: cfg.max_transfer_bytes(),
        }
    }
}

/// Bounds on candidates held for peers that have no session yet.
const MAX_PENDING_PEERS: usize = 64;
const MAX_PENDING_PER_PEER: usize = 32;

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, PeerSession>,
    /// Candidates for peers with no live session yet.
    pending_candidates: HashMap<String, Vec<(Instant, IceCandidate)>>,
    logs: HashMap<String, Vec<Message>>,
    next_session_id: u64,
}

impl Registry {
    /// Holds a candidate that arrived ahead of its session. Returns false
    /// when it was dropped because a bound was hit.
    fn queue_early_candidate(&mut self, peer_id: &str, candidate: IceCandidate, now: Instant) -> bool {
        if !self.pending_candidates.contains_key(peer_id) && self.pending_candidates.len() >= MAX_PENDING_PEERS {
            return false;
        }
        let queued = self.pending_candidates.entry(peer_id.to_string()).or_default();
        if queued.len() >= MAX_PENDING_PER_PEER {
            return false;
        }
        queued.push((now, candidate));
        true
    }
}

struct Inner {
    local: LocalIdentity,
    settings: ManagerSettings,
    relay: RelayHandle,
    factory: Arc<dyn TransportFactory>,
    registry: Mutex<Registry>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Spawns the dispatcher. `inbound` is the relay's envelope stream.
    pub fn start(
        identity: &dyn IdentityProvider,
        settings: ManagerSettings,
        relay: RelayHandle,
        inbound: mpsc::Receiver<Envelope>,
        factory: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            local: identity.local_identity(),
            settings,
            relay,
            factory,
            registry: Mutex::new(Registry::default()),
            transport_tx,
            events_tx,
            shutdown_tx,
        });
        tokio::spawn(run_dispatcher(inner.clone(), inbound, transport_rx, shutdown_rx));
        info!(peer=%inner.local.peer_id, "session manager started");
        (Self { inner }, events_rx)
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local.peer_id
    }

    pub fn relay_connected(&self) -> bool {
        self.inner.relay.is_connected()
    }

    /// Idempotent: a live (negotiating or connected) session is returned as is.
    /// A Failed or Closed one is replaced.
    pub async fn connect(&self, peer_id: &str, public_key: &str) -> SessionResult<SessionHandle> {
        let inner = &self.inner;
        let mut guard = inner.registry.lock().await;
        let reg = &mut *guard;
        if let Some(s) = reg.sessions.get(peer_id) {
            if !s.state().is_terminal() {
                return Ok(s.handle());
            }
        }
        if !inner.relay.is_connected() {
            return Err(SessionError::SignalingUnavailable);
        }
        if peer_id.trim().is_empty() || peer_id == inner.local.peer_id {
            return Err(SessionError::PeerUnreachable(format!("invalid peer id {peer_id:?}")));
        }
        if let Some(mut old) = reg.sessions.remove(peer_id) {
            old.close().await;
        }

        let mut session = inner.new_session(reg, peer_id, public_key, Role::Offerer).await?;
        let offer = match session.start_offer().await {
            Ok(v) => v,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };
        let envelope = Envelope::Offer {
            sender: inner.local.peer_id.clone(),
            target: peer_id.to_string(),
            offer,
        };
        if let Err(e) = inner.relay.send(envelope).await {
            session.close().await;
            return Err(e);
        }
        let handle = session.handle();
        reg.sessions.insert(peer_id.to_string(), session);
        info!(peer=%peer_id, "offer sent");
        inner.emit_state(peer_id, SessionState::OfferSent);
        Ok(handle)
    }

    /// Closes the data channel, then the transport. No-op for unknown peers.
    pub async fn disconnect(&self, peer_id: &str) {
        let mut guard = self.inner.registry.lock().await;
        guard.pending_candidates.remove(peer_id);
        let Some(mut session) = guard.sessions.remove(peer_id) else {
            return;
        };
        let was = session.state();
        session.close().await;
        drop(guard);
        info!(peer=%peer_id, "disconnected");
        if was != SessionState::Closed {
            self.inner.emit_state(peer_id, SessionState::Closed);
        }
    }

    /// Sends one chat message and records it in the peer's log.
    pub async fn send(&self, peer_id: &str, text: &str) -> SessionResult<()> {
        let (channel, send_lock) = self.ready_channel(peer_id).await?;
        let _sending = send_lock.lock().await;
        let ts = framer::send_chat(&*channel, peer_id, text).await?;
        let message = Message {
            sender: self.inner.local.peer_id.clone(),
            content: text.to_string(),
            timestamp: parse_timestamp(&ts),
        };
        self.inner
            .registry
            .lock()
            .await
            .logs
            .entry(peer_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    /// Streams a file; chat to the same peer waits until it is done.
    pub async fn send_file(&self, peer_id: &str, upload: FileUpload) -> SessionResult<u64> {
        let (channel, send_lock) = self.ready_channel(peer_id).await?;
        let _sending = send_lock.lock().await;
        let name = upload.name.clone();
        let sent = framer::send_file(&*channel, peer_id, upload, self.inner.settings.chunk_size).await?;
        info!(peer=%peer_id, %name, bytes=sent, "file sent");
        Ok(sent)
    }

    async fn ready_channel(&self, peer_id: &str) -> SessionResult<(Arc<dyn DataChannel>, Arc<Mutex<()>>)> {
        let (channel_rx, state_rx, send_lock) = {
            let reg = self.inner.registry.lock().await;
            let Some(s) = reg.sessions.get(peer_id) else {
                return Err(SessionError::ChannelNotOpen(peer_id.to_string()));
            };
            if s.state() != SessionState::Connected {
                return Err(SessionError::ChannelNotOpen(peer_id.to_string()));
            }
            (s.channel_watch(), s.state_watch(), s.send_lock())
        };
        let channel = wait_for_channel(peer_id, channel_rx, state_rx, self.inner.settings.connect_timeout).await?;
        Ok((channel, send_lock))
    }

    pub async fn list_connected(&self) -> Vec<String> {
        let reg = self.inner.registry.lock().await;
        let mut out = reg
            .sessions
            .iter()
            .filter(|(_, s)| s.state() == SessionState::Connected)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        out.sort();
        out
    }

    pub async fn history(&self, peer_id: &str) -> Vec<Message> {
        let reg = self.inner.registry.lock().await;
        reg.logs.get(peer_id).cloned().unwrap_or_default()
    }

    pub async fn clear_history(&self, peer_id: &str) {
        self.inner.registry.lock().await.logs.remove(peer_id);
    }

    pub async fn state(&self, peer_id: &str) -> Option<SessionState> {
        let reg = self.inner.registry.lock().await;
        reg.sessions.get(peer_id).map(|s| s.state())
    }

    pub async fn handle(&self, peer_id: &str) -> Option<SessionHandle> {
        let reg = self.inner.registry.lock().await;
        reg.sessions.get(peer_id).map(|s| s.handle())
    }

    pub async fn contact(&self, peer_id: &str) -> Option<ContactIdentity> {
        let reg = self.inner.registry.lock().await;
        reg.sessions.get(peer_id).map(|s| ContactIdentity {
            peer_id: s.peer_id().to_string(),
            public_key: s.public_key().to_string(),
        })
    }

    /// Stops the dispatcher; every session is closed on the way out.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }
}

fn parse_timestamp(ts: &str) -> OffsetDateTime {
    OffsetDateTime::parse(ts, &Rfc3339).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Resolves once the channel is open. Gives up with `ChannelNotOpen` when the
/// session turns terminal or `timeout` passes.
async fn wait_for_channel(
    peer_id: &str,
    mut channel_rx: watch::Receiver<Option<Arc<dyn DataChannel>>>,
    mut state_rx: watch::Receiver<SessionState>,
    timeout: Duration,
) -> SessionResult<Arc<dyn DataChannel>> {
    let not_open = || SessionError::ChannelNotOpen(peer_id.to_string());
    let wait = async {
        loop {
            if state_rx.borrow_and_update().is_terminal() {
                return Err(not_open());
            }
            let current = channel_rx.borrow_and_update().clone();
            if let Some(ch) = current {
                if ch.is_open() {
                    return Ok(ch);
                }
            }
            tokio::select! {
                res = channel_rx.changed() => {
                    if res.is_err() {
                        return Err(not_open());
                    }
                }
                res = state_rx.changed() => {
                    if res.is_err() {
                        return Err(not_open());
                    }
                }
            }
        }
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(res) => res,
        Err(_) => Err(not_open()),
    }
}

async fn run_dispatcher(
    inner: Arc<Inner>,
    mut inbound: mpsc::Receiver<Envelope>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(inner.settings.sweep_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut relay_open = true;

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                inner.sweep().await;
            }
            env = inbound.recv(), if relay_open => {
                match env {
                    Some(env) => inner.on_envelope(env).await,
                    None => {
                        warn!(peer=%inner.local.peer_id, "relay inbound closed");
                        relay_open = false;
                    }
                }
            }
            ev = transport_rx.recv() => {
                let Some(ev) = ev else { break; };
                inner.on_transport_event(ev).await;
            }
        }
    }

    inner.close_all().await;
    info!(peer=%inner.local.peer_id, "session manager stopped");
}

impl Inner {
    fn emit(&self, ev: SessionEvent) {
        let _ = self.events_tx.send(ev);
    }

    fn emit_state(&self, peer_id: &str, state: SessionState) {
        self.emit(SessionEvent::StateChanged {
            peer_id: peer_id.to_string(),
            state,
        });
    }

    fn emit_error(&self, peer_id: &str, error: SessionError) {
        self.emit(SessionEvent::Error {
            peer_id: peer_id.to_string(),
            error,
        });
    }

    async fn new_session(
        &self,
        reg: &mut Registry,
        peer_id: &str,
        public_key: &str,
        role: Role,
    ) -> SessionResult<PeerSession> {
        reg.next_session_id += 1;
        let id = reg.next_session_id;
        let sink = EventSink::new(peer_id, id, self.transport_tx.clone());
        let transport = self.factory.create(peer_id, sink).await?;
        let mut session = PeerSession::new(
            peer_id,
            public_key,
            id,
            role,
            transport,
            self.settings.max_transfer_bytes,
        );
        if let Some(early) = reg.pending_candidates.remove(peer_id) {
            session.queue_candidates(early.into_iter().map(|(_, c)| c).collect());
        }
        Ok(session)
    }

    /// Marks the session Failed, closes its transport and reports it. The
    /// entry stays in the registry so its state can still be queried.
    async fn fail_session(&self, session: &mut PeerSession, error: SessionError) {
        session.fail(&error.to_string());
        session.close().await;
        self.emit_error(session.peer_id(), error);
        self.emit_state(session.peer_id(), SessionState::Failed);
    }

    async fn on_envelope(&self, env: Envelope) {
        if env.target() != Some(self.local.peer_id.as_str()) {
            debug!(kind=env.kind(), target=?env.target(), "envelope not for us dropped");
            return;
        }
        let peer_id = env.sender().to_string();
        if peer_id.is_empty() || peer_id == self.local.peer_id {
            debug!(kind=env.kind(), "envelope with bad sender dropped");
            return;
        }
        match env {
            Envelope::Offer { offer, .. } => self.on_offer(&peer_id, offer).await,
            Envelope::Answer { answer, .. } => self.on_answer(&peer_id, answer).await,
            Envelope::IceCandidate { candidate, .. } => self.on_remote_candidate(&peer_id, candidate).await,
            Envelope::Announce { .. } => {}
        }
    }

    async fn on_offer(&self, peer_id: &str, offer: SessionDescription) {
        let mut guard = self.registry.lock().await;
        let reg = &mut *guard;
        let mut carried = Vec::new();
        let mut public_key = String::new();
        if let Some(existing) = reg.sessions.get(peer_id) {
            if existing.state() == SessionState::OfferSent && self.local.peer_id.as_str() < peer_id {
                info!(peer=%peer_id, "offer glare: keeping our own offer");
                return;
            }
            if let Some(mut old) = reg.sessions.remove(peer_id) {
                info!(peer=%peer_id, state=%old.state(), "inbound offer replaces session");
                carried = old.take_pending_candidates();
                public_key = old.public_key().to_string();
                old.close().await;
            }
        }

        let mut session = match self.new_session(reg, peer_id, &public_key, Role::Answerer).await {
            Ok(s) => s,
            Err(e) => {
                warn!(peer=%peer_id, "transport create failed: {e}");
                self.emit_error(peer_id, e);
                return;
            }
        };
        session.queue_candidates(carried);
        let answer = match session.accept_offer(offer).await {
            Ok(a) => a,
            Err(e) => {
                warn!(peer=%peer_id, "answering offer failed: {e}");
                self.fail_session(&mut session, e).await;
                reg.sessions.insert(peer_id.to_string(), session);
                return;
            }
        };
        let envelope = Envelope::Answer {
            sender: self.local.peer_id.clone(),
            target: peer_id.to_string(),
            answer,
        };
        if let Err(e) = self.relay.send(envelope).await {
            warn!(peer=%peer_id, "sending answer failed: {e}");
            self.fail_session(&mut session, e).await;
            reg.sessions.insert(peer_id.to_string(), session);
            return;
        }
        reg.sessions.insert(peer_id.to_string(), session);
        info!(peer=%peer_id, "answer sent");
        self.emit_state(peer_id, SessionState::AnswerSent);
    }

    async fn on_answer(&self, peer_id: &str, answer: SessionDescription) {
        let mut guard = self.registry.lock().await;
        let Some(session) = guard.sessions.get_mut(peer_id) else {
            warn!(peer=%peer_id, "answer for unknown session dropped");
            return;
        };
        match session.apply_answer(answer).await {
            Ok(()) => {
                info!(peer=%peer_id, "answer applied");
                self.emit_state(peer_id, SessionState::Connected);
            }
            Err(e) => {
                warn!(peer=%peer_id, "answer rejected: {e}");
                self.fail_session(session, e).await;
            }
        }
    }

    async fn on_remote_candidate(&self, peer_id: &str, candidate: IceCandidate) {
        let mut guard = self.registry.lock().await;
        let reg = &mut *guard;
        match reg.sessions.get_mut(peer_id) {
            Some(session) if !session.state().is_terminal() => {
                if let Err(e) = session.add_candidate(candidate).await {
                    warn!(peer=%peer_id, "remote candidate rejected: {e}");
                }
            }
            _ => {
                // Probably ahead of the offer it belongs to.
                if !reg.queue_early_candidate(peer_id, candidate, Instant::now()) {
                    debug!(peer=%peer_id, "early candidate dropped, queue full");
                }
            }
        }
    }

    async fn on_transport_event(&self, ev: TransportEvent) {
        let mut guard = self.registry.lock().await;
        let reg = &mut *guard;
        let peer_id = ev.peer_id;
        let Some(session) = reg.sessions.get_mut(&peer_id).filter(|s| s.id() == ev.session) else {
            debug!(peer=%peer_id, session=ev.session, event=?ev.kind, "event for stale session dropped");
            if let TransportEventKind::ChannelOpen(ch) = ev.kind {
                let _ = ch.close().await;
            }
            return;
        };

        match ev.kind {
            TransportEventKind::LocalCandidate(candidate) => {
                if session.state().is_terminal() {
                    return;
                }
                let envelope = Envelope::IceCandidate {
                    sender: self.local.peer_id.clone(),
                    target: peer_id.clone(),
                    candidate,
                };
                if let Err(e) = self.relay.send(envelope).await {
                    warn!(peer=%peer_id, "sending candidate failed: {e}");
                }
            }
            TransportEventKind::StateChanged(st) => match session.on_transport_state(st) {
                Some(SessionState::Failed) => {
                    let err = SessionError::PeerUnreachable(format!("{peer_id}: transport failed"));
                    session.close().await;
                    self.emit_error(&peer_id, err);
                    self.emit_state(&peer_id, SessionState::Failed);
                }
                Some(SessionState::Closed) => {
                    if let Some(mut s) = reg.sessions.remove(&peer_id) {
                        s.close().await;
                    }
                    info!(peer=%peer_id, "remote closed the connection");
                    self.emit_state(&peer_id, SessionState::Closed);
                }
                Some(state) => self.emit_state(&peer_id, state),
                None => {}
            },
            TransportEventKind::ChannelOpen(channel) => {
                if let Some(state) = session.on_channel_open(channel) {
                    self.emit_state(&peer_id, state);
                }
            }
            TransportEventKind::ChannelMessage(message) => match session.ingest(message) {
                Ok(Some(Inbound::Chat { content, timestamp })) => {
                    let message = Message {
                        sender: peer_id.clone(),
                        content,
                        timestamp: parse_timestamp(&timestamp),
                    };
                    reg.logs.entry(peer_id.clone()).or_default().push(message.clone());
                    self.emit(SessionEvent::Chat { peer_id, message });
                }
                Ok(Some(Inbound::File(file))) => {
                    info!(peer=%peer_id, name=%file.name, size=file.size, "file received");
                    self.emit(SessionEvent::FileReceived { peer_id, file });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(peer=%peer_id, "inbound frame rejected: {e}");
                    self.emit_error(&peer_id, e);
                }
            },
            TransportEventKind::ChannelClosed => {
                if session.on_channel_closed().is_some() {
                    if let Some(mut s) = reg.sessions.remove(&peer_id) {
                        s.close().await;
                    }
                    info!(peer=%peer_id, "data channel closed by remote");
                    self.emit_state(&peer_id, SessionState::Closed);
                }
            }
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let mut guard = self.registry.lock().await;
        let reg = &mut *guard;
        for (peer_id, session) in reg.sessions.iter_mut() {
            if session.is_stalled(now, self.settings.connect_timeout) {
                let err = SessionError::PeerUnreachable(format!(
                    "{peer_id}: no connection after {}s in state {}",
                    self.settings.connect_timeout.as_secs(),
                    session.state()
                ));
                self.fail_session(session, err).await;
                continue;
            }
            if let Some(err) = session.expire_transfer(now, self.settings.transfer_idle_timeout) {
                self.emit_error(peer_id, err);
            }
        }
        let ttl = self.settings.connect_timeout;
        reg.pending_candidates.retain(|peer_id, queued| {
            queued.retain(|(at, _)| now.saturating_duration_since(*at) < ttl);
            if queued.is_empty() {
                debug!(peer=%peer_id, "expired queued candidates");
            }
            !queued.is_empty()
        });
    }

    async fn close_all(&self) {
        let mut guard = self.registry.lock().await;
        for (_, mut session) in guard.sessions.drain() {
            session.close().await;
        }
        guard.pending_candidates.clear();
    }
}
