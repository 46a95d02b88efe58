/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Boundary between the session state machine and whatever actually moves
//! bytes between peers.
//!
//! Transports never call back into the session layer. Every callback they
//! receive (local candidate gathered, connection state change, channel
//! open/message/close) is turned into a [`TransportEvent`] and pushed onto the
//! manager's queue through an [`EventSink`], so the registry is only mutated
//! from one place.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use inet3_protocol::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::error::SessionResult;

/// One frame as delivered by a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub enum TransportEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelMessage(ChannelMessage),
    ChannelClosed,
}

impl std::fmt::Debug for TransportEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEventKind::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            TransportEventKind::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            TransportEventKind::ChannelOpen(ch) => f.debug_tuple("ChannelOpen").field(&ch.label()).finish(),
            TransportEventKind::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(m).finish(),
            TransportEventKind::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

#[derive(Debug)]
pub struct TransportEvent {
    pub peer_id: String,
    /// Session generation the transport was created for; events from a
    /// replaced session are discarded by the manager.
    pub session: u64,
    pub kind: TransportEventKind,
}

/// Handle a transport uses to report events for one session.
#[derive(Clone, Debug)]
pub struct EventSink {
    peer_id: String,
    session: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn new(peer_id: &str, session: u64, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            session,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn emit(&self, kind: TransportEventKind) {
        // Receiver gone means the manager shut down.
        let _ = self.tx.send(TransportEvent {
            peer_id: self.peer_id.clone(),
            session: self.session,
            kind,
        });
    }
}

/// Connection to one remote peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates the data channel, then an offer installed as local description.
    async fn create_offer(&self) -> SessionResult<SessionDescription>;
    /// Answers the applied remote offer; the answer becomes the local description.
    async fn create_answer(&self) -> SessionResult<SessionDescription>;
    async fn set_remote_description(&self, desc: SessionDescription) -> SessionResult<()>;
    /// Fails if no remote description has been applied yet.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> SessionResult<()>;
    async fn close(&self) -> SessionResult<()>;
}

/// Ordered, reliable message channel on top of an established transport.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: String) -> SessionResult<()>;
    async fn send_binary(&self, data: Bytes) -> SessionResult<()>;
    async fn close(&self) -> SessionResult<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, peer_id: &str, events: EventSink) -> SessionResult<Arc<dyn PeerTransport>>;
}
