/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

#![allow(dead_code)]

use std::time::Duration;

use inet3_core::identity::{LocalIdentity, StaticIdentity};
use inet3_core::manager::{ManagerSettings, SessionEvent, SessionManager};
use inet3_core::memory::MemoryNetwork;
use inet3_core::relay_client::RelayHandle;
use inet3_core::SessionState;
use inet3_protocol::Envelope;
use tokio::sync::{mpsc, watch};

pub const WAIT: Duration = Duration::from_secs(5);

/// A manager wired to an in-memory network and a detached relay handle.
pub struct Peer {
    pub id: String,
    pub manager: SessionManager,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub relay_up: watch::Sender<bool>,
    pub outbound: Option<mpsc::Receiver<Envelope>>,
    pub inbound: mpsc::Sender<Envelope>,
}

pub fn settings() -> ManagerSettings {
    ManagerSettings {
        connect_timeout: Duration::from_secs(5),
        transfer_idle_timeout: Duration::from_secs(5),
        sweep_interval: Duration::from_millis(50),
        chunk_size: 16 * 1024,
        max_transfer_bytes: 64 * 1024 * 1024,
    }
}

pub fn peer(net: &MemoryNetwork, id: &str) -> Peer {
    peer_with(net, id, settings())
}

pub fn peer_with(net: &MemoryNetwork, id: &str, settings: ManagerSettings) -> Peer {
    let (relay, outbound, relay_up) = RelayHandle::detached(256);
    let (inbound, inbound_rx) = mpsc::channel(256);
    let identity = StaticIdentity(LocalIdentity::new(id, id, &format!("pk-{id}")));
    let (manager, events) = SessionManager::start(&identity, settings, relay, inbound_rx, net.factory(id));
    Peer {
        id: id.to_string(),
        manager,
        events,
        relay_up,
        outbound: Some(outbound),
        inbound,
    }
}

/// Pipes every envelope `rx` yields into `tx`, the way the relay would.
pub fn forward(mut rx: mpsc::Receiver<Envelope>, tx: mpsc::Sender<Envelope>) {
    tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            if tx.send(env).await.is_err() {
                break;
            }
        }
    });
}

pub fn link(a: &mut Peer, b: &mut Peer) {
    if let Some(rx) = a.outbound.take() {
        forward(rx, b.inbound.clone());
    }
    if let Some(rx) = b.outbound.take() {
        forward(rx, a.inbound.clone());
    }
}

pub fn linked_pair(net: &MemoryNetwork, a: &str, b: &str) -> (Peer, Peer) {
    let mut pa = peer(net, a);
    let mut pb = peer(net, b);
    link(&mut pa, &mut pb);
    (pa, pb)
}

pub async fn next_envelope(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("relay queue closed")
}

/// Waits for the first event `f` maps to `Some`, skipping the rest.
pub async fn wait_for<T>(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut f: impl FnMut(&SessionEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let ev = events.recv().await.expect("event stream closed");
            if let Some(t) = f(&ev) {
                return t;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_state(events: &mut mpsc::UnboundedReceiver<SessionEvent>, peer: &str, want: SessionState) {
    wait_for(events, |ev| match ev {
        SessionEvent::StateChanged { peer_id, state } if peer_id == peer && *state == want => Some(()),
        _ => None,
    })
    .await
}

pub async fn wait_chat(events: &mut mpsc::UnboundedReceiver<SessionEvent>, from: &str) -> String {
    wait_for(events, |ev| match ev {
        SessionEvent::Chat { peer_id, message } if peer_id == from => Some(message.content.clone()),
        _ => None,
    })
    .await
}

/// Polls until `manager` reports `remote` as Connected.
pub async fn until_connected(manager: &SessionManager, remote: &str) {
    tokio::time::timeout(WAIT, async {
        loop {
            if manager.state(remote).await == Some(SessionState::Connected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer never connected")
}

/// Connects `a` to `b` over a linked pair and waits for both sides.
pub async fn connect_pair(a: &mut Peer, b: &mut Peer) {
    let handle = a
        .manager
        .connect(&b.id, &format!("pk-{}", b.id))
        .await
        .expect("connect");
    handle.wait_connected(WAIT).await.expect("offerer connected");
    until_connected(&b.manager, &a.id).await;
}
