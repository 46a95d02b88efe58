/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;

use inet3_protocol::Envelope;
use tokio::sync::mpsc;

/// Outbound queue of one connected socket.
#[derive(Clone, Debug)]
pub struct PeerLink {
    pub conn_id: u64,
    pub tx: mpsc::Sender<String>,
}

/// Announced user id -> live socket. A newer socket for the same id wins.
#[derive(Default, Debug)]
pub struct PeerTable {
    peers: HashMap<String, PeerLink>,
}

impl PeerTable {
    /// Returns the link that was replaced, if any.
    pub fn register(&mut self, user_id: &str, link: PeerLink) -> Option<PeerLink> {
        self.peers.insert(user_id.to_string(), link)
    }

    /// Removes the entry only while it still belongs to `conn_id`.
    pub fn unregister(&mut self, user_id: &str, conn_id: u64) -> bool {
        match self.peers.get(user_id) {
            Some(link) if link.conn_id == conn_id => {
                self.peers.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, user_id: &str) -> Option<&PeerLink> {
        self.peers.get(user_id)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Announce { user_id: String, username: String },
    Forward { target: String, json: String },
}

#[derive(Debug, PartialEq, Eq)]
pub enum Rejected {
    Malformed(String),
    NotAnnounced,
    EmptyId,
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejected::Malformed(e) => write!(f, "malformed envelope: {e}"),
            Rejected::NotAnnounced => f.write_str("traffic before announce"),
            Rejected::EmptyId => f.write_str("empty user id"),
        }
    }
}

/// Decodes one text frame from a socket whose announced id is `announced`.
/// Routed envelopes get `sender` overwritten with that id.
pub fn classify(announced: Option<&str>, text: &str) -> Result<Inbound, Rejected> {
    let mut env: Envelope = serde_json::from_str(text).map_err(|e| Rejected::Malformed(e.to_string()))?;
    if let Envelope::Announce { user_id, username, .. } = &env {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(Rejected::EmptyId);
        }
        return Ok(Inbound::Announce {
            user_id: user_id.to_string(),
            username: username.clone(),
        });
    }
    let Some(announced) = announced else {
        return Err(Rejected::NotAnnounced);
    };
    env.set_sender(announced);
    let target = env.target().unwrap_or_default().to_string();
    if target.is_empty() {
        return Err(Rejected::EmptyId);
    }
    let json = serde_json::to_string(&env).map_err(|e| Rejected::Malformed(e.to_string()))?;
    Ok(Inbound::Forward { target, json })
}
