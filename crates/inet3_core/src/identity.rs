/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use inet3_protocol::Envelope;

use crate::config::CoreConfig;

/// The local user as seen by peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalIdentity {
    pub peer_id: String,
    pub username: String,
    pub public_key: String,
}

impl LocalIdentity {
    pub fn new(peer_id: &str, username: &str, public_key: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            username: username.to_string(),
            public_key: public_key.to_string(),
        }
    }

    pub fn announce(&self) -> Envelope {
        Envelope::Announce {
            user_id: self.peer_id.clone(),
            username: self.username.clone(),
            public_key: self.public_key.clone(),
        }
    }
}

/// A remote peer as supplied by the contact list. The key is carried along
/// with the session but never checked here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactIdentity {
    pub peer_id: String,
    pub public_key: String,
}

/// Source of the local key-pair identity (key management lives elsewhere).
pub trait IdentityProvider: Send + Sync {
    fn local_identity(&self) -> LocalIdentity;
}

/// Identity taken verbatim from configuration.
#[derive(Clone, Debug)]
pub struct StaticIdentity(pub LocalIdentity);

impl IdentityProvider for StaticIdentity {
    fn local_identity(&self) -> LocalIdentity {
        self.0.clone()
    }
}

impl From<&CoreConfig> for StaticIdentity {
    fn from(cfg: &CoreConfig) -> Self {
        let username = if cfg.username.trim().is_empty() {
            cfg.self_id.clone()
        } else {
            cfg.username.clone()
        };
        StaticIdentity(LocalIdentity::new(&cfg.self_id, &username, &cfg.public_key))
    }
}
