/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire types shared by peers and the signaling relay.
//!
//! Two layers live here: relay [`Envelope`]s (session negotiation, JSON text
//! frames over the relay WebSocket) and data-channel [`ControlFrame`]s (JSON
//! text frames inside an established channel). Raw file bytes travel as
//! binary channel frames and have no type here.

use serde::{Deserialize, Serialize};

/// Session description as produced by the underlying transport.
/// Opaque to everything except the transport that generated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// Connectivity candidate, in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

/// Signaling message exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "announce")]
    Announce {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(default)]
        username: String,
        #[serde(rename = "publicKey", default)]
        public_key: String,
    },
    #[serde(rename = "offer")]
    Offer {
        sender: String,
        target: String,
        offer: SessionDescription,
    },
    #[serde(rename = "answer")]
    Answer {
        sender: String,
        target: String,
        answer: SessionDescription,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        sender: String,
        target: String,
        candidate: IceCandidate,
    },
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Announce { .. } => "announce",
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// Originating peer. For `announce` this is the announced id.
    pub fn sender(&self) -> &str {
        match self {
            Envelope::Announce { user_id, .. } => user_id,
            Envelope::Offer { sender, .. }
            | Envelope::Answer { sender, .. }
            | Envelope::IceCandidate { sender, .. } => sender,
        }
    }

    /// Addressed peer; `announce` is addressed to the relay itself.
    pub fn target(&self) -> Option<&str> {
        match self {
            Envelope::Announce { .. } => None,
            Envelope::Offer { target, .. }
            | Envelope::Answer { target, .. }
            | Envelope::IceCandidate { target, .. } => Some(target),
        }
    }

    /// Rewrites the sender of a routed envelope. No-op for `announce`.
    pub fn set_sender(&mut self, id: &str) {
        match self {
            Envelope::Announce { .. } => {}
            Envelope::Offer { sender, .. }
            | Envelope::Answer { sender, .. }
            | Envelope::IceCandidate { sender, .. } => {
                *sender = id.to_string();
            }
        }
    }
}

/// Structured (text) frame carried on an open data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlFrame {
    #[serde(rename = "chat")]
    Chat {
        content: String,
        /// RFC 3339 / ISO 8601.
        timestamp: String,
    },
    #[serde(rename = "file-start")]
    FileStart {
        name: String,
        size: u64,
        #[serde(rename = "fileType", default)]
        file_type: String,
    },
    #[serde(rename = "file-end")]
    FileEnd { name: String },
}
