/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Relay connection is down or was never established.
    #[error("signaling relay unavailable")]
    SignalingUnavailable,
    /// Transport negotiation failed or timed out.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),
    /// Envelope applied to a session in a state that does not expect it.
    #[error("protocol violation from {peer}: {detail}")]
    ProtocolViolation { peer: String, detail: String },
    #[error("channel to {0} is not open")]
    ChannelNotOpen(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("transfer {name:?} size mismatch: expected {expected} bytes, got {received}")]
    TransferSizeMismatch {
        name: String,
        expected: u64,
        received: u64,
    },
    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    pub fn violation(peer: &str, detail: impl Into<String>) -> Self {
        SessionError::ProtocolViolation {
            peer: peer.to_string(),
            detail: detail.into(),
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        SessionError::Transport(format!("{err:#}"))
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
