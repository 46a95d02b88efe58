/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod config;
pub mod console;
pub mod error;
pub mod framer;
pub mod identity;
pub mod manager;
pub mod memory;
pub mod node;
pub mod relay_client;
pub mod session;
pub mod transport;
pub mod webrtc_transport;

pub use error::{SessionError, SessionResult};
pub use manager::{Message, SessionEvent, SessionManager};
pub use session::{SessionHandle, SessionState};
