/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Line commands understood by the `inet3_node` console.

use tokio::sync::mpsc;
use tracing::warn;

use crate::manager::SessionManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect { peer: String, public_key: String },
    Disconnect { peer: String },
    Msg { peer: String, text: String },
    File { peer: String, path: String },
    Peers,
    History { peer: String },
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((c, r)) => (c, r.trim()),
            None => (line, ""),
        };
        let mut words = rest.splitn(2, char::is_whitespace);
        let first = words.next().unwrap_or("").trim().to_string();
        let tail = words.next().unwrap_or("").trim().to_string();

        match cmd {
            "/connect" if !first.is_empty() => Ok(ConsoleCommand::Connect {
                peer: first,
                public_key: tail,
            }),
            "/disconnect" if !first.is_empty() => Ok(ConsoleCommand::Disconnect { peer: first }),
            "/msg" if !first.is_empty() && !tail.is_empty() => Ok(ConsoleCommand::Msg { peer: first, text: tail }),
            "/file" if !first.is_empty() && !tail.is_empty() => Ok(ConsoleCommand::File { peer: first, path: tail }),
            "/peers" => Ok(ConsoleCommand::Peers),
            "/history" if !first.is_empty() => Ok(ConsoleCommand::History { peer: first }),
            "/quit" | "/exit" => Ok(ConsoleCommand::Quit),
            _ => Err(format!("unknown command: {line}")),
        }
    }
}

pub const HELP: &str = "\
/connect <peer> [public-key]
/disconnect <peer>
/msg <peer> <text>
/file <peer> <path>
/peers
/history <peer>
/quit";

/// Chat queued from the console. Messages go out one at a time, in queue
/// order, on a task of their own so the console keeps reading while a file
/// holds the peer's send lock.
#[derive(Clone)]
pub struct ChatOutbox {
    tx: mpsc::UnboundedSender<(String, String)>,
}

impl ChatOutbox {
    pub fn spawn(manager: SessionManager) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();
        tokio::spawn(async move {
            while let Some((peer, text)) = rx.recv().await {
                if let Err(e) = manager.send(&peer, &text).await {
                    warn!(peer=%peer, "chat not sent: {e}");
                }
            }
        });
        Self { tx }
    }

    /// Returns false once the outbox task is gone.
    pub fn push(&self, peer: &str, text: &str) -> bool {
        self.tx.send((peer.to_string(), text.to_string())).is_ok()
    }
}
