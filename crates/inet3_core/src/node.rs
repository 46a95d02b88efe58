/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::CoreConfig;
use crate::framer::ReceivedFile;
use crate::identity::IdentityProvider;
use crate::manager::{ManagerSettings, SessionEvent, SessionManager};
use crate::relay_client::RelayClient;
use crate::webrtc_transport::WebrtcTransportFactory;

/// A running node: relay connection, WebRTC transports and the session
/// manager on top of them.
pub struct Node {
    pub manager: SessionManager,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    pub fn shutdown(&self) {
        self.manager.shutdown();
        let _ = self.shutdown_tx.send(true);
    }
}

pub async fn start_node(cfg: &CoreConfig, identity: &dyn IdentityProvider) -> Result<Node> {
    cfg.validate()?;
    let local = identity.local_identity();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (relay, inbound) = RelayClient::connect(&cfg.relay_ws, &local, shutdown_rx)
        .await
        .with_context(|| format!("connect relay {}", cfg.relay_ws))?;

    let factory = Arc::new(WebrtcTransportFactory::from_config(cfg));
    let (manager, events) = SessionManager::start(identity, ManagerSettings::from(cfg), relay, inbound, factory);
    info!(peer=%local.peer_id, ice_servers=cfg.ice_urls().len(), "node started");
    Ok(Node {
        manager,
        events,
        shutdown_tx,
    })
}

/// Keeps only the final path component and characters safe on every
/// platform.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned = base
        .chars()
        .map(|c| if c.is_control() || ":*?\"<>|".contains(c) { '_' } else { c })
        .collect::<String>();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "received.bin".to_string()
    } else {
        cleaned
    }
}

/// Writes `file` into `dir` without overwriting: `a.txt`, `a (1).txt`, ...
pub async fn save_received_file(dir: &Path, file: &ReceivedFile) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create {}", dir.display()))?;
    let name = sanitize_file_name(&file.name);
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s.to_string(), format!(".{e}")),
        _ => (name.clone(), String::new()),
    };
    for n in 0..1000u32 {
        let candidate = if n == 0 {
            dir.join(&name)
        } else {
            dir.join(format!("{stem} ({n}){ext}"))
        };
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await;
        let mut f = match opened {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).with_context(|| format!("create {}", candidate.display())),
        };
        f.write_all(&file.bytes)
            .await
            .with_context(|| format!("write {}", candidate.display()))?;
        f.flush().await?;
        return Ok(candidate);
    }
    anyhow::bail!("no free file name for {name} in {}", dir.display())
}
