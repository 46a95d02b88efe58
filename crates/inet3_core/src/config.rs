/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
pub const DEFAULT_CHANNEL_LABEL: &str = "internet3Channel";

fn default_ice_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
        "stun:stun2.l.google.com:19302".to_string(),
    ]
}

/// Node configuration, read from a JSON file.
///
/// Every tuning knob is optional; the accessors clamp to sane ranges so a
/// hand-edited file cannot disable the timeouts entirely.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct CoreConfig {
    pub self_id: String,
    #[serde(default)]
    pub username: String,
    /// Public key string handed out by the identity provider. Announced to the
    /// relay, never used for crypto.
    #[serde(default)]
    pub public_key: String,
    pub relay_ws: String,
    /// STUN/TURN URLs (e.g. `stun:stun.l.google.com:19302`, `turn:turn.example:3478?transport=udp`).
    pub ice_urls: Option<Vec<String>>,
    /// Optional ICE username (TURN).
    pub ice_username: Option<String>,
    /// Optional ICE credential (TURN).
    pub ice_credential: Option<String>,
    /// Offer/answer + channel open deadline.
    pub connect_timeout_secs: Option<u64>,
    /// Inbound transfers without data for this long are discarded.
    pub transfer_idle_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub chunk_size: Option<usize>,
    pub max_transfer_bytes: Option<u64>,
    pub channel_label: Option<String>,
    pub download_dir: Option<String>,
}

impl CoreConfig {
    pub fn new(self_id: &str, relay_ws: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            username: self_id.to_string(),
            public_key: String::new(),
            relay_ws: relay_ws.to_string(),
            ice_urls: None,
            ice_username: None,
            ice_credential: None,
            connect_timeout_secs: None,
            transfer_idle_timeout_secs: None,
            sweep_interval_secs: None,
            chunk_size: None,
            max_transfer_bytes: None,
            channel_label: None,
            download_dir: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: CoreConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.self_id.trim().is_empty() {
            anyhow::bail!("self_id must not be empty");
        }
        if !(self.relay_ws.starts_with("ws://") || self.relay_ws.starts_with("wss://")) {
            anyhow::bail!("relay_ws must be a ws:// or wss:// url: {}", self.relay_ws);
        }
        Ok(())
    }

    pub fn ice_urls(&self) -> Vec<String> {
        match &self.ice_urls {
            Some(v) => v
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => default_ice_urls(),
        }
    }

    pub fn ice_username(&self) -> Option<String> {
        self.ice_username
            .clone()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn ice_credential(&self) -> Option<String> {
        self.ice_credential
            .clone()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(20).max(5).min(120))
    }

    pub fn transfer_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_idle_timeout_secs.unwrap_or(60).max(5).min(3600))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.unwrap_or(2).max(1).min(30))
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1).min(64 * 1024)
    }

    pub fn max_transfer_bytes(&self) -> u64 {
        self.max_transfer_bytes.unwrap_or(256 * 1024 * 1024).max(1024)
    }

    pub fn channel_label(&self) -> String {
        self.channel_label
            .clone()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_CHANNEL_LABEL.to_string())
    }

    pub fn download_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = self.download_dir.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        Ok(default_data_dir()?.join("downloads"))
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("INET3_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "inet3", "Internet3")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("INET3_CONFIG") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "inet3", "Internet3")
        .context("unable to determine platform config dir")?;
    Ok(proj.config_dir().join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_gets_clamped_defaults() {
        let cfg: CoreConfig =
            serde_json::from_str(r#"{"self_id":"alice","relay_ws":"ws://127.0.0.1:8790/ws"}"#).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(20));
        assert_eq!(cfg.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(cfg.channel_label(), DEFAULT_CHANNEL_LABEL);
        assert_eq!(cfg.ice_urls().len(), 3);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let mut cfg = CoreConfig::new("alice", "ws://relay");
        cfg.connect_timeout_secs = Some(1);
        cfg.sweep_interval_secs = Some(600);
        cfg.chunk_size = Some(0);
        cfg.ice_urls = Some(vec![" ".into(), " turn:t.example:3478 ".into()]);
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(30));
        assert_eq!(cfg.chunk_size(), 1);
        assert_eq!(cfg.ice_urls(), vec!["turn:t.example:3478".to_string()]);
    }

    #[test]
    fn rejects_non_websocket_relay() {
        let cfg = CoreConfig::new("alice", "http://relay.example");
        assert!(cfg.validate().is_err());
        let cfg = CoreConfig::new("  ", "ws://relay.example");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"self_id":"bob","username":"Bob","public_key":"pk-b","relay_ws":"wss://relay.example/ws","chunk_size":4096}"#,
        )
        .unwrap();
        let cfg = CoreConfig::load(&path).unwrap();
        assert_eq!(cfg.username, "Bob");
        assert_eq!(cfg.chunk_size(), 4096);
    }
}
