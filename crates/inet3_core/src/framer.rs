/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Data channel framing.
//!
//! Text frames carry a JSON [`ControlFrame`]; binary frames are raw file data
//! and only mean something between a `file-start` and the moment the declared
//! size has been received. The channel is ordered and reliable, so there is no
//! sequence number or stream id: one inbound transfer per peer at a time.

use std::path::Path;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use inet3_protocol::ControlFrame;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::transport::{ChannelMessage, DataChannel};

pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Decoded, application-level inbound item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Chat { content: String, timestamp: String },
    File(ReceivedFile),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub bytes: Bytes,
    pub name: String,
    pub content_type: String,
    pub size: u64,
}

/// Outgoing file: metadata plus a source read one chunk at a time.
pub struct FileUpload {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for FileUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileUpload")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl FileUpload {
    pub fn from_bytes(name: &str, content_type: &str, bytes: impl Into<Bytes>) -> Self {
        let bytes: Bytes = bytes.into();
        Self {
            name: name.to_string(),
            content_type: content_type.to_string(),
            size: bytes.len() as u64,
            reader: Box::new(std::io::Cursor::new(bytes)),
        }
    }

    pub fn from_reader(
        name: &str,
        content_type: &str,
        size: u64,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            content_type: content_type.to_string(),
            size,
            reader: Box::new(reader),
        }
    }

    /// Opens a file from disk; the content type is guessed from the extension.
    pub async fn open(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await.map_err(SessionError::transport)?;
        let meta = file.metadata().await.map_err(SessionError::transport)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let content_type = mime_guess::from_path(path)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());
        Ok(Self::from_reader(&name, &content_type, meta.len(), file))
    }
}

pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

fn encode(frame: &ControlFrame) -> SessionResult<String> {
    serde_json::to_string(frame).map_err(SessionError::transport)
}

/// Sends one chat frame; returns the timestamp written into it.
pub async fn send_chat(channel: &dyn DataChannel, peer_id: &str, text: &str) -> SessionResult<String> {
    if !channel.is_open() {
        return Err(SessionError::ChannelNotOpen(peer_id.to_string()));
    }
    let timestamp = now_timestamp();
    let frame = encode(&ControlFrame::Chat {
        content: text.to_string(),
        timestamp: timestamp.clone(),
    })?;
    channel.send_text(frame).await?;
    Ok(timestamp)
}

/// Streams `upload` as file-start, binary chunks, file-end. Each chunk is read
/// and sent before the next read starts. Returns the number of bytes sent.
pub async fn send_file(
    channel: &dyn DataChannel,
    peer_id: &str,
    mut upload: FileUpload,
    chunk_size: usize,
) -> SessionResult<u64> {
    if !channel.is_open() {
        return Err(SessionError::ChannelNotOpen(peer_id.to_string()));
    }
    let chunk_size = chunk_size.max(1);
    channel
        .send_text(encode(&ControlFrame::FileStart {
            name: upload.name.clone(),
            size: upload.size,
            file_type: upload.content_type.clone(),
        })?)
        .await?;

    let mut sent: u64 = 0;
    let mut buf = vec![0u8; chunk_size];
    while sent < upload.size {
        let want = (upload.size - sent).min(chunk_size as u64) as usize;
        let mut filled = 0;
        while filled < want {
            let n = upload
                .reader
                .read(&mut buf[filled..want])
                .await
                .map_err(SessionError::transport)?;
            if n == 0 {
                return Err(SessionError::TransferSizeMismatch {
                    name: upload.name,
                    expected: upload.size,
                    received: sent + filled as u64,
                });
            }
            filled += n;
        }
        if !channel.is_open() {
            return Err(SessionError::ChannelNotOpen(peer_id.to_string()));
        }
        channel.send_binary(Bytes::copy_from_slice(&buf[..filled])).await?;
        sent += filled as u64;
    }

    channel
        .send_text(encode(&ControlFrame::FileEnd { name: upload.name.clone() })?)
        .await?;
    debug!(peer=%peer_id, name=%upload.name, bytes=sent, "file sent");
    Ok(sent)
}

/// Inbound transfer in progress.
#[derive(Debug)]
pub struct TransferState {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub received: u64,
    chunks: Vec<Bytes>,
    pub last_activity: Instant,
}

impl TransferState {
    fn new(name: String, size: u64, content_type: String) -> Self {
        let now = Instant::now();
        Self {
            name,
            size,
            content_type,
            received: 0,
            chunks: Vec::new(),
            last_activity: now,
        }
    }

    fn assemble(self) -> ReceivedFile {
        let mut out = BytesMut::with_capacity(self.size as usize);
        for c in &self.chunks {
            out.extend_from_slice(c);
        }
        ReceivedFile {
            bytes: out.freeze(),
            name: self.name,
            content_type: self.content_type,
            size: self.size,
        }
    }
}

/// Per-peer receive side.
#[derive(Debug)]
pub struct FrameDecoder {
    peer_id: String,
    max_transfer_bytes: u64,
    transfer: Option<TransferState>,
    /// Name of the transfer that completed on its last data frame; a trailing
    /// `file-end` is checked against it.
    last_completed: Option<String>,
}

impl FrameDecoder {
    pub fn new(peer_id: &str, max_transfer_bytes: u64) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            max_transfer_bytes,
            transfer: None,
            last_completed: None,
        }
    }

    pub fn in_progress(&self) -> Option<&TransferState> {
        self.transfer.as_ref()
    }

    /// Drops any partial transfer without emitting it.
    pub fn abort(&mut self) -> Option<TransferState> {
        self.last_completed = None;
        self.transfer.take()
    }

    pub fn ingest(&mut self, message: ChannelMessage) -> SessionResult<Option<Inbound>> {
        match message {
            ChannelMessage::Text(text) => self.ingest_text(&text),
            ChannelMessage::Binary(data) => self.ingest_data(data),
        }
    }

    fn ingest_text(&mut self, text: &str) -> SessionResult<Option<Inbound>> {
        let frame: ControlFrame =
            serde_json::from_str(text).map_err(|e| SessionError::MalformedFrame(format!("control frame: {e}")))?;
        match frame {
            ControlFrame::Chat { content, timestamp } => Ok(Some(Inbound::Chat { content, timestamp })),
            ControlFrame::FileStart { name, size, file_type } => {
                if size > self.max_transfer_bytes {
                    self.transfer = None;
                    return Err(SessionError::MalformedFrame(format!(
                        "file {name:?} declares {size} bytes, limit is {}",
                        self.max_transfer_bytes
                    )));
                }
                if let Some(old) = self.transfer.take() {
                    warn!(peer=%self.peer_id, old=%old.name, received=old.received, "transfer replaced by new file-start");
                }
                self.last_completed = None;
                let content_type = if file_type.trim().is_empty() {
                    FALLBACK_CONTENT_TYPE.to_string()
                } else {
                    file_type
                };
                let state = TransferState::new(name, size, content_type);
                if size == 0 {
                    self.last_completed = Some(state.name.clone());
                    return Ok(Some(Inbound::File(state.assemble())));
                }
                self.transfer = Some(state);
                Ok(None)
            }
            ControlFrame::FileEnd { name } => {
                if let Some(done) = self.last_completed.take() {
                    if done == name && self.transfer.is_none() {
                        return Ok(None);
                    }
                }
                match self.transfer.take() {
                    Some(t) => Err(SessionError::TransferSizeMismatch {
                        name: t.name,
                        expected: t.size,
                        received: t.received,
                    }),
                    None => Err(SessionError::TransferSizeMismatch {
                        name,
                        expected: 0,
                        received: 0,
                    }),
                }
            }
        }
    }

    fn ingest_data(&mut self, data: Bytes) -> SessionResult<Option<Inbound>> {
        let Some(t) = self.transfer.as_mut() else {
            debug!(peer=%self.peer_id, len=data.len(), "data frame without open transfer dropped");
            return Ok(None);
        };
        let received = t.received + data.len() as u64;
        if received > t.size {
            let t = self.transfer.take();
            let (name, expected) = t.map(|t| (t.name, t.size)).unwrap_or_default();
            return Err(SessionError::TransferSizeMismatch {
                name,
                expected,
                received,
            });
        }
        t.received = received;
        t.last_activity = Instant::now();
        t.chunks.push(data);
        if t.received < t.size {
            return Ok(None);
        }
        let Some(done) = self.transfer.take() else {
            return Ok(None);
        };
        self.last_completed = Some(done.name.clone());
        Ok(Some(Inbound::File(done.assemble())))
    }

    /// Discards the open transfer if it saw no data for `idle`.
    pub fn expire_stale(&mut self, now: Instant, idle: Duration) -> Option<SessionError> {
        let stale = self
            .transfer
            .as_ref()
            .map(|t| now.saturating_duration_since(t.last_activity) >= idle)
            .unwrap_or(false);
        if !stale {
            return None;
        }
        let t = self.transfer.take()?;
        warn!(peer=%self.peer_id, name=%t.name, received=t.received, size=t.size, "stale transfer discarded");
        Some(SessionError::TransferSizeMismatch {
            name: t.name,
            expected: t.size,
            received: t.received,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Channel that records every frame instead of sending it.
    #[derive(Default)]
    pub(crate) struct RecordingChannel {
        pub frames: Mutex<Vec<ChannelMessage>>,
        pub closed: AtomicBool,
    }

    impl RecordingChannel {
        pub(crate) fn take(&self) -> Vec<ChannelMessage> {
            std::mem::take(&mut *self.frames.lock().unwrap())
        }
    }

    #[async_trait]
    impl DataChannel for RecordingChannel {
        fn label(&self) -> String {
            "test".into()
        }
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
        async fn send_text(&self, text: String) -> SessionResult<()> {
            self.frames.lock().unwrap().push(ChannelMessage::Text(text));
            Ok(())
        }
        async fn send_binary(&self, data: Bytes) -> SessionResult<()> {
            self.frames.lock().unwrap().push(ChannelMessage::Binary(data));
            Ok(())
        }
        async fn close(&self) -> SessionResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn feed(decoder: &mut FrameDecoder, frames: Vec<ChannelMessage>) -> Vec<Inbound> {
        frames
            .into_iter()
            .filter_map(|f| decoder.ingest(f).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn file_survives_chunking() {
        for (len, chunk) in [(1usize, 1usize), (100, 3), (16384, 16384), (16385, 16384), (10 * 1024 * 1024, 16384)] {
            let ch = RecordingChannel::default();
            let data = pattern(len);
            let sent = send_file(&ch, "bob", FileUpload::from_bytes("a.bin", "application/x-test", data.clone()), chunk)
                .await
                .unwrap();
            assert_eq!(sent, len as u64);
            let frames = ch.take();
            assert_eq!(frames.len(), 2 + len.div_ceil(chunk));
            let mut dec = FrameDecoder::new("alice", u64::MAX);
            let got = feed(&mut dec, frames);
            assert_eq!(got.len(), 1);
            let Inbound::File(f) = &got[0] else { panic!("expected file") };
            assert_eq!(f.bytes.as_ref(), data.as_slice());
            assert_eq!(f.name, "a.bin");
            assert_eq!(f.content_type, "application/x-test");
            assert!(dec.in_progress().is_none());
        }
    }

    #[tokio::test]
    async fn send_on_closed_channel_writes_nothing() {
        let ch = RecordingChannel::default();
        ch.closed.store(true, Ordering::SeqCst);
        let err = send_chat(&ch, "bob", "hi").await.unwrap_err();
        assert_eq!(err, SessionError::ChannelNotOpen("bob".into()));
        let err = send_file(&ch, "bob", FileUpload::from_bytes("x", "", vec![1, 2, 3]), 2)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::ChannelNotOpen("bob".into()));
        assert!(ch.take().is_empty());
    }

    #[tokio::test]
    async fn short_source_is_size_mismatch() {
        let ch = RecordingChannel::default();
        let upload = FileUpload::from_reader("short", "", 10, std::io::Cursor::new(vec![0u8; 4]));
        let err = send_file(&ch, "bob", upload, 3).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::TransferSizeMismatch {
                name: "short".into(),
                expected: 10,
                received: 4
            }
        );
    }

    #[test]
    fn overlong_transfer_is_rejected_without_completion() {
        let mut dec = FrameDecoder::new("alice", u64::MAX);
        let start = r#"{"type":"file-start","name":"f","size":100,"fileType":"text/plain"}"#;
        assert_eq!(dec.ingest(ChannelMessage::Text(start.into())).unwrap(), None);
        let err = dec.ingest(ChannelMessage::Binary(Bytes::from(vec![0u8; 150]))).unwrap_err();
        assert_eq!(
            err,
            SessionError::TransferSizeMismatch {
                name: "f".into(),
                expected: 100,
                received: 150
            }
        );
        assert!(dec.in_progress().is_none());
        // Trailing data is now out of any transfer.
        assert_eq!(dec.ingest(ChannelMessage::Binary(Bytes::from_static(b"x"))).unwrap(), None);
    }

    #[test]
    fn early_file_end_is_rejected() {
        let mut dec = FrameDecoder::new("alice", u64::MAX);
        dec.ingest(ChannelMessage::Text(r#"{"type":"file-start","name":"f","size":10}"#.into()))
            .unwrap();
        dec.ingest(ChannelMessage::Binary(Bytes::from_static(b"1234"))).unwrap();
        let err = dec
            .ingest(ChannelMessage::Text(r#"{"type":"file-end","name":"f"}"#.into()))
            .unwrap_err();
        assert!(matches!(err, SessionError::TransferSizeMismatch { received: 4, .. }));
    }

    #[test]
    fn file_end_with_other_name_is_rejected() {
        let mut dec = FrameDecoder::new("alice", u64::MAX);
        dec.ingest(ChannelMessage::Text(r#"{"type":"file-start","name":"f","size":2}"#.into()))
            .unwrap();
        assert!(dec.ingest(ChannelMessage::Binary(Bytes::from_static(b"ok"))).unwrap().is_some());
        assert!(dec
            .ingest(ChannelMessage::Text(r#"{"type":"file-end","name":"g"}"#.into()))
            .is_err());
    }

    #[test]
    fn empty_file_completes_on_start() {
        let mut dec = FrameDecoder::new("alice", u64::MAX);
        let got = dec
            .ingest(ChannelMessage::Text(r#"{"type":"file-start","name":"e","size":0,"fileType":""}"#.into()))
            .unwrap();
        let Some(Inbound::File(f)) = got else { panic!("expected file") };
        assert!(f.bytes.is_empty());
        assert_eq!(f.content_type, FALLBACK_CONTENT_TYPE);
        assert_eq!(
            dec.ingest(ChannelMessage::Text(r#"{"type":"file-end","name":"e"}"#.into()))
                .unwrap(),
            None
        );
    }

    #[test]
    fn oversized_declaration_is_malformed() {
        let mut dec = FrameDecoder::new("alice", 1024);
        let err = dec
            .ingest(ChannelMessage::Text(r#"{"type":"file-start","name":"big","size":2048}"#.into()))
            .unwrap_err();
        assert!(matches!(err, SessionError::MalformedFrame(_)));
        assert!(matches!(
            dec.ingest(ChannelMessage::Text("not json".into())),
            Err(SessionError::MalformedFrame(_))
        ));
    }

    #[test]
    fn new_start_replaces_open_transfer() {
        let mut dec = FrameDecoder::new("alice", u64::MAX);
        dec.ingest(ChannelMessage::Text(r#"{"type":"file-start","name":"old","size":10}"#.into()))
            .unwrap();
        dec.ingest(ChannelMessage::Binary(Bytes::from_static(b"abc"))).unwrap();
        dec.ingest(ChannelMessage::Text(r#"{"type":"file-start","name":"new","size":3}"#.into()))
            .unwrap();
        let got = dec.ingest(ChannelMessage::Binary(Bytes::from_static(b"xyz"))).unwrap();
        let Some(Inbound::File(f)) = got else { panic!("expected file") };
        assert_eq!(f.name, "new");
        assert_eq!(f.bytes.as_ref(), b"xyz");
    }

    #[test]
    fn idle_transfer_expires() {
        let mut dec = FrameDecoder::new("alice", u64::MAX);
        dec.ingest(ChannelMessage::Text(r#"{"type":"file-start","name":"f","size":10}"#.into()))
            .unwrap();
        assert!(dec.expire_stale(Instant::now(), Duration::from_secs(60)).is_none());
        let later = Instant::now() + Duration::from_secs(61);
        assert!(matches!(
            dec.expire_stale(later, Duration::from_secs(60)),
            Some(SessionError::TransferSizeMismatch { received: 0, .. })
        ));
        assert!(dec.in_progress().is_none());
    }

    #[tokio::test]
    async fn chat_frame_carries_rfc3339_timestamp() {
        let ch = RecordingChannel::default();
        let ts = send_chat(&ch, "bob", "hello").await.unwrap();
        assert!(OffsetDateTime::parse(&ts, &Rfc3339).is_ok());
        let mut dec = FrameDecoder::new("alice", 1024);
        let got = feed(&mut dec, ch.take());
        assert_eq!(
            got,
            vec![Inbound::Chat {
                content: "hello".into(),
                timestamp: ts
            }]
        );
    }

    #[tokio::test]
    async fn open_guesses_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();
        let upload = FileUpload::open(&path).await.unwrap();
        assert_eq!(upload.name, "notes.txt");
        assert_eq!(upload.size, 5);
        assert_eq!(upload.content_type, "text/plain");
    }
}
