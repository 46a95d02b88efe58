/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use std::time::Duration;

use common::*;
use inet3_core::framer::{FileUpload, ReceivedFile};
use inet3_core::manager::{ManagerSettings, SessionEvent};
use inet3_core::memory::MemoryNetwork;
use inet3_core::node::save_received_file;
use inet3_core::{SessionError, SessionState};

fn pattern(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i % 253) as u8).collect()
}

async fn wait_file(peer: &mut Peer, from: &str) -> ReceivedFile {
    wait_for(&mut peer.events, |ev| match ev {
        SessionEvent::FileReceived { peer_id, file } if peer_id == from => Some(file.clone()),
        _ => None,
    })
    .await
}

#[tokio::test]
async fn file_is_reassembled_on_the_other_side() {
    let net = MemoryNetwork::new();
    let (mut alice, mut bob) = linked_pair(&net, "alice", "bob");
    connect_pair(&mut alice, &mut bob).await;

    let data = pattern(1024 * 1024 + 1);
    let sent = alice
        .manager
        .send_file("bob", FileUpload::from_bytes("photo.jpg", "image/jpeg", data.clone()))
        .await
        .unwrap();
    assert_eq!(sent, data.len() as u64);

    let file = wait_file(&mut bob, "alice").await;
    assert_eq!(file.name, "photo.jpg");
    assert_eq!(file.content_type, "image/jpeg");
    assert_eq!(file.size, data.len() as u64);
    assert_eq!(file.bytes.as_ref(), data.as_slice());
}

#[tokio::test]
async fn file_from_disk_lands_in_download_dir() {
    let net = MemoryNetwork::new();
    let (mut alice, mut bob) = linked_pair(&net, "alice", "bob");
    connect_pair(&mut alice, &mut bob).await;

    let src = tempfile::tempdir().unwrap();
    let path = src.path().join("report.txt");
    std::fs::write(&path, b"quarterly numbers").unwrap();
    let upload = FileUpload::open(&path).await.unwrap();
    alice.manager.send_file("bob", upload).await.unwrap();

    let file = wait_file(&mut bob, "alice").await;
    assert_eq!(file.content_type, "text/plain");
    let downloads = tempfile::tempdir().unwrap();
    let saved = save_received_file(downloads.path(), &file).await.unwrap();
    assert_eq!(std::fs::read(saved).unwrap(), b"quarterly numbers");
}

#[tokio::test]
async fn chat_waits_for_file_in_flight() {
    let net = MemoryNetwork::new();
    let (mut alice, mut bob) = linked_pair(&net, "alice", "bob");
    connect_pair(&mut alice, &mut bob).await;

    let data = pattern(4 * 1024 * 1024);
    let manager = alice.manager.clone();
    let upload = FileUpload::from_bytes("big.bin", "application/octet-stream", data.clone());
    let file_task = tokio::spawn(async move { manager.send_file("bob", upload).await });
    tokio::task::yield_now().await;
    alice.manager.send("bob", "after or before, never inside").await.unwrap();
    file_task.await.unwrap().unwrap();

    let mut got_file = None;
    let mut got_chat = None;
    while got_file.is_none() || got_chat.is_none() {
        match wait_for(&mut bob.events, |ev| match ev {
            SessionEvent::FileReceived { .. } | SessionEvent::Chat { .. } | SessionEvent::Error { .. } => {
                Some(ev.clone())
            }
            _ => None,
        })
        .await
        {
            SessionEvent::FileReceived { file, .. } => got_file = Some(file),
            SessionEvent::Chat { message, .. } => got_chat = Some(message.content),
            SessionEvent::Error { error, .. } => panic!("unexpected error: {error}"),
            _ => {}
        }
    }
    assert_eq!(got_file.unwrap().bytes.as_ref(), data.as_slice());
    assert_eq!(got_chat.unwrap(), "after or before, never inside");
}

#[tokio::test]
async fn short_source_leaves_receiver_to_expire_transfer() {
    let net = MemoryNetwork::new();
    let quick = ManagerSettings {
        transfer_idle_timeout: Duration::from_millis(200),
        ..settings()
    };
    let mut alice = peer(&net, "alice");
    let mut bob = peer_with(&net, "bob", quick);
    link(&mut alice, &mut bob);
    connect_pair(&mut alice, &mut bob).await;

    let upload = FileUpload::from_reader("cut.bin", "", 100, std::io::Cursor::new(vec![7u8; 40]));
    let err = alice.manager.send_file("bob", upload).await.unwrap_err();
    assert_eq!(
        err,
        SessionError::TransferSizeMismatch {
            name: "cut.bin".into(),
            expected: 100,
            received: 40
        }
    );

    let err = wait_for(&mut bob.events, |ev| match ev {
        SessionEvent::Error { peer_id, error } if peer_id == "alice" => Some(error.clone()),
        SessionEvent::FileReceived { .. } => panic!("partial file delivered"),
        _ => None,
    })
    .await;
    assert!(matches!(err, SessionError::TransferSizeMismatch { expected: 100, .. }));

    // Channel is still usable afterwards.
    alice.manager.send("bob", "still ok").await.unwrap();
    assert_eq!(wait_chat(&mut bob.events, "alice").await, "still ok");
}

#[tokio::test]
async fn file_to_unconnected_peer_is_rejected() {
    let net = MemoryNetwork::new();
    let alice = peer(&net, "alice");
    let err = alice
        .manager
        .send_file("nobody", FileUpload::from_bytes("x", "", vec![1u8]))
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::ChannelNotOpen("nobody".into()));
}

#[tokio::test]
async fn disconnect_drops_partial_file_and_queued_sends() {
    use tokio::io::AsyncWriteExt;

    let net = MemoryNetwork::new();
    let (mut alice, mut bob) = linked_pair(&net, "alice", "bob");
    connect_pair(&mut alice, &mut bob).await;

    // Source that only yields the first 20 000 of 100 000 bytes for now.
    let (mut source, reader) = tokio::io::duplex(64 * 1024);
    source.write_all(&pattern(20_000)).await.unwrap();
    let upload = FileUpload::from_reader("partial.bin", "", 100_000, reader);
    let manager = alice.manager.clone();
    let file_task = tokio::spawn(async move { manager.send_file("bob", upload).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let manager = alice.manager.clone();
    let chat_task = tokio::spawn(async move { manager.send("bob", "behind the file").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!file_task.is_finished());
    assert!(!chat_task.is_finished());

    bob.manager.disconnect("alice").await;
    wait_state(&mut alice.events, "bob", SessionState::Closed).await;

    // The rest of the source shows up too late; the next chunk finds the channel gone.
    let _ = source.write_all(&pattern(80_000)).await;
    assert_eq!(
        file_task.await.unwrap(),
        Err(SessionError::ChannelNotOpen("bob".into()))
    );
    assert_eq!(
        chat_task.await.unwrap(),
        Err(SessionError::ChannelNotOpen("bob".into()))
    );
    assert!(alice.manager.history("bob").await.is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(ev) = bob.events.try_recv() {
        assert!(
            !matches!(ev, SessionEvent::FileReceived { .. } | SessionEvent::Chat { .. }),
            "unexpected delivery after disconnect: {ev:?}"
        );
    }
    assert_eq!(bob.manager.state("alice").await, None);
}

#[tokio::test]
async fn console_chat_queues_behind_a_file_without_blocking() {
    use inet3_core::console::ChatOutbox;
    use tokio::io::AsyncWriteExt;

    let net = MemoryNetwork::new();
    let (mut alice, mut bob) = linked_pair(&net, "alice", "bob");
    connect_pair(&mut alice, &mut bob).await;

    let (mut source, reader) = tokio::io::duplex(64 * 1024);
    source.write_all(&pattern(1_000)).await.unwrap();
    let upload = FileUpload::from_reader("slow.bin", "", 2_000, reader);
    let manager = alice.manager.clone();
    let file_task = tokio::spawn(async move { manager.send_file("bob", upload).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let outbox = ChatOutbox::spawn(alice.manager.clone());
    for text in ["one", "two", "three"] {
        assert!(outbox.push("bob", text));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice.manager.history("bob").await.is_empty());

    source.write_all(&pattern(1_000)).await.unwrap();
    assert_eq!(file_task.await.unwrap(), Ok(2_000));
    let file = wait_file(&mut bob, "alice").await;
    assert_eq!(file.size, 2_000);
    for want in ["one", "two", "three"] {
        assert_eq!(wait_chat(&mut bob.events, "alice").await, want);
    }
}
