// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures gracefully without panics,
//! deadlocks, or data loss.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use asset_tree::replication::{EventHandler, ReplicationHandler};
use asset_tree::wire::codec::{decode_frame, encode_frame, maybe_decompress, DEFAULT_COMPRESSION_THRESHOLD};
use asset_tree::{
    CursorConfig, CursorStore, EventLoop, Frame, MapEvent, PeerSession, SessionOptions, SubscriptionService,
    TreeError, WireChannel, WireMessage,
};
use common::{connect, converged, eventually, mesh, SHARED};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// Corrupted Data Handling
// =============================================================================

/// Test: Corrupted zstd data doesn't panic
#[test]
fn corrupted_zstd_no_panic() {
    let corrupted_payloads: &[&[u8]] = &[
        // Just magic header, no content
        &[0x28, 0xB5, 0x2F, 0xFD],
        // Magic header with garbage
        &[0x28, 0xB5, 0x2F, 0xFD, 0x00, 0x00, 0x00, 0x00],
        // Magic header with random bytes
        &[0x28, 0xB5, 0x2F, 0xFD, 0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE],
        // Magic header with truncated frame header
        &[0x28, 0xB5, 0x2F, 0xFD, 0x20],
    ];
    for payload in corrupted_payloads {
        let _ = maybe_decompress(payload);
    }
}

/// Test: Malformed frames are rejected, truncated frames wait for more
#[test]
fn malformed_frames_rejected() {
    // Zero length
    assert!(decode_frame(&[0, 0, 0, 0]).is_err());
    // Oversized length
    assert!(decode_frame(&[0xFF, 0xFF, 0xFF, 0xFF, 0]).is_err());
    // Compressed flag without magic
    assert!(decode_frame(&[0, 0, 0, 3, 1, b'{', b'}']).is_err());
    // Not JSON
    assert!(decode_frame(&[0, 0, 0, 4, 0, b'x', b'y', b'z']).is_err());
    // JSON, but not a frame
    assert!(decode_frame(&[0, 0, 0, 3, 0, b'{', b'}']).is_err());

    let frame = Frame::new("/shared", 0, WireMessage::Identifier { id: 1 });
    let bytes = encode_frame(&frame, DEFAULT_COMPRESSION_THRESHOLD).unwrap();
    for cut in 0..bytes.len() {
        assert!(decode_frame(&bytes[..cut]).unwrap().is_none());
    }
    assert_eq!(decode_frame(&bytes).unwrap().unwrap().0, frame);
}

// =============================================================================
// Handshake Failures
// =============================================================================

/// Test: A peer that skips the identifier exchange is refused
#[tokio::test]
async fn handshake_out_of_order_refused() {
    let event_loop = EventLoop::start("chaos", Duration::from_millis(2));
    let hosts = mesh(&[1, 2]);
    let (ours, theirs) = WireChannel::pair(8);

    theirs
        .outbound
        .send(Frame::new(SHARED, 0, WireMessage::Bootstrap { id: 2, last_updated_time: 0 }))
        .await
        .unwrap();
    let err = PeerSession::accept(Arc::clone(&hosts[0].engine), ours, &event_loop, SessionOptions::new(SHARED))
        .await
        .unwrap_err();
    assert!(matches!(err, TreeError::Handshake(_)));
    event_loop.shutdown();
}

/// Test: The counterpart vanishing mid-handshake is a retryable error
#[tokio::test]
async fn handshake_peer_vanishes() {
    let event_loop = EventLoop::start("chaos", Duration::from_millis(2));
    let hosts = mesh(&[1, 2]);
    let (ours, theirs) = WireChannel::pair(8);
    drop(theirs);

    let err = PeerSession::initiate(Arc::clone(&hosts[0].engine), ours, &event_loop, SessionOptions::new(SHARED))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    event_loop.shutdown();
}

// =============================================================================
// Transport Failures
// =============================================================================

/// Test: Entries survive a transport that dies mid-stream
#[tokio::test]
async fn transport_dies_entries_stay_dirty() {
    let hosts = mesh(&[1, 2]);
    for i in 0..10 {
        hosts[0].map.put(&format!("k{}", i), "v");
    }
    let iterator = hosts[0].engine.acquire_modification_iterator(2).unwrap();
    assert_eq!(iterator.dirty_count(), 10);

    let (tx, mut rx) = mpsc::channel(4);
    let mut handler = ReplicationHandler::new(SHARED, 0, 1, Arc::clone(&iterator), tx);
    assert!(handler.action().unwrap());
    let mut delivered = 0;
    while rx.try_recv().is_ok() {
        delivered += 1;
    }
    drop(rx);

    let err = handler.action().unwrap_err();
    assert!(matches!(err, TreeError::TransportClosed { remote_id: 2 }));
    assert_eq!(iterator.dirty_count(), 10 - delivered);
}

/// Test: A peer dropping its channel leaves the other side reconnectable
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_drop_then_reconnect_converges() {
    let event_loop = EventLoop::start("chaos", Duration::from_millis(2));
    let hosts = mesh(&[1, 2]);
    let (s1, s2) = connect(&hosts[0], &hosts[1], &event_loop).await;

    hosts[0].map.put("first", "1");
    assert!(eventually(WAIT, || hosts[1].map.contains_key("first")).await);

    // Abrupt loss: only one side notices
    drop(s2);
    assert!(tokio::time::timeout(WAIT, s1.closed()).await.is_ok());

    for i in 0..30 {
        hosts[0].map.put(&format!("offline-{}", i), "x");
    }
    let _sessions = connect(&hosts[0], &hosts[1], &event_loop).await;
    assert!(eventually(WAIT, || converged(&hosts, 31)).await);
    event_loop.shutdown();
}

/// Test: A remote subscriber that cannot keep up is dropped, others continue
#[tokio::test]
async fn slow_remote_subscriber_dropped() {
    let hosts = mesh(&[1]);
    let (out_tx, mut out_rx) = mpsc::channel(2);
    let service = SubscriptionService::new(hosts[0].tree.clone(), out_tx);
    service
        .handle(Frame::new(SHARED, 5, WireMessage::RegisterSubscriber { keys_only: false }))
        .unwrap();

    let local = common::Recorder::<MapEvent>::new();
    hosts[0].map.register_subscriber(local.clone());
    for i in 0..10 {
        hosts[0].map.put(&format!("k{}", i), "v");
    }

    assert_eq!(local.messages().len(), 10);
    assert_eq!(service.active_subscriptions(), 0);
    let mut replies = 0;
    while let Ok(frame) = out_rx.try_recv() {
        assert!(matches!(frame.message, WireMessage::Reply { .. }));
        replies += 1;
    }
    assert_eq!(replies, 2);
}

// =============================================================================
// Cursor Store Under Stress
// =============================================================================

/// Test: Concurrent cursor updates keep the maximum
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cursor_concurrent_updates_keep_max() {
    let dir = tempdir().unwrap();
    let config = CursorConfig {
        sqlite_path: dir.path().join("c.db").to_string_lossy().to_string(),
        ..CursorConfig::default()
    };
    let store = Arc::new(CursorStore::open(&config).await.unwrap());

    let mut tasks = Vec::new();
    for worker in 0..8u64 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            for i in 0..50u64 {
                store.set("/shared", 2, i * 8 + worker).await;
                if i % 10 == 0 {
                    let _ = store.flush_dirty().await;
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    store.flush_dirty().await.unwrap();

    assert_eq!(store.get("/shared", 2).await, Some(49 * 8 + 7));
    store.close().await;

    let reopened = CursorStore::open(&config).await.unwrap();
    assert_eq!(reopened.get("/shared", 2).await, Some(49 * 8 + 7));
    reopened.close().await;
}
