//! End-to-end transfer tests over the in-memory link.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use linkdrop_core::channel::memory::{Intercept, MemoryLink};
use linkdrop_core::channel::WireMessage;
use linkdrop_core::events::SessionEvent;
use linkdrop_core::protocol::{classify_text, decode_chunk, ControlMessage, InboundText};
use linkdrop_core::session::SHUTDOWN_REASON;
use linkdrop_core::storage::{DirectorySinkProvider, MemoryOnlyProvider, MemorySource};
use linkdrop_core::transfer::{TransferDirection, TransferStatus};
use linkdrop_core::DEFAULT_BUFFERED_AMOUNT_LOW;

use common::{
    config, connect_pair, create_temp_dir, create_test_file, random_bytes, record,
    wait_any_finished, wait_finished, Wiretap,
};

#[tokio::test]
async fn test_file_transfer_to_disk() {
    let src_dir = create_temp_dir();
    let dst_dir = create_temp_dir();
    let data = random_bytes(200_000);
    let path = create_test_file(src_dir.path(), "data.bin", &data);

    let tap = Arc::new(Mutex::new(Wiretap::default()));
    let link = {
        let tap = Arc::clone(&tap);
        MemoryLink::new(DEFAULT_BUFFERED_AMOUNT_LOW).with_interceptor_a_to_b(move |m| {
            record(&tap, m);
            Intercept::Deliver
        })
    };

    let mut pair = connect_pair(
        link,
        config(65536),
        Arc::new(MemoryOnlyProvider),
        Arc::new(DirectorySinkProvider::new(dst_dir.path())),
    )
    .await;

    let id = pair.sender.send_file(&path).await.expect("send");
    let (sent, _) = wait_finished(&mut pair.sender_events, &id).await;
    let (received, _) = wait_finished(&mut pair.receiver_events, &id).await;

    let expected_crc = crc32fast::hash(&data);
    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(sent.direction, TransferDirection::Sending);
    assert_eq!(sent.local_crc32, Some(expected_crc));
    assert_eq!(sent.remote_crc32, Some(expected_crc));

    assert_eq!(received.status, TransferStatus::Completed);
    assert_eq!(received.local_crc32, Some(expected_crc));
    let saved = received.saved_to.expect("saved to disk");
    assert_eq!(saved, dst_dir.path().join("data.bin"));
    assert_eq!(std::fs::read(saved).expect("read"), data);

    let tap = tap.lock().expect("tap");
    assert_eq!(tap.seqs(), vec![0, 1, 2, 3]);
    assert_eq!(tap.payload_lengths(), vec![65536, 65536, 65536, 3392]);
    assert_eq!(tap.count("file-offer"), 1);
}

#[tokio::test]
async fn test_memory_fallback_materializes_artifact() {
    let data = random_bytes(10_000);

    let mut pair = connect_pair(
        MemoryLink::new(DEFAULT_BUFFERED_AMOUNT_LOW),
        config(1024),
        Arc::new(MemoryOnlyProvider),
        Arc::new(MemoryOnlyProvider),
    )
    .await;

    let id = pair
        .sender
        .send_source(Arc::new(MemorySource::new("notes.txt", data.clone())))
        .await
        .expect("send");

    let (received, events) = wait_finished(&mut pair.receiver_events, &id).await;
    assert_eq!(received.status, TransferStatus::Completed);
    assert!(received.saved_to.is_none());

    let artifact = events.iter().find_map(|event| match event {
        SessionEvent::ArtifactReady { name, data, .. } => Some((name.clone(), data.clone())),
        _ => None,
    });
    assert_eq!(artifact, Some(("notes.txt".to_string(), data)));

    let offered = events
        .iter()
        .any(|event| matches!(event, SessionEvent::OfferReceived(info) if info.size == 10_000));
    assert!(offered);
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let data = random_bytes(50_000);

    let mut pair = connect_pair(
        MemoryLink::new(DEFAULT_BUFFERED_AMOUNT_LOW),
        config(4096),
        Arc::new(MemoryOnlyProvider),
        Arc::new(MemoryOnlyProvider),
    )
    .await;

    let id = pair
        .sender
        .send_source(Arc::new(MemorySource::new("p.bin", data)))
        .await
        .expect("send");

    let (_, events) = wait_finished(&mut pair.receiver_events, &id).await;
    let progress: Vec<f64> = events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();

    assert_eq!(progress.len(), 13);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!((progress[progress.len() - 1] - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_corrupted_chunk_is_nacked_once_and_recovered() {
    let data = random_bytes(200_000);
    let corrupted = Arc::new(AtomicBool::new(false));
    let replies = Arc::new(Mutex::new(Wiretap::default()));

    let link = {
        let corrupted = Arc::clone(&corrupted);
        let replies = Arc::clone(&replies);
        MemoryLink::new(DEFAULT_BUFFERED_AMOUNT_LOW)
            .with_interceptor_a_to_b(move |message| match message {
                WireMessage::Binary(bytes)
                    if decode_chunk(bytes).is_ok_and(|p| p.seq == 1)
                        && !corrupted.swap(true, Ordering::SeqCst) =>
                {
                    let mut bytes = bytes.clone();
                    if let Some(last) = bytes.last_mut() {
                        *last ^= 0xFF;
                    }
                    Intercept::Replace(WireMessage::Binary(bytes))
                }
                _ => Intercept::Deliver,
            })
            .with_interceptor_b_to_a(move |message| {
                record(&replies, message);
                Intercept::Deliver
            })
    };

    let mut pair = connect_pair(
        link,
        config(65536),
        Arc::new(MemoryOnlyProvider),
        Arc::new(MemoryOnlyProvider),
    )
    .await;

    let id = pair
        .sender
        .send_source(Arc::new(MemorySource::new("c.bin", data.clone())))
        .await
        .expect("send");

    let (sent, _) = wait_finished(&mut pair.sender_events, &id).await;
    let (_, events) = wait_finished(&mut pair.receiver_events, &id).await;

    assert!(corrupted.load(Ordering::SeqCst));
    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(sent.local_crc32, Some(crc32fast::hash(&data)));

    let replies = replies.lock().expect("tap");
    let nacks_for_corrupted = replies
        .controls
        .iter()
        .filter(|m| matches!(m, ControlMessage::ChunkNack { seq: 1, .. }))
        .count();
    assert_eq!(nacks_for_corrupted, 1);

    let artifact = events.into_iter().find_map(|event| match event {
        SessionEvent::ArtifactReady { data, .. } => Some(data),
        _ => None,
    });
    assert_eq!(artifact, Some(data));
}

#[tokio::test]
async fn test_accept_timeout_starts_sending() {
    let data = random_bytes(5_000);
    let replies = Arc::new(Mutex::new(Wiretap::default()));

    let link = {
        let replies = Arc::clone(&replies);
        MemoryLink::new(DEFAULT_BUFFERED_AMOUNT_LOW).with_interceptor_b_to_a(move |message| {
            record(&replies, message);
            match message {
                WireMessage::Text(text)
                    if matches!(
                        classify_text(text),
                        InboundText::Control(ControlMessage::FileAccept { .. })
                    ) =>
                {
                    Intercept::Drop
                }
                _ => Intercept::Deliver,
            }
        })
    };

    let mut sender_config = config(1024);
    sender_config.transfer.accept_timeout = Duration::from_millis(100);

    let mut pair = connect_pair(
        link,
        sender_config,
        Arc::new(MemoryOnlyProvider),
        Arc::new(MemoryOnlyProvider),
    )
    .await;

    let id = pair
        .sender
        .send_source(Arc::new(MemorySource::new("t.bin", data)))
        .await
        .expect("send");

    let (sent, _) = wait_finished(&mut pair.sender_events, &id).await;
    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(sent.resumed_from, 0);
    assert_eq!(replies.lock().expect("tap").count("file-accept"), 1);
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_reaches_peer() {
    let tap = Arc::new(Mutex::new(Wiretap::default()));
    let link = {
        let tap = Arc::clone(&tap);
        MemoryLink::new(DEFAULT_BUFFERED_AMOUNT_LOW).with_interceptor_a_to_b(move |message| {
            record(&tap, message);
            match message {
                WireMessage::Binary(_) => Intercept::Drop,
                WireMessage::Text(_) => Intercept::Deliver,
            }
        })
    };

    let mut pair = connect_pair(
        link,
        config(1024),
        Arc::new(MemoryOnlyProvider),
        Arc::new(MemoryOnlyProvider),
    )
    .await;

    let id = pair
        .sender
        .send_source(Arc::new(MemorySource::new("x.bin", random_bytes(8_192))))
        .await
        .expect("send");

    assert!(pair.sender.cancel(&id, "user cancelled").await.expect("cancel"));
    assert!(!pair.sender.cancel(&id, "user cancelled").await.expect("cancel"));

    let (sent, _) = wait_finished(&mut pair.sender_events, &id).await;
    let (received, _) = wait_finished(&mut pair.receiver_events, &id).await;

    assert_eq!(sent.status, TransferStatus::Canceled);
    assert_eq!(received.status, TransferStatus::Canceled);
    assert_eq!(received.reason.as_deref(), Some("user cancelled"));
    assert_eq!(tap.lock().expect("tap").count("file-cancel"), 1);
    assert!(pair.sender.transfers().await.expect("transfers").is_empty());
    assert!(pair.receiver.transfers().await.expect("transfers").is_empty());
}

/// Shutdown cancels live transfers and the peer hears why before the link
/// goes down.
#[tokio::test]
async fn test_shutdown_notifies_peer_before_closing() {
    let tap = Arc::new(Mutex::new(Wiretap::default()));
    let link = {
        let tap = Arc::clone(&tap);
        MemoryLink::new(DEFAULT_BUFFERED_AMOUNT_LOW).with_interceptor_a_to_b(move |message| {
            record(&tap, message);
            match message {
                WireMessage::Binary(_) => Intercept::Drop,
                WireMessage::Text(_) => Intercept::Deliver,
            }
        })
    };

    let mut pair = connect_pair(
        link,
        config(1024),
        Arc::new(MemoryOnlyProvider),
        Arc::new(MemoryOnlyProvider),
    )
    .await;

    let id = pair
        .sender
        .send_source(Arc::new(MemorySource::new("x.bin", random_bytes(8_192))))
        .await
        .expect("send");

    pair.sender.shutdown().await.expect("shutdown");

    let (sent, _) = wait_finished(&mut pair.sender_events, &id).await;
    let (received, _) = wait_finished(&mut pair.receiver_events, &id).await;

    assert_eq!(sent.status, TransferStatus::Canceled);
    assert_eq!(sent.reason.as_deref(), Some(SHUTDOWN_REASON));
    assert_eq!(received.status, TransferStatus::Canceled);
    assert_eq!(received.reason.as_deref(), Some(SHUTDOWN_REASON));
    assert_eq!(tap.lock().expect("tap").count("file-cancel"), 1);
}

#[tokio::test]
async fn test_receiver_cancel_stops_sender() {
    let link = MemoryLink::new(DEFAULT_BUFFERED_AMOUNT_LOW).with_interceptor_a_to_b(|message| {
        match message {
            WireMessage::Binary(_) => Intercept::Drop,
            WireMessage::Text(_) => Intercept::Deliver,
        }
    });

    let mut pair = connect_pair(
        link,
        config(1024),
        Arc::new(MemoryOnlyProvider),
        Arc::new(MemoryOnlyProvider),
    )
    .await;

    let id = pair
        .sender
        .send_source(Arc::new(MemorySource::new("y.bin", random_bytes(4_096))))
        .await
        .expect("send");

    tokio::time::timeout(common::TEST_TIMEOUT, async {
        loop {
            if let Some(SessionEvent::OfferReceived(_)) = pair.receiver_events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("offer");

    assert!(pair.receiver.cancel(&id, "not wanted").await.expect("cancel"));

    let (sent, _) = wait_finished(&mut pair.sender_events, &id).await;
    assert_eq!(sent.status, TransferStatus::Canceled);
    assert_eq!(sent.reason.as_deref(), Some("not wanted"));

    let history = pair.sender.history().await.expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, id);
}

#[tokio::test]
async fn test_empty_file_completes() {
    let mut pair = connect_pair(
        MemoryLink::new(DEFAULT_BUFFERED_AMOUNT_LOW),
        config(1024),
        Arc::new(MemoryOnlyProvider),
        Arc::new(MemoryOnlyProvider),
    )
    .await;

    let id = pair
        .sender
        .send_source(Arc::new(MemorySource::new("empty", Vec::<u8>::new())))
        .await
        .expect("send");

    let (sent, _) = wait_finished(&mut pair.sender_events, &id).await;
    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(sent.local_crc32, Some(0));

    let (received, events) = wait_finished(&mut pair.receiver_events, &id).await;
    assert_eq!(received.status, TransferStatus::Completed);
    assert!(events.iter().any(
        |event| matches!(event, SessionEvent::ArtifactReady { data, .. } if data.is_empty())
    ));
}

#[tokio::test]
async fn test_small_buffer_threshold_still_completes() {
    let data = random_bytes(64 * 1024);

    let mut pair = connect_pair(
        MemoryLink::new(0),
        config(1024),
        Arc::new(MemoryOnlyProvider),
        Arc::new(MemoryOnlyProvider),
    )
    .await;

    let id = pair
        .sender
        .send_source(Arc::new(MemorySource::new("b.bin", data.clone())))
        .await
        .expect("send");

    let (sent, _) = wait_finished(&mut pair.sender_events, &id).await;
    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(sent.remote_crc32, Some(crc32fast::hash(&data)));
}

#[tokio::test]
async fn test_concurrent_transfers_both_directions() {
    let mut pair = connect_pair(
        MemoryLink::new(DEFAULT_BUFFERED_AMOUNT_LOW),
        config(2048),
        Arc::new(MemoryOnlyProvider),
        Arc::new(MemoryOnlyProvider),
    )
    .await;

    let forward = random_bytes(20_000);
    let backward = random_bytes(30_000);

    let forward_id = pair
        .sender
        .send_source(Arc::new(MemorySource::new("f.bin", forward.clone())))
        .await
        .expect("send");
    let backward_id = pair
        .receiver
        .send_source(Arc::new(MemorySource::new("r.bin", backward.clone())))
        .await
        .expect("send");
    assert_ne!(forward_id, backward_id);

    let mut done = Vec::new();
    while done.len() < 2 {
        let (summary, _) = wait_any_finished(&mut pair.sender_events).await;
        done.push(summary);
    }

    for summary in &done {
        assert_eq!(summary.status, TransferStatus::Completed);
        let expected = if summary.id == forward_id {
            crc32fast::hash(&forward)
        } else {
            crc32fast::hash(&backward)
        };
        assert_eq!(summary.local_crc32, Some(expected));
    }
}

#[tokio::test]
async fn test_plain_text_reaches_peer_as_chat() {
    let mut pair = connect_pair(
        MemoryLink::new(DEFAULT_BUFFERED_AMOUNT_LOW),
        config(1024),
        Arc::new(MemoryOnlyProvider),
        Arc::new(MemoryOnlyProvider),
    )
    .await;

    pair.sender.send_chat("hello from a").await.expect("chat");

    let chat = tokio::time::timeout(common::TEST_TIMEOUT, async {
        loop {
            if let Some(SessionEvent::Chat(text)) = pair.receiver_events.recv().await {
                return text;
            }
        }
    })
    .await
    .expect("chat");
    assert_eq!(chat, "hello from a");
}
