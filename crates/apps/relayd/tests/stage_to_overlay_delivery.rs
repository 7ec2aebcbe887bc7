//! Exercises the daemon's core wiring end to end: a raw app-egress
//! datagram is compressed and spooled exactly as the bus task would, the
//! Reliable Sender claims and dispatches it to a single OVERLAY peer over
//! a `FakeOverlay`, and the peer's delivery proof releases it from the
//! spool.

use relay_codec::Codec;
use relay_dedup::{DedupRing, Observation};
use relay_overlay::{AnnounceEvent, FakeOverlay, IdentityHandle};
use relay_path::PathController;
use relay_peers::PeerDirectory;
use relay_sender::ReliableSender;
use relay_spool::Spool;
use relay_status::PacketEventLog;
use relay_types::DestinationHash;
use std::sync::Arc;

fn test_codec() -> Codec {
    let samples: Vec<Vec<u8>> =
        (0..16).map(|i| format!("<event uid=\"e2e-{i}\" type=\"a-f-G-U-C\"/>").into_bytes()).collect();
    Codec::new(zstd::dict::from_samples(&samples, 8 * 1024).expect("train dictionary"))
}

fn stage_like_the_bus_task_would(raw: &[u8], codec: &Codec, dedup: &DedupRing, spool: &Spool) {
    let compressed = codec.compress(raw).expect("compress within ceiling");
    let content_hash = relay_types::ContentHash::from_bytes(&compressed);
    assert_eq!(dedup.observe(content_hash), Observation::Fresh);
    spool.stage(&compressed).expect("stage compressed payload");
}

#[test]
fn a_staged_packet_is_claimed_dispatched_and_released_on_delivery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spool = Arc::new(Spool::open(dir.path()).expect("open spool"));
    let dedup = DedupRing::new();
    let codec = test_codec();
    let peer_directory = PeerDirectory::new();
    let path_controller = Arc::new(PathController::new());
    let overlay = Arc::new(FakeOverlay::new());
    let event_log = Arc::new(PacketEventLog::new());
    let sender =
        ReliableSender::new(spool.clone(), peer_directory.clone(), path_controller.clone(), overlay.clone(), event_log);

    peer_directory.on_announce(
        &AnnounceEvent {
            destination_hash: DestinationHash([1u8; 16]),
            identity: IdentityHandle::from_bytes(vec![1u8; 16]),
            app_data: b"node-a".to_vec(),
        },
        "node-a".to_string(),
    );
    // Three consecutive failures trip the remote into OVERLAY mode.
    for _ in 0..3 {
        path_controller.observe("node-a", relay_path::Observation::Unobserved);
    }

    stage_like_the_bus_task_would(b"<event uid=\"e2e-1\" type=\"a-f-G-U-C\"/>", &codec, &dedup, &spool);
    assert_eq!(spool.pending_ids().unwrap().len(), 1);

    sender.tick();
    assert_eq!(overlay.sent_count(), 1);
    assert!(spool.pending_ids().unwrap().is_empty());

    overlay.deliver(0);
    sender.tick();

    assert!(spool.sent_buffer_ids().unwrap().is_empty(), "delivered packet must be released, not just promoted");
}
