//! Exercises the inbound half of the pipeline: a payload arriving through
//! the Overlay Transport's receive callback is deduplicated and
//! decompressed back to its original bytes, and a second delivery of the
//! identical payload is dropped rather than re-injected.

use relay_codec::Codec;
use relay_dedup::{DedupRing, Observation};
use relay_overlay::{FakeOverlay, OverlayTransport, PacketMeta};
use relay_status::{PacketEventKind, PacketEventLog};
use relay_types::ContentHash;
use std::sync::{Arc, Mutex};

fn test_codec() -> Codec {
    let samples: Vec<Vec<u8>> =
        (0..16).map(|i| format!("<event uid=\"inbound-{i}\" type=\"a-f-G-U-C\"/>").into_bytes()).collect();
    Codec::new(zstd::dict::from_samples(&samples, 8 * 1024).expect("train dictionary"))
}

#[test]
fn identical_inbound_payload_is_deduplicated_on_second_delivery() {
    let overlay = Arc::new(FakeOverlay::new());
    let dedup = Arc::new(DedupRing::new());
    let codec = Arc::new(test_codec());
    let event_log = Arc::new(PacketEventLog::new());
    let decompressed_deliveries: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

    let raw = b"<event uid=\"inbound-1\" type=\"a-f-G-U-C\"/>".to_vec();
    let compressed = codec.compress(&raw).expect("compress");

    {
        let dedup = dedup.clone();
        let codec = codec.clone();
        let event_log = event_log.clone();
        let decompressed_deliveries = decompressed_deliveries.clone();
        overlay.set_receive_callback(Box::new(move |bytes, _meta: PacketMeta| {
            let content_hash = ContentHash::from_bytes(&bytes);
            if dedup.observe(content_hash) == Observation::Duplicate {
                event_log.record(PacketEventKind::DroppedDuplicate, None, Some(content_hash), None, None);
                return;
            }
            let decompressed = codec.decompress(&bytes).expect("decompress");
            decompressed_deliveries.lock().unwrap().push(decompressed);
        }));
    }

    overlay.simulate_inbound(compressed.clone(), PacketMeta { source: None });
    overlay.simulate_inbound(compressed, PacketMeta { source: None });

    let deliveries = decompressed_deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1, "the duplicate delivery must not reach the decompress stage");
    assert_eq!(deliveries[0], raw);

    let events = event_log.snapshot();
    assert!(events.iter().any(|e| matches!(e.kind, PacketEventKind::DroppedDuplicate)));
}
