//! Ingress Router: the inbound overlay packet pipeline. Every payload
//! delivered through [`relay_overlay::OverlayTransport::set_receive_callback`]
//! passes through here before it ever reaches the local application.

use relay_bus::BusBridge;
use relay_codec::Codec;
use relay_dedup::{DedupRing, Observation};
use relay_status::{PacketEventKind, PacketEventLog};
use relay_types::{AppPort, ContentHash};
use std::sync::{Arc, Mutex};

/// Runs the three-step inbound pipeline on one payload:
/// dedup, decompress, re-inject. `ingress_port` is the single app-ingress
/// port this payload is destined for — selecting among several configured
/// ingress ports from packet content is out of scope here (the Overlay
/// Transport's `PacketMeta`/app_data would carry that if the deployment
/// needs more than one ingress group, which the default configuration
/// does not).
pub fn handle_inbound(
    compressed: &[u8],
    dedup: &DedupRing,
    codec: &Codec,
    bus: &Mutex<BusBridge>,
    ingress_port: AppPort,
    event_log: &PacketEventLog,
) {
    let content_hash = ContentHash::from_bytes(compressed);
    if dedup.observe(content_hash) == Observation::Duplicate {
        tracing::debug!(hash = %content_hash, "dropping duplicate inbound packet");
        event_log.record(PacketEventKind::DroppedDuplicate, None, Some(content_hash), None, None);
        return;
    }

    let decompressed = match codec.decompress(compressed) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(hash = %content_hash, error = %err, "dropping malformed inbound packet");
            event_log.record(PacketEventKind::DroppedMalformed, None, Some(content_hash), None, Some(err.to_string()));
            return;
        }
    };

    let bus = bus.lock().expect("bus bridge mutex poisoned");
    if let Err(err) = bus.send_ingress(ingress_port, &decompressed) {
        tracing::warn!(hash = %content_hash, error = %err, "failed to re-inject inbound packet onto app-ingress port");
    }
}

/// Builds the `ReceiveCallback` closure registered once at startup with
/// the Overlay Transport, capturing everything [`handle_inbound`] needs.
pub fn receive_callback(
    dedup: Arc<DedupRing>,
    codec: Arc<Codec>,
    bus: Arc<Mutex<BusBridge>>,
    ingress_port: AppPort,
    event_log: Arc<PacketEventLog>,
) -> relay_overlay::ReceiveCallback {
    Box::new(move |bytes, _meta| {
        handle_inbound(&bytes, &dedup, &codec, &bus, ingress_port, &event_log);
    })
}
