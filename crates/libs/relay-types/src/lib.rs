//! Shared primitives for the dual-path mesh relay core.
//!
//! This crate centralizes the constants and value types that more than
//! one component needs. It never defines the mutable records each
//! component exclusively owns (`PeerRecord`, `PathState`, the delivery
//! ledger) — those live with their owning crate.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hard ceiling on a compressed packet, imposed by the overlay's effective MTU.
pub const MAX_COMPRESSED: usize = 350;

/// Recent-history window size for the dedup ring.
pub const DEDUP_CAPACITY: usize = 1024;

/// A Peer Record expires if no announce has been seen within this window.
pub const PEER_TIMEOUT_SECS: u64 = 300;

/// Path Controller hysteresis parameters.
pub const FAILURE_THRESHOLD_SECS: f64 = 3.0;
pub const FAILURE_COUNT: u32 = 3;
pub const RECOVERY_COUNT: u32 = 10;

/// Reliable Sender pacing and retry parameters.
pub const SEND_SPACING_SECS: u64 = 5;
pub const PACKET_TIMEOUT_SECS: u64 = 300;
pub const MAX_ATTEMPTS: u32 = 5;
pub const INITIAL_DELAY_SECS: f64 = 12.0;
pub const BACKOFF_FACTOR: f64 = 2.0;
pub const MAX_DELAY_SECS: f64 = 120.0;
pub const RETRY_JITTER: f64 = 0.30;
pub const RETRY_RATE_LIMIT_PER_SEC: f64 = 1.0;

/// Default grace period before the bridge joins multicast groups, letting
/// the overlay radio settle.
pub const STARTUP_DELAY_SECS_DEFAULT: u64 = 10;

/// Suppression window for the per-remote log rate limiter: the same
/// `(hostname, message)` pair logs at most once per this many seconds.
pub const LOG_RATE_LIMIT_WINDOW_SECS: f64 = 60.0;

/// 128-bit content digest used for dedup and delivery tracking.
///
/// Truncated to 16 bytes, matching the width of the overlay's own
/// destination/address hashes so the two namespaces read uniformly in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 16]);

impl ContentHash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(bytes);
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&digest[..16]);
        ContentHash(hash)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Monotonic millisecond timestamp assigned at packet creation on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PacketId(pub u64);

impl PacketId {
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        PacketId(millis)
    }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque fixed-width address used to unicast-send to a remote node.
/// Owned and interpreted by the Overlay Transport; we only move it around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationHash(pub [u8; 16]);

impl DestinationHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for DestinationHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The application port a datagram arrived on or is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppPort(pub u16);

/// The unit flowing from the Bus Bridge through compression/dedup to the
/// Spool (outbound) or from the Ingress Router back to the Bus Bridge
/// (inbound, decompressed, carrying no `source_port`).
#[derive(Debug, Clone)]
pub struct PacketEnvelope {
    pub raw_bytes: Vec<u8>,
    pub compressed_bytes: Vec<u8>,
    pub content_hash: ContentHash,
    pub packet_id: PacketId,
    pub source_port: AppPort,
}

impl PacketEnvelope {
    pub fn new(raw_bytes: Vec<u8>, compressed_bytes: Vec<u8>, source_port: AppPort) -> Self {
        let content_hash = ContentHash::from_bytes(&compressed_bytes);
        PacketEnvelope { raw_bytes, compressed_bytes, content_hash, packet_id: PacketId::now(), source_port }
    }
}

/// Remote node mode as decided by the Path Controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathMode {
    Primary,
    Overlay,
}

pub fn now_secs_f64() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic_and_16_bytes() {
        let a = ContentHash::from_bytes(b"hello");
        let b = ContentHash::from_bytes(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 16);
    }

    #[test]
    fn content_hash_differs_for_different_input() {
        let a = ContentHash::from_bytes(b"hello");
        let b = ContentHash::from_bytes(b"world");
        assert_ne!(a, b);
    }

    #[test]
    fn packet_id_is_monotonic_enough() {
        let a = PacketId::now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = PacketId::now();
        assert!(b >= a);
    }
}
