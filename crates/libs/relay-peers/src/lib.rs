//! Peer Directory: hostname <-> overlay-identity mapping sourced from
//! announce traffic. Exclusively owned and written by the peer-directory
//! task; every other task reads a cloned snapshot, never the live map.

use rand::Rng;
use relay_overlay::{AnnounceEvent, IdentityHandle, OverlayTransport};
use relay_types::{DestinationHash, PEER_TIMEOUT_SECS};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub hostname: String,
    pub identity_handle: IdentityHandle,
    pub destination_hash: DestinationHash,
    pub last_announce_time: f64,
}

#[derive(Serialize)]
struct ExportedPeer {
    destination_hash: String,
    last_seen: f64,
}

#[derive(Serialize)]
struct ExportedDirectory {
    timestamp: f64,
    peers: HashMap<String, ExportedPeer>,
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Maintains the live hostname -> [`PeerRecord`] map. Populated by inbound
/// announces; exports a read-only JSON snapshot for the Ops UI.
pub struct PeerDirectory {
    records: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerDirectory {
    /// The directory always begins empty, regardless of any prior on-disk
    /// export — there is no startup rehydration. A peer's status is only
    /// ever as trustworthy as its most recent announce.
    pub fn new() -> Arc<Self> {
        Arc::new(PeerDirectory { records: Mutex::new(HashMap::new()) })
    }

    /// Add-or-update the record for `hostname`, refreshing
    /// `last_announce_time`. Returns `true` if this hostname was not
    /// previously known, so the caller can trigger the randomized one-shot
    /// re-announce.
    pub fn on_announce(&self, event: &AnnounceEvent, hostname: String) -> bool {
        let mut records = self.records.lock().expect("peer directory mutex poisoned");
        let is_new = !records.contains_key(&hostname);
        records.insert(
            hostname.clone(),
            PeerRecord {
                hostname,
                identity_handle: event.identity.clone(),
                destination_hash: event.destination_hash,
                last_announce_time: now_secs(),
            },
        );
        is_new
    }

    /// Consistent snapshot of hostname -> identity, per the directory's
    /// documented `peers()` contract.
    pub fn peers(&self) -> HashMap<String, IdentityHandle> {
        self.records
            .lock()
            .expect("peer directory mutex poisoned")
            .iter()
            .map(|(hostname, record)| (hostname.clone(), record.identity_handle.clone()))
            .collect()
    }

    /// Full-record snapshot, for components (the Reliable Sender) that also
    /// need the destination hash.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.records.lock().expect("peer directory mutex poisoned").values().cloned().collect()
    }

    pub fn get(&self, hostname: &str) -> Option<PeerRecord> {
        self.records.lock().expect("peer directory mutex poisoned").get(hostname).cloned()
    }

    /// Removes records older than [`PEER_TIMEOUT_SECS`]. Invoked by the
    /// Path Controller's housekeeping tick.
    pub fn clean_stale(&self) {
        let cutoff = now_secs() - PEER_TIMEOUT_SECS as f64;
        let mut records = self.records.lock().expect("peer directory mutex poisoned");
        records.retain(|_, record| record.last_announce_time >= cutoff);
    }

    pub fn export(&self) -> serde_json::Value {
        let records = self.records.lock().expect("peer directory mutex poisoned");
        let peers = records
            .iter()
            .map(|(hostname, record)| {
                (
                    hostname.clone(),
                    ExportedPeer {
                        destination_hash: record.destination_hash.to_hex(),
                        last_seen: record.last_announce_time,
                    },
                )
            })
            .collect();
        serde_json::to_value(ExportedDirectory { timestamp: now_secs(), peers }).expect("serialize directory export")
    }

    /// Atomically (temp + rename) writes [`PeerDirectory::export`] to
    /// `path`, for the Ops UI's read-only peer snapshot.
    pub fn export_to_file(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let value = self.export();
        let bytes = serde_json::to_vec_pretty(&value)?;
        atomic_write(path.as_ref(), &bytes)
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::io::Write;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let unique = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let file_name = path.file_name().and_then(|name| name.to_str()).unwrap_or("export.json");
    let tmp_path = dir.join(format!(".{file_name}.tmp-{unique}"));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

/// Runs the 60-second periodic self-announce until `shutdown` resolves.
pub async fn run_periodic_announce(
    overlay: Arc<dyn OverlayTransport>,
    app_data: Vec<u8>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = sleep(Duration::from_secs(60)) => {
                overlay.announce(&app_data);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Fires a single randomized 0.5-1.5s-delayed announce, used when a new
/// peer is first seen to avoid announce collisions.
pub async fn announce_self_once_delayed(overlay: Arc<dyn OverlayTransport>, app_data: Vec<u8>) {
    let delay_ms = rand::thread_rng().gen_range(500..=1500);
    sleep(Duration::from_millis(delay_ms)).await;
    overlay.announce(&app_data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_overlay::IdentityHandle;

    fn event(destination: u8, identity: u8) -> AnnounceEvent {
        AnnounceEvent {
            destination_hash: DestinationHash([destination; 16]),
            identity: IdentityHandle::from_bytes(vec![identity; 16]),
            app_data: b"node".to_vec(),
        }
    }

    #[test]
    fn on_announce_reports_new_then_not_new() {
        let directory = PeerDirectory::new();
        assert!(directory.on_announce(&event(1, 1), "node-a".into()));
        assert!(!directory.on_announce(&event(1, 1), "node-a".into()));
        assert_eq!(directory.peers().len(), 1);
    }

    #[test]
    fn clean_stale_removes_expired_records() {
        let directory = PeerDirectory::new();
        directory.on_announce(&event(2, 2), "node-b".into());
        {
            let mut records = directory.records.lock().unwrap();
            let record = records.get_mut("node-b").unwrap();
            record.last_announce_time = now_secs() - (PEER_TIMEOUT_SECS as f64 + 1.0);
        }
        directory.clean_stale();
        assert!(directory.peers().is_empty());
    }

    #[test]
    fn export_contains_every_known_peer() {
        let directory = PeerDirectory::new();
        directory.on_announce(&event(3, 3), "node-c".into());
        let exported = directory.export();
        assert!(exported["peers"]["node-c"]["destination_hash"].is_string());
    }

    #[tokio::test]
    async fn directory_begins_empty_regardless_of_prior_state() {
        let directory = PeerDirectory::new();
        assert!(directory.peers().is_empty());
    }
}
