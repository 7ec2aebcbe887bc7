//! Ops UI export surface: the bounded packet event log. The peer
//! directory's own `export()` ([`relay_peers::PeerDirectory::export_to_file`])
//! and the Path Controller's own `write_path_state_file`
//! ([`relay_path::write_path_state_file`]) cover the other two snapshots
//! the Ops UI reads; this crate owns only the third: a rolling log of
//! recent packet events, since no other component has a natural home for
//! it.

use relay_types::{now_secs_f64, ContentHash, PacketId, LOG_RATE_LIMIT_WINDOW_SECS};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_EVENTS: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketEventKind {
    Staged,
    Sent,
    Delivered,
    Retried,
    Failed,
    Cancelled,
    DroppedDuplicate,
    DroppedMalformed,
    DroppedTooLarge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketEvent {
    pub timestamp: f64,
    pub packet_id: Option<PacketId>,
    pub content_hash: Option<ContentHash>,
    pub hostname: Option<String>,
    pub kind: PacketEventKind,
    pub detail: Option<String>,
}

/// Fixed-capacity ring of the most recent packet events, for the Ops UI's
/// read-only activity feed. Not consulted by any decision logic — purely
/// observational.
pub struct PacketEventLog {
    events: Mutex<VecDeque<PacketEvent>>,
}

impl PacketEventLog {
    pub fn new() -> Self {
        PacketEventLog { events: Mutex::new(VecDeque::with_capacity(MAX_EVENTS)) }
    }

    pub fn record(
        &self,
        kind: PacketEventKind,
        packet_id: Option<PacketId>,
        content_hash: Option<ContentHash>,
        hostname: Option<String>,
        detail: Option<String>,
    ) {
        let mut events = self.events.lock().expect("packet event log mutex poisoned");
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(PacketEvent { timestamp: now_secs_f64(), packet_id, content_hash, hostname, kind, detail });
    }

    pub fn snapshot(&self) -> Vec<PacketEvent> {
        self.events.lock().expect("packet event log mutex poisoned").iter().cloned().collect()
    }

    pub fn export_to_file(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let events = self.snapshot();
        let bytes = serde_json::to_vec_pretty(&events)?;
        atomic_write(path.as_ref(), &bytes)
    }
}

impl Default for PacketEventLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Suppresses repeated identical log lines from the same remote. Keyed by
/// `(hostname, message)` so one flapping remote's noise never silences a
/// different remote's first occurrence of the same message.
#[derive(Default)]
pub struct RateLimiter {
    last_emitted: Mutex<HashMap<(String, String), f64>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter { last_emitted: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` the first time `(hostname, message)` is seen, and at
    /// most once per [`LOG_RATE_LIMIT_WINDOW_SECS`] after that. Call sites
    /// gate their `tracing::warn!`/`tracing::error!` on this.
    pub fn allow(&self, hostname: &str, message: &str) -> bool {
        let now = now_secs_f64();
        let mut last_emitted = self.last_emitted.lock().expect("rate limiter mutex poisoned");
        let key = (hostname.to_string(), message.to_string());
        match last_emitted.get(&key) {
            Some(&last) if now - last < LOG_RATE_LIMIT_WINDOW_SECS => false,
            _ => {
                last_emitted.insert(key, now);
                true
            }
        }
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::io::Write;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let unique = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let file_name = path.file_name().and_then(|name| name.to_str()).unwrap_or("packet_events.json");
    let tmp_path = dir.join(format!(".{file_name}.tmp-{unique}"));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_bounded_to_max_events() {
        let log = PacketEventLog::new();
        for i in 0..(MAX_EVENTS + 10) {
            log.record(PacketEventKind::Staged, Some(PacketId(i as u64)), None, None, None);
        }
        assert_eq!(log.snapshot().len(), MAX_EVENTS);
        // oldest entries were evicted: the first surviving id is offset by
        // exactly the overflow count.
        assert_eq!(log.snapshot().first().unwrap().packet_id, Some(PacketId(10)));
    }

    #[test]
    fn export_writes_valid_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let log = PacketEventLog::new();
        log.record(PacketEventKind::Delivered, Some(PacketId(1)), None, Some("node-a".into()), None);
        let path = dir.path().join("packet_events.json");
        log.export_to_file(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        let parsed: Vec<PacketEvent> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn rate_limiter_allows_first_occurrence_then_suppresses() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("node-a", "socket read failed"));
        assert!(!limiter.allow("node-a", "socket read failed"));
    }

    #[test]
    fn rate_limiter_keys_are_independent_per_hostname_and_message() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("node-a", "socket read failed"));
        assert!(limiter.allow("node-b", "socket read failed"), "a different hostname must not be suppressed");
        assert!(limiter.allow("node-a", "observer file malformed"), "a different message must not be suppressed");
    }
}
