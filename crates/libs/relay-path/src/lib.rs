//! Path Controller: per-remote hysteretic PRIMARY/OVERLAY decision core.
//! `failure_count`/`good_count` are collapsed into one type-level enum so
//! "never both nonzero" cannot be violated by construction.

use relay_status::RateLimiter;
use relay_types::{now_secs_f64, FAILURE_COUNT, FAILURE_THRESHOLD_SECS, PEER_TIMEOUT_SECS, RECOVERY_COUNT};
use relay_types::PathMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("observer I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("observer file was not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Consecutive-observation streak. Exactly one variant is ever live for a
/// remote, so failure and good counts can never both rise at once — that
/// invariant holds at the type level rather than by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "count")]
pub enum Hysteresis {
    Failing(u32),
    Recovering(u32),
}

impl Hysteresis {
    fn record_bad(self) -> Self {
        match self {
            Hysteresis::Failing(n) => Hysteresis::Failing(n + 1),
            Hysteresis::Recovering(_) => Hysteresis::Failing(1),
        }
    }

    fn record_good(self) -> Self {
        match self {
            Hysteresis::Recovering(n) => Hysteresis::Recovering(n + 1),
            Hysteresis::Failing(_) => Hysteresis::Recovering(1),
        }
    }

    fn failure_count(self) -> u32 {
        match self {
            Hysteresis::Failing(n) => n,
            Hysteresis::Recovering(_) => 0,
        }
    }

    fn good_count(self) -> u32 {
        match self {
            Hysteresis::Recovering(n) => n,
            Hysteresis::Failing(_) => 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PathState {
    mode: PathMode,
    hysteresis: Hysteresis,
    last_observed: f64,
}

/// One remote's observation for this tick: a fresh heartbeat age, or no
/// observation at all (counted as a failure per spec: "absence of an
/// observation counts as a failure").
#[derive(Debug, Clone, Copy)]
pub enum Observation {
    Heartbeat { seconds_since_last: f64 },
    Unobserved,
}

/// The PRIMARY/OVERLAY decision core. Exclusively owned and advanced by the
/// path-controller task; every other task reads `modes()` snapshots.
pub struct PathController {
    remotes: Mutex<HashMap<String, PathState>>,
}

impl PathController {
    pub fn new() -> Self {
        PathController { remotes: Mutex::new(HashMap::new()) }
    }

    /// Advances one remote by one tick. An unknown remote is created fresh
    /// in `PRIMARY` with both counters at zero before the observation is
    /// applied, per spec: "An unknown or freshly-added remote starts in
    /// PRIMARY".
    pub fn observe(&self, hostname: &str, observation: Observation) {
        let now = now_secs_f64();
        let mut remotes = self.remotes.lock().expect("path controller mutex poisoned");
        let state = remotes.entry(hostname.to_string()).or_insert(PathState {
            mode: PathMode::Primary,
            hysteresis: Hysteresis::Recovering(0),
            last_observed: now,
        });
        state.last_observed = now;

        let is_good = match observation {
            Observation::Heartbeat { seconds_since_last } => seconds_since_last <= FAILURE_THRESHOLD_SECS,
            Observation::Unobserved => false,
        };

        state.hysteresis = if is_good { state.hysteresis.record_good() } else { state.hysteresis.record_bad() };

        match state.mode {
            PathMode::Primary => {
                if state.hysteresis.failure_count() >= FAILURE_COUNT {
                    state.mode = PathMode::Overlay;
                }
            }
            PathMode::Overlay => {
                if state.hysteresis.good_count() >= RECOVERY_COUNT {
                    state.mode = PathMode::Primary;
                }
            }
        }
    }

    /// Snapshot of every known remote's current mode, queried by the
    /// Reliable Sender on every fan-out attempt.
    pub fn modes(&self) -> HashMap<String, PathMode> {
        self.remotes
            .lock()
            .expect("path controller mutex poisoned")
            .iter()
            .map(|(hostname, state)| (hostname.clone(), state.mode))
            .collect()
    }

    /// Drops remotes that have not produced a tick observation (good or
    /// bad) within `PEER_TIMEOUT_SECS`, i.e. that have disappeared from the
    /// Observer's feed entirely rather than merely failing. Without this,
    /// a remote that vanishes mid-PRIMARY never clears and its last mode
    /// lingers forever in the exported path state.
    pub fn clean_stale(&self) {
        let cutoff = now_secs_f64() - PEER_TIMEOUT_SECS as f64;
        let mut remotes = self.remotes.lock().expect("path controller mutex poisoned");
        remotes.retain(|_, state| state.last_observed >= cutoff);
    }
}

impl Default for PathController {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize)]
struct ObserverNode {
    last_seen: f64,
    #[serde(default)]
    hostname: Option<String>,
}

#[derive(Serialize, Deserialize, Default)]
struct ObserverFile {
    nodes: HashMap<String, ObserverNode>,
}

/// Reads the external Observer's `{nodes: {MAC: {last_seen, ...}}}` feed.
/// A missing or malformed file is treated as "nothing observed this
/// tick" rather than an error — the Observer may not have written its
/// first snapshot yet, or may be mid-write.
pub fn read_observer_file(path: impl AsRef<Path>) -> HashMap<String, f64> {
    static MALFORMED_FILE_LIMITER: OnceLock<RateLimiter> = OnceLock::new();
    let path = path.as_ref();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return HashMap::new(),
    };
    let parsed: ObserverFile = match serde_json::from_slice(&bytes) {
        Ok(parsed) => parsed,
        Err(err) => {
            let limiter = MALFORMED_FILE_LIMITER.get_or_init(RateLimiter::new);
            let path_display = path.display().to_string();
            if limiter.allow(&path_display, "observer file was not valid JSON") {
                tracing::warn!(path = %path_display, error = %err, "observer file was not valid JSON");
            }
            return HashMap::new();
        }
    };
    parsed
        .nodes
        .into_iter()
        .map(|(mac, node)| (node.hostname.unwrap_or(mac), node.last_seen))
        .collect()
}

#[derive(Serialize)]
struct ExportedNode {
    mode: &'static str,
    failure_count: u32,
    good_count: u32,
    last_seen: f64,
}

/// Atomically writes this controller's decisions back to `path`, matching
/// the Observer file's own schema so the Ops UI can read path state and
/// observer heartbeats from parallel files with the same shape.
pub fn write_path_state_file(controller: &PathController, path: impl AsRef<Path>) -> Result<(), PathError> {
    let nodes: HashMap<String, ExportedNode> = {
        let remotes = controller.remotes.lock().expect("path controller mutex poisoned");
        remotes
            .iter()
            .map(|(hostname, state)| {
                (
                    hostname.clone(),
                    ExportedNode {
                        mode: match state.mode {
                            PathMode::Primary => "PRIMARY",
                            PathMode::Overlay => "OVERLAY",
                        },
                        failure_count: state.hysteresis.failure_count(),
                        good_count: state.hysteresis.good_count(),
                        last_seen: state.last_observed,
                    },
                )
            })
            .collect()
    };
    let bytes = serde_json::to_vec_pretty(&nodes)?;
    atomic_write(path.as_ref(), &bytes)?;
    Ok(())
}

fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::io::Write;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let unique = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let file_name = path.file_name().and_then(|name| name.to_str()).unwrap_or("path_state.json");
    let tmp_path = dir.join(format!(".{file_name}.tmp-{unique}"));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}
