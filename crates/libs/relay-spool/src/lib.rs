//! Durable on-disk staging across `pending/` -> `processing/` ->
//! `sent_buffer/`, with every transition an atomic same-filesystem rename
//! of a fully-written temp file: write to a `.tmp-<nanos>` sibling,
//! `fsync`, then `rename`.
//!
//! This is the only component that touches the filesystem; it defines
//! all filesystem recovery policy.

use relay_types::PacketId;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("no spool file found for packet {0}")]
    NotFound(PacketId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Pending,
    Processing,
    SentBuffer,
}

/// The three-directory staging area. `root` must be a single filesystem
/// mount — `rename` across mounts is not atomic, and this type assumes it
/// always is. `pending/`, `processing/`, and `sent_buffer/` must live on
/// the same filesystem as each other.
pub struct Spool {
    pending: PathBuf,
    processing: PathBuf,
    sent_buffer: PathBuf,
}

impl Spool {
    /// Opens (creating if needed) the three staging directories under
    /// `root`, then flushes any files left in `processing/` by a prior,
    /// uncleanly-terminated run back into `pending/`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, SpoolError> {
        let root = root.as_ref();
        let pending = root.join("pending");
        let processing = root.join("processing");
        let sent_buffer = root.join("sent_buffer");
        for dir in [&pending, &processing, &sent_buffer] {
            fs::create_dir_all(dir)?;
        }
        let spool = Spool { pending, processing, sent_buffer };
        spool.flush_processing_into_pending()?;
        Ok(spool)
    }

    fn flush_processing_into_pending(&self) -> Result<(), SpoolError> {
        for entry in fs::read_dir(&self.processing)? {
            let entry = entry?;
            let name = entry.file_name();
            let from = entry.path();
            let to = self.pending.join(&name);
            fs::rename(from, to)?;
            tracing::warn!(file = ?name, "recovered stale processing file into pending on startup");
        }
        Ok(())
    }

    /// Writes `compressed_bytes` to a temp sibling of `pending/`, syncs it,
    /// then renames it into place. Returns the packet id encoded in the
    /// resulting filename.
    pub fn stage(&self, compressed_bytes: &[u8]) -> Result<PacketId, SpoolError> {
        let packet_id = PacketId::now();
        atomic_write(&self.pending, &filename(packet_id), compressed_bytes)?;
        Ok(packet_id)
    }

    /// Moves the lexicographically-oldest `pending/` file into
    /// `processing/`, returning its id and bytes. Files sort lexicographically
    /// by the millisecond `packet_id` embedded in the name, recovering send
    /// order.
    pub fn claim_oldest(&self) -> Result<Option<(PacketId, Vec<u8>)>, SpoolError> {
        let mut names = self.list_stage(Stage::Pending)?;
        names.sort();
        let Some(name) = names.into_iter().next() else {
            return Ok(None);
        };
        let packet_id = parse_packet_id(&name).ok_or_else(|| {
            SpoolError::Io(io::Error::new(io::ErrorKind::InvalidData, format!("unparseable spool filename {name}")))
        })?;
        let from = self.pending.join(&name);
        let to = self.processing.join(&name);
        let bytes = fs::read(&from)?;
        fs::rename(from, to)?;
        Ok(Some((packet_id, bytes)))
    }

    /// Moves a packet from `processing/` to `sent_buffer/` once every
    /// current target has `sent=true`.
    pub fn promote_to_buffer(&self, packet_id: PacketId) -> Result<(), SpoolError> {
        let name = filename(packet_id);
        let from = self.processing.join(&name);
        let to = self.sent_buffer.join(&name);
        fs::rename(from, to).map_err(|err| io_or_not_found(err, packet_id))
    }

    /// Reads a buffered packet's bytes back out, for a retry resend.
    pub fn read_buffer(&self, packet_id: PacketId) -> Result<Vec<u8>, SpoolError> {
        let path = self.sent_buffer.join(filename(packet_id));
        fs::read(&path).map_err(|err| io_or_not_found(err, packet_id))
    }

    /// Deletes a packet from `sent_buffer/` once every target has reached a
    /// terminal state.
    pub fn release(&self, packet_id: PacketId) -> Result<(), SpoolError> {
        let path = self.sent_buffer.join(filename(packet_id));
        fs::remove_file(&path).map_err(|err| io_or_not_found(err, packet_id))
    }

    /// Removes every file across all three directories. Invoked when no
    /// `OVERLAY` peer remains and there is nowhere for pending packets to
    /// go.
    pub fn purge_all(&self) -> Result<(), SpoolError> {
        for dir in [&self.pending, &self.processing, &self.sent_buffer] {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    pub fn pending_ids(&self) -> Result<Vec<PacketId>, SpoolError> {
        self.stage_ids(Stage::Pending)
    }

    pub fn sent_buffer_ids(&self) -> Result<Vec<PacketId>, SpoolError> {
        self.stage_ids(Stage::SentBuffer)
    }

    fn stage_ids(&self, stage: Stage) -> Result<Vec<PacketId>, SpoolError> {
        Ok(self.list_stage(stage)?.into_iter().filter_map(|name| parse_packet_id(&name)).collect())
    }

    fn list_stage(&self, stage: Stage) -> Result<Vec<String>, SpoolError> {
        let dir = match stage {
            Stage::Pending => &self.pending,
            Stage::Processing => &self.processing,
            Stage::SentBuffer => &self.sent_buffer,
        };
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

fn io_or_not_found(err: io::Error, packet_id: PacketId) -> SpoolError {
    if err.kind() == io::ErrorKind::NotFound {
        SpoolError::NotFound(packet_id)
    } else {
        SpoolError::Io(err)
    }
}

fn filename(packet_id: PacketId) -> String {
    format!("packet_{}.zst", packet_id.0)
}

fn parse_packet_id(name: &str) -> Option<PacketId> {
    let stem = name.strip_prefix("packet_")?.strip_suffix(".zst")?;
    stem.parse::<u64>().ok().map(PacketId)
}

fn atomic_write(dir: &Path, filename: &str, data: &[u8]) -> io::Result<()> {
    use std::io::Write;
    let unique = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let tmp_path = dir.join(format!(".{filename}.tmp-{unique}"));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, dir.join(filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stage_then_claim_round_trips_bytes_in_order() {
        let dir = tempdir().expect("tempdir");
        let spool = Spool::open(dir.path()).expect("open spool");
        let first = spool.stage(b"one").expect("stage one");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let _second = spool.stage(b"two").expect("stage two");

        let (claimed_id, bytes) = spool.claim_oldest().expect("claim").expect("some");
        assert_eq!(claimed_id, first);
        assert_eq!(bytes, b"one");
        assert_eq!(spool.pending_ids().unwrap().len(), 1);
    }

    #[test]
    fn promote_and_release_move_through_stages() {
        let dir = tempdir().expect("tempdir");
        let spool = Spool::open(dir.path()).expect("open spool");
        let id = spool.stage(b"payload").expect("stage");
        let (claimed, _) = spool.claim_oldest().expect("claim").expect("some");
        assert_eq!(claimed, id);

        spool.promote_to_buffer(id).expect("promote");
        assert_eq!(spool.sent_buffer_ids().unwrap(), vec![id]);
        assert_eq!(spool.read_buffer(id).unwrap(), b"payload");

        spool.release(id).expect("release");
        assert!(spool.sent_buffer_ids().unwrap().is_empty());
    }

    #[test]
    fn startup_flushes_processing_back_into_pending() {
        let dir = tempdir().expect("tempdir");
        {
            let spool = Spool::open(dir.path()).expect("open spool");
            let id = spool.stage(b"in-flight").expect("stage");
            spool.claim_oldest().expect("claim").expect("some");
            assert_eq!(spool.pending_ids().unwrap().len(), 0);
            let _ = id;
        }
        // A fresh Spool::open simulates a restart after an unclean exit.
        let spool = Spool::open(dir.path()).expect("reopen spool");
        assert_eq!(spool.pending_ids().unwrap().len(), 1);
    }

    #[test]
    fn purge_all_leaves_no_orphan_files() {
        let dir = tempdir().expect("tempdir");
        let spool = Spool::open(dir.path()).expect("open spool");
        spool.stage(b"a").unwrap();
        let id = spool.stage(b"b").unwrap();
        spool.claim_oldest().unwrap();
        spool.promote_to_buffer(id).ok();

        spool.purge_all().expect("purge");
        assert!(spool.pending_ids().unwrap().is_empty());
        assert!(spool.sent_buffer_ids().unwrap().is_empty());
    }

    #[test]
    fn release_of_missing_buffer_file_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let spool = Spool::open(dir.path()).expect("open spool");
        let result = spool.release(PacketId(1));
        assert!(matches!(result, Err(SpoolError::NotFound(_))));
    }
}
