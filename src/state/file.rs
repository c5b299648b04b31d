//! File state manager
//!
//! Append-only record log, one file per cluster. Every state change is
//! appended as a CRC-checked bincode record; the log is replayed and
//! compacted down to one record per member each time it is opened.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{ClusterState, StateManager, StateManagerKind};
use crate::error::{Error, Result};

/// Magic bytes at the start of each state file
const STATE_MAGIC: &[u8; 8] = b"WOLFHAST";

/// State file version
const STATE_VERSION: u32 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 12;

/// Record frame: [length: u32][checksum: u32][payload]
const FRAME_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum StateRecord {
    Active(String),
    Inactive(String),
    /// Member id and timestamp in milliseconds
    Synchronized(String, i64),
}

impl StateRecord {
    fn apply(self, state: &mut ClusterState) {
        match self {
            StateRecord::Active(id) => state.entry(id).or_default().active = true,
            StateRecord::Inactive(id) => state.entry(id).or_default().active = false,
            StateRecord::Synchronized(id, ms) => {
                state.entry(id).or_default().last_synchronized = Utc.timestamp_millis_opt(ms).single();
            }
        }
    }
}

fn header() -> [u8; HEADER_SIZE] {
    let mut bytes = [0u8; HEADER_SIZE];
    bytes[0..8].copy_from_slice(STATE_MAGIC);
    bytes[8..12].copy_from_slice(&STATE_VERSION.to_le_bytes());
    bytes
}

fn encode_record(record: &StateRecord) -> Result<Vec<u8>> {
    let payload = bincode::serialize(record)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Replay a state file. A torn or corrupt record ends the replay; everything
/// before it is kept.
fn replay(path: &Path, bytes: &[u8]) -> Result<ClusterState> {
    if bytes.len() < HEADER_SIZE || &bytes[0..8] != STATE_MAGIC {
        return Err(Error::StateCorrupted(format!("{}: invalid magic bytes", path.display())));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[8..12]);
    let version = u32::from_le_bytes(version);
    if version != STATE_VERSION {
        return Err(Error::StateCorrupted(format!(
            "{}: unsupported version {}",
            path.display(),
            version
        )));
    }

    let mut state = ClusterState::new();
    let mut pos = HEADER_SIZE;
    let mut records = 0;
    while pos < bytes.len() {
        match read_record(&bytes[pos..]) {
            Some((record, len)) => {
                record.apply(&mut state);
                pos += len;
                records += 1;
            }
            None => {
                tracing::warn!("Ignoring {} trailing bytes of {} after {} records",
                    bytes.len() - pos, path.display(), records);
                break;
            }
        }
    }
    Ok(state)
}

fn read_record(bytes: &[u8]) -> Option<(StateRecord, usize)> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return None;
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let checksum = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let payload = bytes.get(FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len)?;
    if crc32fast::hash(payload) != checksum {
        return None;
    }
    let record = bincode::deserialize(payload).ok()?;
    Some((record, FRAME_HEADER_SIZE + len))
}

/// Records that reproduce `state`
fn snapshot_records(state: &ClusterState) -> Vec<StateRecord> {
    let mut records = Vec::new();
    for (id, db) in state {
        records.push(if db.active {
            StateRecord::Active(id.clone())
        } else {
            StateRecord::Inactive(id.clone())
        });
        if let Some(at) = db.last_synchronized {
            records.push(StateRecord::Synchronized(id.clone(), at.timestamp_millis()));
        }
    }
    records
}

/// Storage a log appends frames to
trait LogSink: Write {
    fn size(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogSink for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

struct OpenLog<S = File> {
    file: S,
    state: ClusterState,
    /// A failed append could not be rolled back; the log must be rewritten
    /// before anything else is appended
    torn: bool,
}

impl<S: LogSink> OpenLog<S> {
    fn new(file: S, state: ClusterState) -> Self {
        Self {
            file,
            state,
            torn: false,
        }
    }

    /// Append one record. A frame that fails part way is cut off again, so
    /// records appended later stay reachable on replay.
    fn append(&mut self, record: StateRecord) -> Result<()> {
        let frame = encode_record(&record)?;
        let len = self.file.size()?;

        if let Err(e) = self.file.write_all(&frame).and_then(|()| self.file.sync()) {
            if let Err(cut) = self.file.truncate(len) {
                tracing::error!("Could not remove partial state record: {}", cut);
                self.torn = true;
            }
            return Err(e.into());
        }
        record.apply(&mut self.state);
        Ok(())
    }
}

/// Persistent state manager backed by an append-only record log
pub struct FileStateManager {
    path: PathBuf,
    log: Mutex<Option<OpenLog>>,
}

impl FileStateManager {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            log: Mutex::new(None),
        }
    }

    /// Rewrite the log with one record per member and open it for appending
    fn compact(&self, state: &ClusterState) -> Result<File> {
        let tmp = self.path.with_extension("compact");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&header())?;
            for record in snapshot_records(state) {
                file.write_all(&encode_record(&record)?)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        Ok(OpenOptions::new().append(true).open(&self.path)?)
    }

    async fn append(&self, record: StateRecord) -> Result<()> {
        let mut log = self.log.lock().await;
        let log = log
            .as_mut()
            .ok_or_else(|| Error::State("file state manager not started".into()))?;
        if log.torn {
            tracing::warn!("Rewriting state log {:?} after a failed append", self.path);
            log.file = self.compact(&log.state)?;
            log.torn = false;
        }
        log.append(record)
    }
}

#[async_trait]
impl StateManager for FileStateManager {
    async fn start(&self) -> Result<()> {
        let mut log = self.log.lock().await;
        if log.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let state = if self.path.exists() {
            replay(&self.path, &fs::read(&self.path)?)?
        } else {
            ClusterState::new()
        };

        let file = self.compact(&state)?;
        tracing::debug!("Opened state log {:?} with {} members", self.path, state.len());
        *log = Some(OpenLog::new(file, state));
        Ok(())
    }

    async fn cluster_state(&self) -> Result<ClusterState> {
        let log = self.log.lock().await;
        let log = log
            .as_ref()
            .ok_or_else(|| Error::State("file state manager not started".into()))?;
        Ok(log.state.clone())
    }

    async fn record_active(&self, id: &str) -> Result<()> {
        self.append(StateRecord::Active(id.to_string())).await
    }

    async fn record_inactive(&self, id: &str) -> Result<()> {
        self.append(StateRecord::Inactive(id.to_string())).await
    }

    async fn record_synchronized(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.append(StateRecord::Synchronized(id.to_string(), at.timestamp_millis()))
            .await
    }

    async fn stop(&self) -> Result<()> {
        if let Some(log) = self.log.lock().await.take() {
            log.file.sync_all()?;
        }
        Ok(())
    }

    fn kind(&self) -> StateManagerKind {
        StateManagerKind::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_contract() {
        let dir = tempdir().unwrap();
        let manager = FileStateManager::new(dir.path().join("default.state"));
        super::super::tests::check_contract(&manager).await;
    }

    #[tokio::test]
    async fn test_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("default.state");

        let manager = FileStateManager::new(path.clone());
        manager.start().await.unwrap();
        manager.record_active("db1").await.unwrap();
        manager.record_active("db2").await.unwrap();
        manager.record_inactive("db1").await.unwrap();
        manager.record_synchronized("db2", Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()).await.unwrap();
        manager.stop().await.unwrap();

        let manager = FileStateManager::new(path);
        manager.start().await.unwrap();
        let state = manager.cluster_state().await.unwrap();
        assert!(!state["db1"].active);
        assert!(state["db2"].active);
        assert_eq!(state["db2"].last_synchronized.unwrap().timestamp_millis(), 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_compaction_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("default.state");

        let manager = FileStateManager::new(path.clone());
        manager.start().await.unwrap();
        for _ in 0..100 {
            manager.record_active("db1").await.unwrap();
            manager.record_inactive("db1").await.unwrap();
        }
        manager.stop().await.unwrap();
        let before = fs::metadata(&path).unwrap().len();

        let manager = FileStateManager::new(path.clone());
        manager.start().await.unwrap();
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before);
        assert_eq!(after as usize, HEADER_SIZE + encode_record(&StateRecord::Inactive("db1".into())).unwrap().len());
        assert!(manager.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("default.state");

        let manager = FileStateManager::new(path.clone());
        manager.start().await.unwrap();
        manager.record_active("db1").await.unwrap();
        manager.stop().await.unwrap();

        // Half-written record
        let partial = encode_record(&StateRecord::Active("db2".into())).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() - 2]).unwrap();
        drop(file);

        let manager = FileStateManager::new(path);
        manager.start().await.unwrap();
        let active = manager.list_active().await.unwrap();
        assert_eq!(active.into_iter().collect::<Vec<_>>(), vec!["db1".to_string()]);
    }

    /// In-memory log that fails writes once `fail_after` bytes went through
    #[derive(Default)]
    struct FlakySink {
        bytes: Vec<u8>,
        fail_after: Option<usize>,
        truncate_fails: bool,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.fail_after {
                Some(0) => Err(io::Error::new(io::ErrorKind::Other, "disk full")),
                Some(limit) => {
                    let n = buf.len().min(limit);
                    self.bytes.extend_from_slice(&buf[..n]);
                    self.fail_after = Some(limit - n);
                    Ok(n)
                }
                None => {
                    self.bytes.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogSink for FlakySink {
        fn size(&self) -> io::Result<u64> {
            Ok(self.bytes.len() as u64)
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            if self.truncate_fails {
                return Err(io::Error::new(io::ErrorKind::Other, "read-only"));
            }
            self.bytes.truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let sink = FlakySink {
            bytes: header().to_vec(),
            ..FlakySink::default()
        };
        let mut log = OpenLog::new(sink, ClusterState::new());
        log.append(StateRecord::Active("db1".into())).unwrap();
        let intact = log.file.bytes.len();

        // Only part of the next frame reaches the disk
        log.file.fail_after = Some(3);
        assert!(log.append(StateRecord::Active("db2".into())).is_err());
        assert_eq!(log.file.bytes.len(), intact);
        assert!(!log.torn);
        assert!(!log.state.contains_key("db2"));

        log.file.fail_after = None;
        log.append(StateRecord::Active("db3".into())).unwrap();

        let state = replay(Path::new("default.state"), &log.file.bytes).unwrap();
        assert!(state["db1"].active);
        assert!(state["db3"].active);
        assert!(!state.contains_key("db2"));
    }

    #[test]
    fn test_unrecoverable_append_marks_log_torn() {
        let sink = FlakySink {
            bytes: header().to_vec(),
            fail_after: Some(3),
            truncate_fails: true,
        };
        let mut log = OpenLog::new(sink, ClusterState::new());
        assert!(log.append(StateRecord::Active("db1".into())).is_err());
        assert!(log.torn);
    }

    #[tokio::test]
    async fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("default.state");
        fs::write(&path, b"not a state file").unwrap();

        let manager = FileStateManager::new(path);
        assert!(matches!(manager.start().await, Err(Error::StateCorrupted(_))));
    }

    #[test]
    fn test_corrupt_record_detected() {
        let mut frame = encode_record(&StateRecord::Active("db1".into())).unwrap();
        assert!(read_record(&frame).is_some());
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(read_record(&frame).is_none());
    }
}
