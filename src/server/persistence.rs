//! Table server durable persistence: a write-ahead log plus checkpoint
//! snapshots, and crash recovery from them.
//!
//! Files used for instance name `N`:
//!   - `N.log`: the active write-ahead log
//!   - `N.stt`: a snapshot being taken, not yet promoted
//!   - `N.ckp`: the latest promoted checkpoint
//!
//! All three share the same framing: a sequence of `[i32 BE length][bytes]`
//! records, where the length value -2 is a sentinel marking a clean close.

use std::path::{Path, PathBuf};

use crate::message::{decode_key, decode_ts, encode_ts, Timestamp};
use crate::server::{LocalStore, Record};
use crate::utils::QuorumKvError;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use serde::Deserialize;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Length value marking a cleanly closed file.
const SENTINEL: i32 = -2;

/// Length of a record length header.
const HDR_LEN: usize = 4;

/// Durability mode of log appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum SyncMode {
    /// Leave flushing to the OS.
    #[default]
    Buffered,

    /// `sync_data()` after every append.
    DataSync,

    /// `sync_all()` after every append.
    FullSync,
}

/// One write-ahead log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// `put TS_B64 KEY DATA_B64`
    Put {
        key: String,
        payload: Vec<u8>,
        ts: Timestamp,
    },

    /// `del KEY`
    Del { key: String },
}

impl LogRecord {
    fn encode(&self) -> String {
        match self {
            LogRecord::Put { key, payload, ts } => {
                format!("put {}", encode_record_line(key, payload, *ts))
            }
            LogRecord::Del { key } => format!("del {}", key),
        }
    }

    fn decode(line: &str) -> Result<Self, QuorumKvError> {
        match line.split_once(' ') {
            Some(("put", rest)) => {
                let record = decode_record_line(rest)?;
                Ok(LogRecord::Put {
                    key: record.key,
                    payload: record.payload,
                    ts: record.ts,
                })
            }
            Some(("del", key)) => Ok(LogRecord::Del {
                key: decode_key(key)?,
            }),
            _ => Err(QuorumKvError(format!("invalid log record '{}'", line))),
        }
    }

    /// Applies this record onto given store.
    fn apply(self, store: &mut LocalStore) {
        match self {
            LogRecord::Put { key, payload, ts } => {
                store.put(&key, &payload, ts);
            }
            LogRecord::Del { key } => {
                store.del(&key);
            }
        }
    }
}

/// Checkpoint line `TS_B64 KEY DATA_B64`.
fn encode_record_line(key: &str, payload: &[u8], ts: Timestamp) -> String {
    format!("{} {} {}", encode_ts(ts), key, BASE64.encode(payload))
}

fn decode_record_line(line: &str) -> Result<Record, QuorumKvError> {
    let mut parts = line.splitn(3, ' ');
    let ts = decode_ts(parts.next().unwrap_or(""))?;
    let key = decode_key(parts.next().unwrap_or(""))?;
    let payload = BASE64.decode(parts.next().unwrap_or(""))?;
    Ok(Record::new(key, payload, ts))
}

/// Splits file content into record bodies. Stops at the first short or
/// invalid length header. Returns the bodies parsed and whether a sentinel
/// was seen.
fn split_frames(buf: &[u8]) -> (Vec<&[u8]>, bool) {
    let mut frames = Vec::new();
    let mut clean = false;
    let mut offset = 0;
    while offset + HDR_LEN <= buf.len() {
        let mut hdr = [0u8; HDR_LEN];
        hdr.copy_from_slice(&buf[offset..offset + HDR_LEN]);
        let len = i32::from_be_bytes(hdr);
        offset += HDR_LEN;
        if len == SENTINEL {
            clean = true;
            continue;
        }
        if len < 0 || offset + len as usize > buf.len() {
            break;
        }
        frames.push(&buf[offset..offset + len as usize]);
        offset += len as usize;
    }
    (frames, clean)
}

/// Durable persistence manager of one table server instance.
pub struct PersistenceManager {
    /// Path of the write-ahead log.
    log_path: PathBuf,

    /// Path of the un-promoted snapshot.
    stt_path: PathBuf,

    /// Path of the promoted checkpoint.
    ckp_path: PathBuf,

    /// Log size threshold in bytes.
    max_log_size: usize,

    /// Durability mode of appends.
    sync_mode: SyncMode,

    /// Log file handle, opened lazily at first append.
    log_file: Option<File>,

    /// Current size of the log in bytes.
    log_size: usize,
}

// PersistenceManager public API implementation
impl PersistenceManager {
    /// Creates a new persistence manager over files named with the given
    /// prefix. Records the size of an already existing log.
    pub async fn new_and_setup(
        prefix: &str,
        max_log_size: usize,
        sync_mode: SyncMode,
    ) -> Result<Self, QuorumKvError> {
        if prefix.is_empty() {
            return logged_err!("empty persistence file prefix");
        }
        if max_log_size == 0 {
            return logged_err!("invalid max_log_size {}", max_log_size);
        }

        let log_path = PathBuf::from(format!("{}.log", prefix));
        let log_size = if fs::try_exists(&log_path).await? {
            let size = fs::metadata(&log_path).await?.len() as usize;
            pf_info!(
                "log file '{}' exists, {} bytes",
                log_path.display(),
                size
            );
            size
        } else {
            0
        };

        Ok(PersistenceManager {
            log_path,
            stt_path: PathBuf::from(format!("{}.stt", prefix)),
            ckp_path: PathBuf::from(format!("{}.ckp", prefix)),
            max_log_size,
            sync_mode,
            log_file: None,
            log_size,
        })
    }

    /// Current log size in bytes.
    pub fn log_size(&self) -> usize {
        self.log_size
    }

    /// Returns true if there is anything to recover from.
    pub async fn has_data(&self) -> Result<bool, QuorumKvError> {
        if self.log_size > 0 || fs::try_exists(&self.stt_path).await? {
            return Ok(true);
        }
        if fs::try_exists(&self.ckp_path).await? {
            return Ok(fs::metadata(&self.ckp_path).await?.len() > 0);
        }
        Ok(false)
    }

    /// Appends a record to the log. Returns `Ok(false)` without writing
    /// anything if the record would grow the log beyond `max_log_size`; the
    /// caller should then snapshot and rotate before retrying.
    pub async fn append(
        &mut self,
        record: &LogRecord,
    ) -> Result<bool, QuorumKvError> {
        let line = record.encode();
        if self.log_size + HDR_LEN + line.len() > self.max_log_size {
            pf_debug!(
                "log full: {} + {} exceeds {}",
                self.log_size,
                HDR_LEN + line.len(),
                self.max_log_size
            );
            return Ok(false);
        }

        if self.log_file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .await?;
            self.log_file = Some(file);
        }
        if let Some(ref mut file) = self.log_file {
            file.write_i32(line.len() as i32).await?;
            file.write_all(line.as_bytes()).await?;
            match self.sync_mode {
                SyncMode::Buffered => file.flush().await?,
                SyncMode::DataSync => file.sync_data().await?,
                SyncMode::FullSync => file.sync_all().await?,
            }
        }

        self.log_size += HDR_LEN + line.len();
        Ok(true)
    }

    /// Writes a full snapshot of the store into the state file, overwriting
    /// any previous one.
    pub async fn snapshot(
        &mut self,
        store: &LocalStore,
    ) -> Result<(), QuorumKvError> {
        let mut buf = Vec::new();
        for record in store.records() {
            let line =
                encode_record_line(&record.key, &record.payload, record.ts);
            buf.extend_from_slice(&(line.len() as i32).to_be_bytes());
            buf.extend_from_slice(line.as_bytes());
        }
        buf.extend_from_slice(&SENTINEL.to_be_bytes());

        let mut file = File::create(&self.stt_path).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        pf_debug!(
            "snapshot of {} records taken into '{}'",
            store.num_records(),
            self.stt_path.display()
        );
        Ok(())
    }

    /// Deletes the log and promotes a present state file to checkpoint.
    pub async fn rotate(&mut self) -> Result<(), QuorumKvError> {
        self.log_file = None;
        remove_if_exists(&self.log_path).await?;
        self.log_size = 0;

        if fs::try_exists(&self.stt_path).await? {
            fs::rename(&self.stt_path, &self.ckp_path).await?;
            pf_debug!("promoted '{}'", self.ckp_path.display());
        }
        Ok(())
    }

    /// Rebuilds the store from persisted files. A cleanly terminated state
    /// file wins over checkpoint plus log; otherwise the checkpoint is loaded
    /// and the log replayed on top of it.
    pub async fn recover(
        &mut self,
        store: &mut LocalStore,
    ) -> Result<(), QuorumKvError> {
        store.clear();

        if fs::try_exists(&self.stt_path).await? {
            match Self::load_state_file(&self.stt_path).await {
                Ok(records) => {
                    for record in records {
                        store.put(&record.key, &record.payload, record.ts);
                    }
                    pf_info!(
                        "recovered {} records from state file",
                        store.num_records()
                    );
                    self.log_file = None;
                    remove_if_exists(&self.log_path).await?;
                    self.log_size = 0;
                    fs::rename(&self.stt_path, &self.ckp_path).await?;
                    return Ok(());
                }
                Err(e) => {
                    pf_warn!("discarding unusable state file: {}", e);
                    fs::remove_file(&self.stt_path).await?;
                }
            }
        }

        if fs::try_exists(&self.ckp_path).await? {
            let buf = fs::read(&self.ckp_path).await?;
            let (frames, _) = split_frames(&buf);
            for frame in frames {
                match std::str::from_utf8(frame)
                    .map_err(|e| QuorumKvError(e.to_string()))
                    .and_then(decode_record_line)
                {
                    Ok(record) => {
                        store.put(&record.key, &record.payload, record.ts);
                    }
                    Err(e) => {
                        pf_warn!("checkpoint replay stopped: {}", e);
                        break;
                    }
                }
            }
        }
        let from_ckp = store.num_records();

        let mut replayed = 0;
        if fs::try_exists(&self.log_path).await? {
            let buf = fs::read(&self.log_path).await?;
            let (frames, _) = split_frames(&buf);
            for frame in frames {
                match std::str::from_utf8(frame)
                    .map_err(|e| QuorumKvError(e.to_string()))
                    .and_then(LogRecord::decode)
                {
                    Ok(record) => {
                        record.apply(store);
                        replayed += 1;
                    }
                    Err(e) => {
                        pf_warn!("log replay stopped: {}", e);
                        break;
                    }
                }
            }
        }

        pf_info!(
            "recovered {} records from checkpoint, replayed {} log records",
            from_ckp,
            replayed
        );
        Ok(())
    }

    /// Appends the sentinel to an open log.
    pub async fn close(&mut self) -> Result<(), QuorumKvError> {
        if let Some(mut file) = self.log_file.take() {
            file.write_i32(SENTINEL).await?;
            file.sync_all().await?;
            self.log_size += HDR_LEN;
        }
        Ok(())
    }

    /// Removes all persisted files.
    pub async fn destroy_clear(&mut self) -> Result<(), QuorumKvError> {
        self.log_file = None;
        self.log_size = 0;
        remove_if_exists(&self.log_path).await?;
        remove_if_exists(&self.stt_path).await?;
        remove_if_exists(&self.ckp_path).await?;
        Ok(())
    }
}

// PersistenceManager helper functions
impl PersistenceManager {
    /// Loads every record of a state file; errors unless the file is
    /// sentinel-terminated and every record in it is well-formed.
    async fn load_state_file(
        path: &Path,
    ) -> Result<Vec<Record>, QuorumKvError> {
        let buf = fs::read(path).await?;
        let (frames, clean) = split_frames(&buf);
        if !clean {
            return Err(QuorumKvError::msg("state file not terminated"));
        }
        frames
            .into_iter()
            .map(|frame| {
                let line = std::str::from_utf8(frame)
                    .map_err(|e| QuorumKvError(e.to_string()))?;
                decode_record_line(line)
            })
            .collect()
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), QuorumKvError> {
    if fs::try_exists(path).await? {
        fs::remove_file(path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod persistence_tests {
    use super::*;

    async fn prepare_pmanager(
        prefix: &str,
        max_log_size: usize,
    ) -> Result<PersistenceManager, QuorumKvError> {
        let mut pm = PersistenceManager::new_and_setup(
            prefix,
            max_log_size,
            SyncMode::DataSync,
        )
        .await?;
        pm.destroy_clear().await?;
        Ok(pm)
    }

    async fn reopen_pmanager(
        prefix: &str,
    ) -> Result<PersistenceManager, QuorumKvError> {
        PersistenceManager::new_and_setup(prefix, 1 << 20, SyncMode::Buffered)
            .await
    }

    fn put_rec(key: &str, payload: &[u8], ts: Timestamp) -> LogRecord {
        LogRecord::Put {
            key: key.into(),
            payload: payload.to_vec(),
            ts,
        }
    }

    #[test]
    fn log_record_lines() -> Result<(), QuorumKvError> {
        let rec = put_rec("k", b"hello", 2003);
        assert_eq!(rec.encode(), "put MjAwMw== k aGVsbG8=");
        assert_eq!(LogRecord::decode(&rec.encode())?, rec);
        let del = LogRecord::Del { key: "k".into() };
        assert_eq!(LogRecord::decode(&del.encode())?, del);
        let tomb = put_rec("k", b"", 3003);
        assert_eq!(LogRecord::decode(&tomb.encode())?, tomb);
        assert!(LogRecord::decode("set k v").is_err());
        assert!(LogRecord::decode("del").is_err());
        Ok(())
    }

    #[test]
    fn frame_splitting() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&3i32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        buf.extend_from_slice(&SENTINEL.to_be_bytes());
        assert_eq!(split_frames(&buf), (vec![&b"abc"[..]], true));
        // truncated tail record is dropped
        buf.extend_from_slice(&10i32.to_be_bytes());
        buf.extend_from_slice(b"xy");
        assert_eq!(split_frames(&buf), (vec![&b"abc"[..]], true));
        assert_eq!(split_frames(&[0u8, 0u8]), (vec![], false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn new_invalid() {
        assert!(PersistenceManager::new_and_setup(
            "/tmp/test-quorumkv-pm-0",
            0,
            SyncMode::Buffered
        )
        .await
        .is_err());
        assert!(PersistenceManager::new_and_setup("", 64, SyncMode::Buffered)
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn append_until_full() -> Result<(), QuorumKvError> {
        let rec = put_rec("key", b"value", 1000);
        let rec_len = HDR_LEN + rec.encode().len();
        let mut pm =
            prepare_pmanager("/tmp/test-quorumkv-pm-1", rec_len + 1).await?;
        assert!(!pm.has_data().await?);
        assert!(pm.append(&rec).await?);
        assert_eq!(pm.log_size(), rec_len);
        assert!(pm.has_data().await?);

        // at max_log_size - 1 bytes nothing more fits
        assert!(!pm.append(&rec).await?);
        assert_eq!(pm.log_size(), rec_len);
        let on_disk = fs::metadata("/tmp/test-quorumkv-pm-1.log").await?.len();
        assert_eq!(on_disk as usize, rec_len);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn rotate_twice() -> Result<(), QuorumKvError> {
        let mut pm = prepare_pmanager("/tmp/test-quorumkv-pm-2", 4096).await?;
        let mut store = LocalStore::new(4)?;
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            let ts = 1000 * (i as Timestamp + 1);
            store.put(key, b"v", ts);
            pm.append(&put_rec(key, b"v", ts)).await?;
        }
        pm.snapshot(&store).await?;
        pm.rotate().await?;
        let ckp_once = fs::read("/tmp/test-quorumkv-pm-2.ckp").await?;
        assert!(!fs::try_exists("/tmp/test-quorumkv-pm-2.log").await?);
        assert!(!fs::try_exists("/tmp/test-quorumkv-pm-2.stt").await?);

        pm.rotate().await?;
        assert_eq!(fs::read("/tmp/test-quorumkv-pm-2.ckp").await?, ckp_once);
        assert!(!fs::try_exists("/tmp/test-quorumkv-pm-2.log").await?);
        assert_eq!(pm.log_size(), 0);

        let mut recovered = LocalStore::new(4)?;
        pm.recover(&mut recovered).await?;
        assert_eq!(recovered.size(), 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn crash_then_recover() -> Result<(), QuorumKvError> {
        let prefix = "/tmp/test-quorumkv-pm-3";
        let mut pm = prepare_pmanager(prefix, 1 << 20).await?;
        let mut ref_store = LocalStore::new(5)?;
        let ops = vec![
            put_rec("x", b"1", 1001),
            put_rec("y", b"2", 1001),
            LogRecord::Del { key: "x".into() },
            put_rec("z", b"", 2001),
            put_rec("y", b"3", 2002),
            put_rec("x", b"4", 3001),
        ];
        for op in ops {
            assert!(pm.append(&op).await?);
            op.apply(&mut ref_store);
        }
        drop(pm); // crash: no close, no rotate

        let mut pm = reopen_pmanager(prefix).await?;
        assert!(pm.has_data().await?);
        let mut store = LocalStore::new(5)?;
        pm.recover(&mut store).await?;
        let mut got = store.records();
        let mut expected = ref_store.records();
        got.sort_by(|a, b| a.key.cmp(&b.key));
        expected.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(got, expected);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn close_then_recover() -> Result<(), QuorumKvError> {
        let prefix = "/tmp/test-quorumkv-pm-4";
        let mut pm = prepare_pmanager(prefix, 1 << 20).await?;
        pm.append(&put_rec("a", b"1", 1000)).await?;
        pm.close().await?;
        let rec_len = put_rec("a", b"1", 1000).encode().len();
        assert_eq!(pm.log_size(), 2 * HDR_LEN + rec_len);

        // appends after a clean close are still replayed
        pm.append(&put_rec("b", b"2", 1000)).await?;
        drop(pm);

        let mut pm = reopen_pmanager(prefix).await?;
        let mut store = LocalStore::new(2)?;
        pm.recover(&mut store).await?;
        assert_eq!(store.size(), 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn state_file_preferred() -> Result<(), QuorumKvError> {
        let prefix = "/tmp/test-quorumkv-pm-5";
        let mut pm = prepare_pmanager(prefix, 1 << 20).await?;
        let mut store = LocalStore::new(2)?;
        store.put("a", b"snap", 5000);
        pm.append(&put_rec("a", b"logged", 4000)).await?;
        pm.snapshot(&store).await?;
        drop(pm); // crash between snapshot and rotate

        let mut pm = reopen_pmanager(prefix).await?;
        let mut recovered = LocalStore::new(2)?;
        pm.recover(&mut recovered).await?;
        assert_eq!(
            recovered.get("a"),
            Some(Record::new("a", b"snap".to_vec(), 5000))
        );
        assert!(!fs::try_exists(format!("{}.stt", prefix)).await?);
        assert!(!fs::try_exists(format!("{}.log", prefix)).await?);
        assert!(fs::try_exists(format!("{}.ckp", prefix)).await?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn corrupt_state_file_ignored() -> Result<(), QuorumKvError> {
        let prefix = "/tmp/test-quorumkv-pm-6";
        let mut pm = prepare_pmanager(prefix, 1 << 20).await?;
        let mut store = LocalStore::new(2)?;
        store.put("a", b"ckp", 1000);
        pm.snapshot(&store).await?;
        pm.rotate().await?;
        pm.append(&put_rec("b", b"log", 2000)).await?;
        drop(pm);

        // a half-written state file without sentinel
        let mut junk = Vec::new();
        junk.extend_from_slice(&100i32.to_be_bytes());
        junk.extend_from_slice(b"MTAwMA== a");
        fs::write(format!("{}.stt", prefix), &junk).await?;

        let mut pm = reopen_pmanager(prefix).await?;
        let mut recovered = LocalStore::new(2)?;
        pm.recover(&mut recovered).await?;
        assert_eq!(recovered.size(), 2);
        let payload_of = |key: &str| recovered.get(key).map(|r| r.payload);
        assert_eq!(payload_of("a"), Some(b"ckp".to_vec()));
        assert_eq!(payload_of("b"), Some(b"log".to_vec()));
        assert!(!fs::try_exists(format!("{}.stt", prefix)).await?);
        Ok(())
    }
}
