//! Persistent table: a local store whose every mutation is also logged by a
//! persistence manager.

use crate::message::Timestamp;
use crate::server::persistence::LogRecord;
use crate::server::{LocalStore, PersistenceManager, Record};
use crate::utils::QuorumKvError;

/// Local store bound to its persistence manager.
pub struct PersistentTable {
    /// Volatile records.
    store: LocalStore,

    /// Durable log and checkpoints of `store`.
    pmanager: PersistenceManager,
}

impl PersistentTable {
    /// Opens the table. If anything was persisted before, recovers it into
    /// `store` and immediately checkpoints so that the log starts fresh.
    pub async fn open(
        mut store: LocalStore,
        mut pmanager: PersistenceManager,
    ) -> Result<Self, QuorumKvError> {
        if pmanager.has_data().await? {
            pmanager.recover(&mut store).await?;
            pmanager.snapshot(&store).await?;
            pmanager.rotate().await?;
            pf_info!("opened table with {} live records", store.size());
        }
        Ok(PersistentTable { store, pmanager })
    }

    /// Logs a record; on a full log, checkpoints the current store, rotates,
    /// and retries exactly once.
    async fn log(&mut self, record: LogRecord) -> Result<(), QuorumKvError> {
        if self.pmanager.append(&record).await? {
            return Ok(());
        }
        self.pmanager.snapshot(&self.store).await?;
        self.pmanager.rotate().await?;
        if self.pmanager.append(&record).await? {
            Ok(())
        } else {
            logged_err!("record does not fit in an empty log")
        }
    }

    /// Stores `payload` under `key` with timestamp `ts`. Returns `Ok(false)`
    /// if the stored record is newer, in which case nothing changes.
    ///
    /// The store is updated before logging. If the record cannot be logged
    /// even into an empty log, the error is returned but the record stays in
    /// the store and in the checkpoint just taken.
    pub async fn put(
        &mut self,
        key: &str,
        payload: &[u8],
        ts: Timestamp,
    ) -> Result<bool, QuorumKvError> {
        if !self.store.put(key, payload, ts) {
            pf_debug!(
                "ignored stale put of '{}' ts {} < {}",
                key,
                ts,
                self.store.get_timestamp(key)
            );
            return Ok(false);
        }
        self.log(LogRecord::Put {
            key: key.into(),
            payload: payload.to_vec(),
            ts,
        })
        .await?;
        Ok(true)
    }

    /// Removes `key` entirely. Returns `Ok(false)` if absent.
    pub async fn del(&mut self, key: &str) -> Result<bool, QuorumKvError> {
        if !self.store.del(key) {
            return Ok(false);
        }
        self.log(LogRecord::Del { key: key.into() }).await?;
        Ok(true)
    }

    pub fn get(&self, key: &str) -> Option<Record> {
        self.store.get(key)
    }

    pub fn size(&self) -> usize {
        self.store.size()
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    pub fn get_timestamp(&self, key: &str) -> Timestamp {
        self.store.get_timestamp(key)
    }

    /// Marks the log as cleanly closed.
    pub async fn close(&mut self) -> Result<(), QuorumKvError> {
        pf_info!(
            "closing table: {} records, {} updates applied",
            self.store.num_records(),
            self.store.num_updates()
        );
        self.pmanager.close().await
    }

    /// Drops the table and removes all its persisted files.
    pub async fn destroy(mut self) -> Result<(), QuorumKvError> {
        self.pmanager.destroy_clear().await
    }
}
