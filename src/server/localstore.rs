//! Local volatile store of a table server: a hashed table of bucket lists.

use crate::message::Timestamp;
use crate::utils::QuorumKvError;

/// One stored record. An empty payload marks a deleted key (tombstone),
/// which still carries its timestamp for ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub payload: Vec<u8>,
    pub ts: Timestamp,
}

impl Record {
    pub fn new(
        key: impl Into<String>,
        payload: Vec<u8>,
        ts: Timestamp,
    ) -> Self {
        Record {
            key: key.into(),
            payload,
            ts,
        }
    }

    /// Returns false for tombstones.
    pub fn is_live(&self) -> bool {
        !self.payload.is_empty()
    }
}

/// Hashed table of `n_lists` bucket lists. Each key hashes to exactly one
/// bucket; a bucket holds records in insertion order.
#[derive(Debug)]
pub struct LocalStore {
    /// Bucket lists.
    lists: Vec<Vec<Record>>,

    /// Number of records stored, tombstones included.
    num_records: usize,

    /// Number of successful mutations since creation.
    num_updates: u64,
}

impl LocalStore {
    /// Creates an empty store with `n_lists` buckets.
    pub fn new(n_lists: usize) -> Result<Self, QuorumKvError> {
        if n_lists == 0 {
            return logged_err!("invalid n_lists {}", n_lists);
        }
        Ok(LocalStore {
            lists: vec![Vec::new(); n_lists],
            num_records: 0,
            num_updates: 0,
        })
    }

    /// Polynomial string hash with base 31, reduced into bucket range.
    fn bucket_of(&self, key: &str) -> usize {
        let hash = key
            .bytes()
            .fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64));
        (hash % self.lists.len() as u64) as usize
    }

    /// Inserts or replaces the record for `key`. An existing record with a
    /// strictly greater timestamp is never overwritten; in that case the put
    /// is ignored and `false` is returned.
    pub fn put(&mut self, key: &str, payload: &[u8], ts: Timestamp) -> bool {
        let bucket = self.bucket_of(key);
        let list = &mut self.lists[bucket];
        match list.iter_mut().find(|r| r.key == key) {
            Some(record) => {
                if record.ts > ts {
                    return false;
                }
                record.payload = payload.to_vec();
                record.ts = ts;
            }
            None => {
                list.push(Record::new(key, payload.to_vec(), ts));
                self.num_records += 1;
            }
        }
        self.num_updates += 1;
        true
    }

    /// Returns a copy of the record for `key`, tombstones included.
    pub fn get(&self, key: &str) -> Option<Record> {
        self.lists[self.bucket_of(key)]
            .iter()
            .find(|r| r.key == key)
            .cloned()
    }

    /// Removes the record for `key` entirely. Returns `false` if absent.
    pub fn del(&mut self, key: &str) -> bool {
        let bucket = self.bucket_of(key);
        let list = &mut self.lists[bucket];
        match list.iter().position(|r| r.key == key) {
            Some(idx) => {
                list.remove(idx);
                self.num_records -= 1;
                self.num_updates += 1;
                true
            }
            None => false,
        }
    }

    /// Number of live records.
    pub fn size(&self) -> usize {
        self.lists
            .iter()
            .map(|list| list.iter().filter(|r| r.is_live()).count())
            .sum()
    }

    /// Keys of all live records.
    pub fn keys(&self) -> Vec<String> {
        self.lists
            .iter()
            .flatten()
            .filter(|r| r.is_live())
            .map(|r| r.key.clone())
            .collect()
    }

    /// Timestamp of `key`, or 0 if never written here.
    pub fn get_timestamp(&self, key: &str) -> Timestamp {
        self.lists[self.bucket_of(key)]
            .iter()
            .find(|r| r.key == key)
            .map_or(0, |r| r.ts)
    }

    /// Copies of every record, tombstones included.
    pub fn records(&self) -> Vec<Record> {
        self.lists.iter().flatten().cloned().collect()
    }

    /// Number of records held, tombstones included.
    pub fn num_records(&self) -> usize {
        self.num_records
    }

    /// Number of successful mutations applied so far.
    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    /// Drops every record.
    pub fn clear(&mut self) {
        for list in self.lists.iter_mut() {
            list.clear();
        }
        self.num_records = 0;
    }
}
