//! Local job cache: a bounded, newest-first list of job records kept under a
//! single storage key.
//!
//! Every operation degrades instead of failing. Unreadable or corrupt storage
//! reads as an empty list; write failures are logged and dropped.

use crate::record::JobRecord;
use crate::store::KeyValueStore;
use tracing::{debug, warn};

pub const DEFAULT_KEY: &str = "pp.jobs";
pub const DEFAULT_CAPACITY: usize = 50;

pub struct LocalJobCache<S: KeyValueStore> {
    store: S,
    key: String,
    capacity: usize,
}

impl<S: KeyValueStore> LocalJobCache<S> {
    pub fn new(store: S) -> Self {
        Self::with_capacity(store, DEFAULT_KEY, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(store: S, key: impl Into<String>, capacity: usize) -> Self {
        Self {
            store,
            key: key.into(),
            capacity: capacity.max(1),
        }
    }

    /// All retained records, newest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut records = self.read();
        sort_newest_first(&mut records);
        records
    }

    /// Insert or replace by id, then keep only the newest `capacity` records.
    pub fn save(&self, record: JobRecord) {
        let mut records = self.read();
        let before = records.len();
        records.retain(|r| r.id != record.id);
        if records.len() != before {
            debug!(id = %record.id, "replacing cached job");
        }
        records.insert(0, record);
        self.write(records);
    }

    /// Insert or replace several records in one write. Records not in `incoming` stay.
    pub fn save_all(&self, incoming: Vec<JobRecord>) {
        if incoming.is_empty() {
            return;
        }
        let mut records = self.read();
        for rec in incoming {
            records.retain(|r| r.id != rec.id);
            records.insert(0, rec);
        }
        self.write(records);
    }

    pub fn remove(&self, id: &str) {
        let mut records = self.read();
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            debug!(id, "remove: job not cached");
            return;
        }
        self.write(records);
    }

    /// Drops the storage key, corrupt contents included. A missing key reads as empty.
    pub fn clear(&self) {
        if let Err(err) = self.store.remove(&self.key) {
            warn!("job cache clear failed: {err:#}");
        }
    }

    fn read(&self) -> Vec<JobRecord> {
        let raw = match self.store.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!("job cache unavailable: {err:#}");
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<JobRecord>>(&raw) {
            Ok(records) => records,
            Err(err) => {
                warn!("job cache is corrupt, treating as empty: {err}");
                Vec::new()
            }
        }
    }

    fn write(&self, mut records: Vec<JobRecord>) {
        sort_newest_first(&mut records);
        records.truncate(self.capacity);
        let raw = match serde_json::to_string(&records) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("job cache encode failed: {err}");
                return;
            }
        };
        if let Err(err) = self.store.set(&self.key, &raw) {
            warn!("job cache write failed: {err:#}");
        }
    }
}

fn sort_newest_first(records: &mut [JobRecord]) {
    // Stable, so equal timestamps keep insertion order.
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}
