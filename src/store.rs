//! Store (C12): the transactional KV abstraction every engine and AuditLog
//! writes through (spec §4.12/§6). This module holds the trait and the
//! in-memory reference implementation; `persistence.rs` holds the RocksDB one.

use crate::error::{LendError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// One Store transaction: buffered writes become visible only on `commit`.
/// `commit`/`abort` consume `self` so a transaction can't be reused after
/// either outcome.
pub trait StoreTx {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&mut self, key: &[u8]) -> Result<()>;
    fn commit(self: Box<Self>) -> Result<()>;
    fn abort(self: Box<Self>) -> Result<()>;

    /// Lexicographically ordered scan over keys starting with `prefix`,
    /// reflecting this transaction's own pending writes on top of the
    /// committed snapshot it began from. Used by `InvariantGuard`'s
    /// position-consistency checks, which must see the mutation this
    /// transaction is about to commit (spec §4.8).
    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// A transactional key/value backend. Implementations are shared across
/// worker tasks (`Send + Sync`); internal synchronization is their concern.
pub trait Store: Send + Sync {
    fn begin(&self) -> Result<Box<dyn StoreTx + '_>>;

    /// Lexicographically ordered scan over keys starting with `prefix`, used
    /// by `AuditLog::scan` and diagnostics. Not itself transactional.
    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-memory reference `Store`: versioned key/value snapshots so a
/// transaction's commit can detect the same write/write conflicts a real
/// optimistic-transaction backend would (spec §4.12).
pub struct MemStore {
    data: Mutex<HashMap<Vec<u8>, (u64, Vec<u8>)>>,
    version_counter: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            version_counter: AtomicU64::new(0),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemStore {
    fn begin(&self) -> Result<Box<dyn StoreTx + '_>> {
        let snapshot_version = self.version_counter.load(Ordering::SeqCst);
        Ok(Box::new(MemStoreTx {
            store: self,
            snapshot_version,
            reads: HashSet::new(),
            writes: HashMap::new(),
        }))
    }

    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.lock().expect("MemStore data lock poisoned");
        let mut matches: Vec<(Vec<u8>, Vec<u8>)> = data
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (_, value))| (key.clone(), value.clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        matches.truncate(limit);
        Ok(matches)
    }
}

struct MemStoreTx<'a> {
    store: &'a MemStore,
    snapshot_version: u64,
    /// Keys read through this transaction; reserved for future read-set
    /// validation (write/write detection below is sufficient for this core's
    /// single-writer-per-reserve-lock model).
    reads: HashSet<Vec<u8>>,
    writes: HashMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> StoreTx for MemStoreTx<'a> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        let data = self.store.data.lock().expect("MemStore data lock poisoned");
        Ok(data.get(key).map(|(_, value)| value.clone()))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let mut data = self.store.data.lock().expect("MemStore data lock poisoned");

        for key in self.writes.keys() {
            if let Some((version, _)) = data.get(key) {
                if *version > self.snapshot_version {
                    return Err(LendError::Conflict);
                }
            }
        }

        let new_version = self.store.version_counter.fetch_add(1, Ordering::SeqCst) + 1;
        for (key, value) in self.writes {
            match value {
                Some(bytes) => {
                    data.insert(key, (new_version, bytes));
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn abort(self: Box<Self>) -> Result<()> {
        let _ = self.reads;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: HashMap<Vec<u8>, Vec<u8>> = {
            let data = self.store.data.lock().expect("MemStore data lock poisoned");
            data.iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, (_, value))| (key.clone(), value.clone()))
                .collect()
        };

        for (key, pending) in &self.writes {
            if !key.starts_with(prefix) {
                continue;
            }
            match pending {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        let mut matches: Vec<(Vec<u8>, Vec<u8>)> = merged.into_iter().collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        matches.truncate(limit);
        Ok(matches)
    }
}
