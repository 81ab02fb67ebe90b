//! RocksDB-backed `Store` (C12): an `OptimisticTransactionDB` with one column
//! family per entity class, mirroring the column-family-per-entity-class
//! layout this codebase's teacher used for blocks/transactions/chain_state.

use crate::error::{LendError, Result};
use crate::store::{Store, StoreTx};
use rocksdb::{
    ColumnFamilyDescriptor, Direction, IteratorMode, OptimisticTransactionDB,
    OptimisticTransactionOptions, Options, WriteOptions,
};
use std::path::Path;
use std::sync::Arc;

const RESERVES_CF: &str = "reserves";
const SUPPLY_CF: &str = "supply";
const DEBT_CF: &str = "debt";
const AUDIT_CF: &str = "audit";
const INTENT_CF: &str = "intent";

const COLUMN_FAMILIES: [&str; 5] = [RESERVES_CF, SUPPLY_CF, DEBT_CF, AUDIT_CF, INTENT_CF];

/// Routes a `codec.rs` key (`"reserve/..."`, `"supply/..."`, ...) to its
/// column family by the same prefix the key builders already embed.
fn cf_for_key(key: &[u8]) -> &'static str {
    if key.starts_with(b"reserve/") {
        RESERVES_CF
    } else if key.starts_with(b"supply/") {
        SUPPLY_CF
    } else if key.starts_with(b"debt/") {
        DEBT_CF
    } else if key.starts_with(b"audit/") {
        AUDIT_CF
    } else if key.starts_with(b"intent/") {
        INTENT_CF
    } else {
        RESERVES_CF
    }
}

pub struct RocksStore {
    db: OptimisticTransactionDB,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = OptimisticTransactionDB::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| LendError::Store(e.to_string()))?;

        Ok(Self { db })
    }

    fn cf_handle(&self, key: &[u8]) -> Result<Arc<rocksdb::BoundColumnFamily>> {
        let name = cf_for_key(key);
        self.db
            .cf_handle(name)
            .ok_or_else(|| LendError::Store(format!("column family '{}' not found", name)))
    }
}

impl Store for RocksStore {
    fn begin(&self) -> Result<Box<dyn StoreTx + '_>> {
        let write_opts = WriteOptions::default();
        let tx_opts = OptimisticTransactionOptions::default();
        let tx = self.db.transaction_opt(&write_opts, &tx_opts);
        Ok(Box::new(RocksStoreTx {
            store: self,
            tx: Some(tx),
        }))
    }

    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf_handle(prefix)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut matches = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| LendError::Store(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            matches.push((key.to_vec(), value.to_vec()));
            if matches.len() >= limit {
                break;
            }
        }
        Ok(matches)
    }
}

struct RocksStoreTx<'a> {
    store: &'a RocksStore,
    /// `None` after `commit`/`abort` consumes the underlying transaction; the
    /// trait's `&self`/`&mut self` methods can't move out of `self` so we park
    /// the handle behind an `Option` instead.
    tx: Option<rocksdb::Transaction<'a, OptimisticTransactionDB>>,
}

impl<'a> StoreTx for RocksStoreTx<'a> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.store.cf_handle(key)?;
        let tx = self.tx.as_ref().expect("transaction used after commit/abort");
        tx.get_cf(&cf, key)
            .map_err(|e| LendError::Store(e.to_string()))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.store.cf_handle(key)?;
        let tx = self.tx.as_ref().expect("transaction used after commit/abort");
        tx.put_cf(&cf, key, value)
            .map_err(|e| LendError::Store(e.to_string()))
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let cf = self.store.cf_handle(key)?;
        let tx = self.tx.as_ref().expect("transaction used after commit/abort");
        tx.delete_cf(&cf, key)
            .map_err(|e| LendError::Store(e.to_string()))
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let tx = self.tx.take().expect("transaction used after commit/abort");
        tx.commit().map_err(|e| {
            let msg = e.to_string();
            if msg.contains("Busy") || msg.contains("TryAgain") || msg.contains("busy") {
                LendError::Conflict
            } else {
                LendError::Store(msg)
            }
        })
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        let tx = self.tx.take().expect("transaction used after commit/abort");
        tx.rollback().map_err(|e| LendError::Store(e.to_string()))
    }

    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.store.cf_handle(prefix)?;
        let tx = self.tx.as_ref().expect("transaction used after commit/abort");
        let iter = tx.iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut matches = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| LendError::Store(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            matches.push((key.to_vec(), value.to_vec()));
            if matches.len() >= limit {
                break;
            }
        }
        Ok(matches)
    }
}
