//! AuditLog (C9): append-only ordered transition log, enabling external
//! auditors to replay and verify any transition independently (spec §4.9).

use crate::codec::{audit_key, Encoder};
use crate::crypto::sha256;
use crate::error::Result;
use crate::store::{Store, StoreTx};
use crate::{IntentId, Timestamp};
use serde::{Deserialize, Serialize};

/// One committed transition. `before_digest`/`after_digest` are SHA-256 hashes
/// over the canonical encoding (`codec.rs`) of every record the transition
/// touched, not the records themselves — the log stays small and never leaks
/// raw state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: Timestamp,
    pub actor: String,
    pub intent_id: IntentId,
    pub operation: String,
    pub before_digest: Vec<u8>,
    pub after_digest: Vec<u8>,
}

impl AuditEntry {
    fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_u64(self.seq)
            .put_u64(self.timestamp)
            .put_str_lp(&self.actor)
            .put_bytes_lp(self.intent_id.as_bytes())
            .put_str_lp(&self.operation)
            .put_bytes_lp(&self.before_digest)
            .put_bytes_lp(&self.after_digest);
        enc.finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut dec = crate::codec::Decoder::new(bytes);
        let seq = dec.get_u64()?;
        let timestamp = dec.get_u64()?;
        let actor = dec.get_str_lp()?;
        let intent_id_bytes = dec.get_bytes_lp()?;
        let intent_id = uuid::Uuid::from_slice(&intent_id_bytes)
            .map_err(|e| crate::error::LendError::Codec(e.to_string()))?;
        let operation = dec.get_str_lp()?;
        let before_digest = dec.get_bytes_lp()?;
        let after_digest = dec.get_bytes_lp()?;
        Ok(Self {
            seq,
            timestamp,
            actor,
            intent_id,
            operation,
            before_digest,
            after_digest,
        })
    }
}

/// Digests an arbitrary set of canonically-encoded records into the single
/// hash recorded as `before_digest`/`after_digest`. Callers concatenate the
/// length-prefixed encoding of every record the transition reads/writes.
pub fn digest_records(encoded_records: &[Vec<u8>]) -> Vec<u8> {
    let mut enc = Encoder::new();
    for record in encoded_records {
        enc.put_bytes_lp(record);
    }
    sha256(&enc.finish())
}

/// Append-only log backed by a `Store` transaction. The sequence counter is
/// itself persisted so restarts resume numbering correctly.
pub struct AuditLog;

const SEQ_COUNTER_KEY: &[u8] = b"audit/__seq_counter";

impl AuditLog {
    /// Appends `entry` (with `seq` assigned internally) within `tx` and returns
    /// the assigned sequence number. Does not commit `tx`; the caller commits
    /// once the rest of the transition's writes are staged (spec §4.7 step 5:
    /// "commit the Store transaction ... append an entry to AuditLog" happen
    /// together, under the same transaction).
    pub fn append(
        tx: &mut dyn StoreTx,
        timestamp: Timestamp,
        actor: String,
        intent_id: IntentId,
        operation: String,
        before_digest: Vec<u8>,
        after_digest: Vec<u8>,
    ) -> Result<u64> {
        let seq = Self::next_seq(tx)?;
        let entry = AuditEntry {
            seq,
            timestamp,
            actor,
            intent_id,
            operation,
            before_digest,
            after_digest,
        };
        tx.put(&audit_key(seq), &entry.encode())?;
        tx.put(SEQ_COUNTER_KEY, &(seq + 1).to_be_bytes())?;
        Ok(seq)
    }

    fn next_seq(tx: &mut dyn StoreTx) -> Result<u64> {
        match tx.get(SEQ_COUNTER_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| crate::error::LendError::Codec("corrupt audit seq counter".to_string()))?;
                Ok(u64::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    /// Reads back entries in commit order, for replay/verification tooling.
    pub fn scan(store: &dyn Store, from_seq: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        let prefix = b"audit/".to_vec();
        let raw_entries = store.scan_prefix(&prefix, limit + 1)?;
        let mut entries = Vec::new();
        for (key, value) in raw_entries {
            if key == SEQ_COUNTER_KEY {
                continue;
            }
            let entry = AuditEntry::decode(&value)?;
            if entry.seq >= from_seq {
                entries.push(entry);
            }
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }
}
