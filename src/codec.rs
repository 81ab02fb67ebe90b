//! Canonical deterministic binary encoding for Store keys/values and for the
//! byte strings hashed into `AuditLog` digests.
//!
//! Fixed-width big-endian integers; length-prefixed byte strings and UTF-8
//! strings (u32 BE length prefix). No floating point anywhere in this core
//! (spec §9) — formatting to decimals is strictly an interface-boundary concern.

use crate::error::{LendError, Result};
use crate::ray_math::U256;
use crate::{AssetId, PositionId};

/// A small append-only byte buffer builder, mirroring the key-formatting
/// helpers in the persistence layer (`persistence.rs::block_key`) but generalized
/// to arbitrary canonical records instead of one fixed schema.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u256(&mut self, v: U256) -> &mut Self {
        let mut bytes = [0u8; 32];
        v.to_big_endian(&mut bytes);
        self.buf.extend_from_slice(&bytes);
        self
    }

    pub fn put_bytes_lp(&mut self, v: &[u8]) -> &mut Self {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn put_str_lp(&mut self, v: &str) -> &mut Self {
        self.put_bytes_lp(v.as_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(LendError::Codec("unexpected end of buffer".to_string()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn get_u256(&mut self) -> Result<U256> {
        let bytes = self.take(32)?;
        Ok(U256::from_big_endian(bytes))
    }

    pub fn get_bytes_lp(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_str_lp(&mut self) -> Result<String> {
        let bytes = self.get_bytes_lp()?;
        String::from_utf8(bytes).map_err(|e| LendError::Codec(e.to_string()))
    }
}

/// Store key for a reserve record: `"reserve/" + asset_id`.
pub fn reserve_key(asset_id: &AssetId) -> Vec<u8> {
    let mut key = b"reserve/".to_vec();
    key.extend_from_slice(asset_id);
    key
}

/// Store key for a supply position: `"supply/" + position_id`.
pub fn supply_key(position_id: &PositionId) -> Vec<u8> {
    let mut key = b"supply/".to_vec();
    key.extend_from_slice(position_id.as_bytes());
    key
}

/// Store key for a debt position: `"debt/" + position_id`.
pub fn debt_key(position_id: &PositionId) -> Vec<u8> {
    let mut key = b"debt/".to_vec();
    key.extend_from_slice(position_id.as_bytes());
    key
}

/// Store key for an audit log entry: `"audit/" + seq`, big-endian so a
/// range scan over the column family returns entries in commit order.
pub fn audit_key(seq: u64) -> Vec<u8> {
    let mut key = b"audit/".to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Store key for the idempotency-dedup record of one intent.
pub fn intent_key(intent_id: &crate::IntentId) -> Vec<u8> {
    let mut key = b"intent/".to_vec();
    key.extend_from_slice(intent_id.as_bytes());
    key
}
