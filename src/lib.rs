pub mod ray_math;
pub mod index_engine;
pub mod rate_model;
pub mod oracle;
pub mod crypto;
pub mod codec;
pub mod error;
pub mod reserve;
pub mod debt;
pub mod invariant;
pub mod audit;
pub mod store;
pub mod persistence;
pub mod config;
pub mod coordinator;

pub use error::*;
pub use ray_math::{RAY, HALF_RAY, SECONDS_PER_YEAR, U256, U512};

use serde::{Deserialize, Serialize};

/// Opaque 32-byte identifier for a reserve's underlying asset.
pub type AssetId = [u8; 32];

/// Underlying asset base units (satoshis, micro-USDT, ...). Never RAY-scaled.
pub type Amount = u64;

/// Caller identity. Opaque at this layer; the core never interprets it beyond equality.
pub type UserId = String;

pub type PositionId = uuid::Uuid;

pub type IntentId = uuid::Uuid;

/// Unix seconds. Must be monotonic within a process (see `Clock`, oracle.rs).
pub type Timestamp = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Rounding {
    Floor,
    Ceil,
}

/// Upper bound on any reserve's per-second rate, enforced by `InvariantGuard`.
/// Set to `RAY` itself (100% per second) — far above any realistic configured slope,
/// it exists only to catch a misconfigured or corrupted reserve.
pub fn max_rate_per_second() -> U256 {
    *RAY
}
