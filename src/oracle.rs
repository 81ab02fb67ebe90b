//! OracleGateway (C4): fetches, verifies, and TTL-caches signed price quotes.

use crate::codec::Encoder;
use crate::config::OraclePolicy;
use crate::crypto::verify_signature;
use crate::error::{LendError, Result};
use crate::ray_math::U256;
use crate::{AssetId, Timestamp};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// `now() -> Unix seconds`. Must be monotonic within a process (spec §6).
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs()
    }
}

/// A signed price tuple as delivered by the external oracle network (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub asset_id: AssetId,
    /// Quote-asset-per-base-asset price, in the configured numeraire, RAY-scaled.
    pub price: U256,
    pub timestamp: Timestamp,
    pub publisher_id: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Quote {
    /// Canonical bytes the publisher signed over (spec §4.10/§6): fixed-width
    /// asset id, RAY price, and timestamp. The publisher id is part of the
    /// whitelist check, not the signed payload.
    fn signed_payload(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_bytes_lp(&self.asset_id).put_u256(self.price).put_u64(self.timestamp);
        enc.finish()
    }
}

#[derive(Debug)]
pub enum ProviderError {
    Unavailable(String),
}

/// `fetch(asset_id) -> Result<Quote, ProviderError>` (spec §6), the external
/// price-oracle network collaborator. Implementations are expected to be
/// async-suspending on cache miss (spec §5's suspension point (c)).
#[async_trait::async_trait]
pub trait PriceOracle: Send + Sync {
    async fn fetch(&self, asset_id: AssetId) -> std::result::Result<Quote, ProviderError>;
}

struct CachedQuote {
    quote: Quote,
    cached_at: Timestamp,
}

/// Validates and caches quotes from an injected `PriceOracle` provider.
pub struct OracleGateway<P: PriceOracle> {
    provider: P,
    policy: OraclePolicy,
    cache: Mutex<HashMap<AssetId, CachedQuote>>,
}

impl<P: PriceOracle> OracleGateway<P> {
    pub fn new(provider: P, policy: OraclePolicy) -> Self {
        Self {
            provider,
            policy,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the validated RAY-scaled price of `asset_id` as of `now`.
    pub async fn price_of(&self, asset_id: AssetId, now: Timestamp) -> Result<U256> {
        if let Some(price) = self.cached_fresh_price(asset_id, now) {
            return Ok(price);
        }

        let quote = self
            .provider
            .fetch(asset_id)
            .await
            .map_err(|ProviderError::Unavailable(msg)| LendError::OracleUnavailable(msg))?;

        self.validate(&quote, now)?;

        let mut cache = self.cache.lock().expect("oracle cache lock poisoned");
        cache.insert(
            asset_id,
            CachedQuote {
                quote: quote.clone(),
                cached_at: now,
            },
        );

        Ok(quote.price)
    }

    fn cached_fresh_price(&self, asset_id: AssetId, now: Timestamp) -> Option<U256> {
        let cache = self.cache.lock().expect("oracle cache lock poisoned");
        let cached = cache.get(&asset_id)?;
        let age = now.saturating_sub(cached.cached_at);
        if age <= self.policy.cache_ttl_seconds() {
            Some(cached.quote.price)
        } else {
            None
        }
    }

    fn validate(&self, quote: &Quote, now: Timestamp) -> Result<()> {
        let age = now.saturating_sub(quote.timestamp);
        if age > self.policy.max_staleness_seconds {
            return Err(LendError::OracleStale {
                age_seconds: age,
                max_staleness_seconds: self.policy.max_staleness_seconds,
            });
        }

        if !self
            .policy
            .publisher_whitelist
            .iter()
            .any(|pk| pk == &quote.publisher_id)
        {
            return Err(LendError::UnauthorizedPublisher);
        }

        if !verify_signature(&quote.publisher_id, &quote.signed_payload(), &quote.signature)? {
            return Err(LendError::BadSignature);
        }

        if quote.price.is_zero() {
            return Err(LendError::OutOfRange);
        }

        if let Some(bounds) = self.policy.bounds_for(&quote.asset_id) {
            if quote.price < bounds.min_price || quote.price > bounds.max_price {
                return Err(LendError::OutOfRange);
            }
        }

        Ok(())
    }
}
