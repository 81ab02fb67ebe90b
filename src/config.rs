//! Typed, environment-layered configuration: genesis reserve parameters,
//! oracle policy, and coordinator tuning.
//!
//! Loaded once at process start and otherwise immutable (spec §1: "parameters
//! are static per reserve for this core"). Layering follows the
//! defaults -> file -> environment pattern used by the `config` crate,
//! borrowed from the wider portfolio's web-server project since the teacher
//! this crate started from carried no configuration crate of its own.

use crate::error::{LendError, Result};
use crate::ray_math::U256;
use crate::reserve::ReserveParams;
use crate::AssetId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetGenesisConfig {
    pub asset_id: AssetId,
    pub symbol: String,
    #[serde(with = "u256_decimal")]
    pub reserve_factor: U256,
    #[serde(with = "u256_decimal")]
    pub ltv: U256,
    #[serde(with = "u256_decimal")]
    pub liquidation_threshold: U256,
    #[serde(with = "u256_decimal")]
    pub liquidation_bonus: U256,
    #[serde(with = "u256_decimal")]
    pub base_rate: U256,
    #[serde(with = "u256_decimal")]
    pub slope_1: U256,
    #[serde(with = "u256_decimal")]
    pub slope_2: U256,
    #[serde(with = "u256_decimal")]
    pub optimal_utilization: U256,
}

impl AssetGenesisConfig {
    pub fn reserve_params(&self) -> ReserveParams {
        ReserveParams {
            reserve_factor: self.reserve_factor,
            ltv: self.ltv,
            liquidation_threshold: self.liquidation_threshold,
            liquidation_bonus: self.liquidation_bonus,
            base_rate: self.base_rate,
            slope_1: self.slope_1,
            slope_2: self.slope_2,
            optimal_utilization: self.optimal_utilization,
        }
    }
}

/// Per-asset sanity bounds the OracleGateway rejects quotes outside of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetOracleBounds {
    pub asset_id: AssetId,
    #[serde(with = "u256_decimal")]
    pub min_price: U256,
    #[serde(with = "u256_decimal")]
    pub max_price: U256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OraclePolicy {
    pub max_staleness_seconds: u64,
    pub publisher_whitelist: Vec<Vec<u8>>,
    pub asset_bounds: Vec<AssetOracleBounds>,
}

impl OraclePolicy {
    pub fn bounds_for(&self, asset_id: &AssetId) -> Option<&AssetOracleBounds> {
        self.asset_bounds.iter().find(|b| &b.asset_id == asset_id)
    }

    pub fn cache_ttl_seconds(&self) -> u64 {
        self.max_staleness_seconds / 2
    }
}

impl Default for OraclePolicy {
    fn default() -> Self {
        Self {
            max_staleness_seconds: 300,
            publisher_whitelist: Vec::new(),
            asset_bounds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub worker_count: usize,
    pub max_retries: u32,
    pub dedup_window_size: usize,
    pub max_in_flight_per_reserve: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            max_retries: 5,
            dedup_window_size: 10_000,
            max_in_flight_per_reserve: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// The single common unit of account every cross-asset value comparison is
    /// computed in (spec §9 open question: a formal numeraire).
    pub numeraire: String,
    pub assets: Vec<AssetGenesisConfig>,
    pub oracle: OraclePolicy,
    pub coordinator: CoordinatorConfig,
}

impl GenesisConfig {
    pub fn asset(&self, asset_id: &AssetId) -> Result<&AssetGenesisConfig> {
        self.assets
            .iter()
            .find(|a| &a.asset_id == asset_id)
            .ok_or_else(|| LendError::NotFound(format!("no genesis config for asset {:?}", asset_id)))
    }

    /// Loads configuration layered: built-in defaults -> optional TOML/JSON file
    /// (`LEND_CONFIG_FILE`, if set) -> environment overrides prefixed `LEND_`.
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            .set_default("numeraire", "USD")
            .map_err(|e| LendError::Config(e.to_string()))?;

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(config::Environment::with_prefix("LEND").separator("__"));

        let settings = builder.build().map_err(|e| LendError::Config(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| LendError::Config(e.to_string()))
    }
}

/// Serializes a `U256` as a decimal string so genesis files stay human-readable
/// (RAY values don't fit in a JSON/TOML number without precision loss).
mod u256_decimal {
    use crate::ray_math::U256;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &U256, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        U256::from_dec_str(&s).map_err(serde::de::Error::custom)
    }
}
