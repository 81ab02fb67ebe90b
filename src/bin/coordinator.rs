//! `coordinatord`: a thin driver that boots a `Coordinator` against either an
//! in-memory or RocksDB-backed `Store` and replays a scripted demo batch of
//! intents, printing each committed outcome. Grounded on this portfolio's
//! node binary: clap CLI, `env_logger`, colored status lines, `tokio::main`.

use clap::{Arg, Command};
use colored::*;
use lend_core::config::{AssetGenesisConfig, CoordinatorConfig, GenesisConfig, OraclePolicy};
use lend_core::coordinator::{Coordinator, Intent, IntentOutcome};
use lend_core::crypto::KeyPair;
use lend_core::oracle::{Clock, OracleGateway, PriceOracle, ProviderError, Quote, SystemClock};
use lend_core::persistence::RocksStore;
use lend_core::ray_math::{RAY, U256};
use lend_core::store::{MemStore, Store};
use lend_core::{AssetId, IntentId};
use std::collections::HashMap;
use std::sync::Arc;

const BTC: AssetId = [1u8; 32];
const USDT: AssetId = [2u8; 32];

fn asset_config(asset_id: AssetId, symbol: &str, ltv: u64, threshold: u64, bonus: u64) -> AssetGenesisConfig {
    let ray = *RAY;
    AssetGenesisConfig {
        asset_id,
        symbol: symbol.to_string(),
        reserve_factor: ray * U256::from(10u64) / U256::from(100u64),
        ltv: ray * U256::from(ltv) / U256::from(100u64),
        liquidation_threshold: ray * U256::from(threshold) / U256::from(100u64),
        liquidation_bonus: ray * U256::from(bonus) / U256::from(100u64),
        base_rate: U256::zero(),
        slope_1: ray / U256::from(20u64),
        slope_2: ray,
        optimal_utilization: ray * U256::from(80u64) / U256::from(100u64),
    }
}

/// Stands in for the external oracle network in this demo: signs prices out
/// of a fixed in-process table with the node's own keypair, which the
/// genesis config below whitelists as the sole publisher.
struct DemoOracle {
    keypair: KeyPair,
    prices: HashMap<AssetId, U256>,
}

#[async_trait::async_trait]
impl PriceOracle for DemoOracle {
    async fn fetch(&self, asset_id: AssetId) -> std::result::Result<Quote, ProviderError> {
        let price = *self
            .prices
            .get(&asset_id)
            .ok_or_else(|| ProviderError::Unavailable(format!("no demo price for asset {:?}", asset_id)))?;

        let mut quote = Quote {
            asset_id,
            price,
            timestamp: SystemClock.now(),
            publisher_id: self.keypair.public_key.clone(),
            signature: Vec::new(),
        };
        let mut enc = lend_core::codec::Encoder::new();
        enc.put_bytes_lp(&quote.asset_id).put_u256(quote.price).put_u64(quote.timestamp);
        quote.signature = self.keypair.sign(&enc.finish()).map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        Ok(quote)
    }
}

fn demo_genesis(publisher: &KeyPair) -> GenesisConfig {
    GenesisConfig {
        numeraire: "USD".to_string(),
        assets: vec![asset_config(BTC, "BTC", 75, 80, 5), asset_config(USDT, "USDT", 75, 80, 5)],
        oracle: OraclePolicy {
            max_staleness_seconds: 300,
            publisher_whitelist: vec![publisher.public_key.clone()],
            asset_bounds: Vec::new(),
        },
        coordinator: CoordinatorConfig::default(),
    }
}

fn demo_prices() -> HashMap<AssetId, U256> {
    let mut prices = HashMap::new();
    prices.insert(BTC, U256::from(60_000u64) * *RAY / U256::from(100_000_000u64));
    prices.insert(USDT, *RAY / U256::from(1_000_000u64));
    prices
}

async fn run_demo_batch<S: Store + 'static>(coordinator: Arc<Coordinator<S, DemoOracle>>) {
    let lp = Intent::Supply {
        intent_id: IntentId::new_v4(),
        user: "liquidity_provider".to_string(),
        asset_id: USDT,
        amount: 1_000_000_000_000,
        deadline: None,
    };
    print_outcome("Supply(lp, 1,000,000 USDT)", coordinator.process(lp).await);

    let borrow = Intent::Borrow {
        intent_id: IntentId::new_v4(),
        user: "alice".to_string(),
        collateral_asset_id: BTC,
        collateral_amount: 200_000_000,
        borrow_asset_id: USDT,
        borrow_amount: 90_000 * 1_000_000,
        deadline: None,
    };
    let borrow_outcome = coordinator.process(borrow).await;
    print_outcome("Borrow(alice, 2 BTC -> 90,000 USDT)", borrow_outcome.clone());

    if let Ok(IntentOutcome::Borrowed { position_id, .. }) = borrow_outcome {
        let repay = Intent::Repay {
            intent_id: IntentId::new_v4(),
            user: "alice".to_string(),
            position_id,
            amount: Some(45_000 * 1_000_000),
            deadline: None,
        };
        print_outcome("Repay(alice, 45,000 USDT)", coordinator.process(repay).await);
    }

    match coordinator.list_liquidatable().await {
        Ok(positions) => println!("{} {:?}", "Liquidatable positions:".cyan(), positions),
        Err(e) => println!("{}", format!("list_liquidatable failed: {}", e).red()),
    }
}

fn print_outcome(label: &str, outcome: lend_core::Result<IntentOutcome>) {
    match outcome {
        Ok(outcome) => println!("{} {} {:?}", label.bold(), "->".green(), outcome),
        Err(e) => println!("{} {} {}", label.bold(), "->".red(), e.to_string().red()),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("coordinatord")
        .version("0.1.0")
        .about("Demo driver for the lending protocol coordinator core")
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("RocksDB data directory; omit to run against an in-memory store"),
        )
        .get_matches();

    let publisher = KeyPair::new().expect("failed to generate demo oracle keypair");
    let genesis = Arc::new(demo_genesis(&publisher));

    let oracle = Arc::new(OracleGateway::new(
        DemoOracle { keypair: publisher, prices: demo_prices() },
        genesis.oracle.clone(),
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    println!("{}", "Starting coordinatord...".bold().green());

    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        std::fs::create_dir_all(data_dir).expect("failed to create data directory");
        println!("Store: {} ({})", "RocksDB".cyan(), data_dir.cyan());
        let store = Arc::new(RocksStore::open(data_dir).expect("failed to open RocksDB store"));
        let coordinator = Arc::new(Coordinator::new(store, oracle, clock, genesis));
        coordinator.bootstrap_reserves().expect("failed to bootstrap genesis reserves");
        run_demo_batch(coordinator).await;
    } else {
        println!("Store: {}", "in-memory".cyan());
        let store = Arc::new(MemStore::new());
        let coordinator = Arc::new(Coordinator::new(store, oracle, clock, genesis));
        coordinator.bootstrap_reserves().expect("failed to bootstrap genesis reserves");
        run_demo_batch(coordinator).await;
    }

    println!("{}", "coordinatord finished.".green());
}
