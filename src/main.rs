// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod collaborators;
mod config;
mod gas_oracle;
mod mempool;
mod nonce;
mod rpc;
mod safety;
mod strategy;
mod tx_builder;
mod worker;

use collaborators::{LoggingTxStore, NullPriceOracle, TelegramNotifier};
use config::{Config, ParsedConfig};
use gas_oracle::GasOracle;
use mempool::MempoolScanner;
use nonce::NonceRegistry;
use rpc::RpcLoadBalancer;
use safety::{SafetyEngine, SafetyParams};
use strategy::{StrategySelector, StrategySelectorParams};
use tx_builder::TxBuilder;
use worker::ChainWorker;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv::dotenv().ok();

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("═══════════════════════════════════════════");
    info!("    MEV EXECUTION ENGINE");
    info!("═══════════════════════════════════════════");

    let config = Config::load_or_default();
    let parsed = ParsedConfig::from_config(&config)?;

    info!("Configuration loaded (chain id {})", parsed.chain_id);
    info!("  Min profit: {} ETH", ethers::utils::format_ether(parsed.min_profit_wei));
    info!("  Monitored addresses: {}", parsed.monitored.len());

    let rpc_lb = Arc::new(
        RpcLoadBalancer::new(
            &config.rpc.primary,
            &[&config.rpc.backup1, &config.rpc.backup2],
            config.rpc.max_latency_ms,
        )
        .await?,
    );
    info!("RPC connections established");

    let client = rpc_lb
        .get_client()
        .await
        .ok_or_else(|| eyre::eyre!("no healthy RPC available at startup"))?;

    let wallet: ethers::signers::LocalWallet = config
        .wallet
        .private_key
        .parse()
        .map_err(|e| eyre::eyre!("invalid PRIVATE_KEY: {:?}", e))?;
    let wallet = ethers::signers::Signer::with_chain_id(wallet, parsed.chain_id);
    let account = ethers::signers::Signer::address(&wallet);
    info!("Wallet loaded: {:?}", account);

    // Dependency-ordered construction: nonce -> gas -> safety -> builder ->
    // scanner -> selector, so no two components need a cyclic reference.
    let nonce_registry = Arc::new(NonceRegistry::new(
        Arc::clone(&client),
        Duration::from_secs(config.execution.nonce_cache_ttl_secs),
        config.execution.nonce_max_retries,
        Duration::from_millis(config.execution.nonce_retry_delay_ms),
        Duration::from_secs(config.execution.tx_timeout_secs),
    ));

    let gas_oracle = Arc::new(GasOracle::new(
        Arc::clone(&client),
        parsed.gas_price_oracle,
        config.safety.min_gas_price_gwei as f64,
        config.safety.max_gas_price_gwei as f64,
    ));

    let notifier: Arc<dyn collaborators::NotificationSink> = Arc::new(TelegramNotifier::new(
        config.monitoring.telegram_bot_token.clone(),
        config.monitoring.telegram_chat_id.clone(),
    ));
    let price_oracle: Arc<dyn collaborators::PriceOracle> = Arc::new(NullPriceOracle);
    let tx_store: Arc<dyn collaborators::TxStore> = Arc::new(LoggingTxStore);

    let safety_params = SafetyParams {
        min_balance_wei: parsed.min_balance_wei,
        max_gas_price_gwei: config.safety.max_gas_price_gwei as f64,
        min_gas_price_gwei: config.safety.min_gas_price_gwei as f64,
        max_network_congestion: config.safety.max_network_congestion,
        min_safety_percentage: config.safety.min_safety_percentage,
        min_profit_wei: parsed.min_profit_wei,
        profit_safety_margin: config.safety.profit_safety_margin,
        min_slippage_percent: config.safety.min_slippage_percent,
        max_slippage_percent: config.safety.max_slippage_percent,
        duplicate_cache_ttl: Duration::from_secs(config.safety.duplicate_cache_ttl_secs),
        allowed_tokens: parsed.allowed_tokens.clone(),
    };
    let safety = Arc::new(SafetyEngine::new(
        Arc::clone(&client),
        Arc::clone(&gas_oracle),
        Arc::clone(&price_oracle),
        Arc::clone(&notifier),
        account,
        safety_params,
    ));

    let tx_builder = Arc::new(TxBuilder::new(
        Arc::clone(&client),
        wallet,
        Arc::clone(&nonce_registry),
        Arc::clone(&gas_oracle),
        parsed.chain_id,
        config.safety.max_gas_price_gwei as f64,
        config.execution.default_gas_limit,
        config.execution.mempool_max_retries,
        Duration::from_millis(config.execution.mempool_retry_delay_ms),
    ));

    let (scanner, opportunity_rx) = MempoolScanner::new(
        Arc::clone(&client),
        Arc::clone(&safety),
        parsed.monitored.clone(),
        Duration::from_secs(config.execution.mempool_poll_interval_secs),
        config.execution.mempool_max_parallel_tasks,
        config.monitoring.processed_hashes_cap,
    );

    let selector = Arc::new(StrategySelector::new(StrategySelectorParams {
        exploration_rate: config.strategy.exploration_rate,
        base_learning_rate: config.strategy.base_learning_rate,
        decay_factor: config.strategy.decay_factor,
        min_weight: config.strategy.min_weight,
        max_weight: config.strategy.max_weight,
        save_interval: config.strategy.save_interval,
        weights_path: config.strategy.weights_path.clone().into(),
    }));

    let worker = ChainWorker::new(
        Arc::clone(&client),
        account,
        Arc::clone(&nonce_registry),
        Arc::clone(&gas_oracle),
        Arc::clone(&safety),
        Arc::clone(&tx_builder),
        Arc::clone(&scanner),
        opportunity_rx,
        Arc::clone(&selector),
        Arc::clone(&tx_store),
        Arc::clone(&notifier),
        parsed.flashloan_helper,
        Duration::from_secs(config.monitoring.memory_check_interval_secs),
    );

    notifier
        .notify("MEV engine starting up", collaborators::NotifyLevel::Info, None)
        .await;

    // RPC health-check loop, matching the teacher's own background task shape.
    let rpc_lb_health = Arc::clone(&rpc_lb);
    let health_check_interval_ms = config.rpc.health_check_interval_ms;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(health_check_interval_ms));
        loop {
            ticker.tick().await;
            rpc_lb_health.health_check().await;
        }
    });

    worker.start().await;

    info!("═══════════════════════════════════════════");
    info!("Chain worker started - listening for opportunities");
    info!("═══════════════════════════════════════════");

    // Periodic stats logging, and a supervised loop around worker health
    // that mirrors the reference main's `match ... { Some(...), None =>
    // restart }` shape at the process level.
    let mut stats_ticker = tokio::time::interval(Duration::from_secs(300));
    loop {
        stats_ticker.tick().await;
        let metrics = worker.metrics().await;
        info!(
            balance_wei = %metrics.wallet_balance_wei,
            gas_gwei = metrics.dynamic_gas_price_gwei,
            congestion = metrics.congestion,
            circuit_broken = metrics.circuit_broken,
            opportunities_handled = metrics.opportunities_handled,
            "periodic stats"
        );

        if !worker.is_healthy().await {
            warn!("chain worker unhealthy (circuit broken or empty strategy registry)");
        }
        if metrics.circuit_broken {
            error!("circuit breaker is tripped; submissions are halted until reset_circuit");
        }
    }
}
