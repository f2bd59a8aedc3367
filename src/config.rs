use ethers::types::{Address, U256};
use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub rpc: RpcConfig,
    pub wallet: WalletConfig,
    pub monitored: MonitoredConfig,
    pub safety: SafetyConfig,
    pub strategy: StrategyConfig,
    pub execution: ExecutionConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    pub primary: String,
    pub backup1: String,
    pub backup2: String,
    pub health_check_interval_ms: u64,
    pub max_latency_ms: u64,
    pub chain_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key: String,
    pub arb_contract: String,
    pub flashloan_helper: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoredConfig {
    /// Lower-cased `0x`-prefixed addresses of tokens/routers the scanner
    /// watches. Entries not starting with `0x` are discarded at load time;
    /// symbol resolution is an external collaborator's job.
    pub addresses: Vec<String>,
    pub allowed_tokens: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    pub min_balance_eth: f64,
    pub max_gas_price_gwei: u64,
    pub min_gas_price_gwei: u64,
    pub max_network_congestion: f64,
    pub min_safety_percentage: f64,
    pub min_profit_eth: f64,
    pub profit_safety_margin: f64,
    pub min_slippage_percent: f64,
    pub max_slippage_percent: f64,
    pub duplicate_cache_ttl_secs: u64,
    pub gas_price_oracle: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub exploration_rate: f64,
    pub base_learning_rate: f64,
    pub decay_factor: f64,
    pub min_weight: f64,
    pub max_weight: f64,
    pub save_interval: u64,
    pub weights_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    pub nonce_cache_ttl_secs: u64,
    pub nonce_max_retries: u32,
    pub nonce_retry_delay_ms: u64,
    pub tx_timeout_secs: u64,
    pub mempool_max_retries: u32,
    pub mempool_retry_delay_ms: u64,
    pub mempool_max_parallel_tasks: usize,
    pub mempool_poll_interval_secs: u64,
    pub gas_retry_bump: f64,
    pub default_gas_limit: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub log_level: String,
    pub memory_check_interval_secs: u64,
    pub processed_hashes_cap: usize,
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        Self::load("config.toml").unwrap_or_else(|_| Self::default())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rpc: RpcConfig {
                primary: std::env::var("RPC_URL_PRIMARY")
                    .unwrap_or_else(|_| "wss://eth-mainnet.g.alchemy.com/v2/demo".into()),
                backup1: std::env::var("RPC_URL_BACKUP1")
                    .unwrap_or_else(|_| "wss://eth-mainnet.g.alchemy.com/v2/demo".into()),
                backup2: std::env::var("RPC_URL_BACKUP2")
                    .unwrap_or_else(|_| "wss://mainnet.infura.io/ws/v3/demo".into()),
                health_check_interval_ms: 5000,
                max_latency_ms: 100,
                chain_id: std::env::var("CHAIN_ID")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1),
            },
            wallet: WalletConfig {
                private_key: std::env::var("WALLET_KEY").unwrap_or_default(),
                arb_contract: std::env::var("ARB_CONTRACT").unwrap_or_default(),
                flashloan_helper: std::env::var("FLASHLOAN_HELPER").unwrap_or_default(),
            },
            monitored: MonitoredConfig {
                addresses: vec![],
                allowed_tokens: vec![],
            },
            safety: SafetyConfig {
                min_balance_eth: 0.001,
                max_gas_price_gwei: 100,
                min_gas_price_gwei: 1,
                max_network_congestion: 0.8,
                min_safety_percentage: 85.0,
                min_profit_eth: 0.001,
                profit_safety_margin: 0.95,
                min_slippage_percent: 0.05,
                max_slippage_percent: 5.0,
                duplicate_cache_ttl_secs: 300,
                gas_price_oracle: None,
            },
            strategy: StrategyConfig {
                exploration_rate: 0.10,
                base_learning_rate: 0.01,
                decay_factor: 0.95,
                min_weight: 0.10,
                max_weight: 10.0,
                save_interval: 25,
                weights_path: "strategy_weights.json".into(),
            },
            execution: ExecutionConfig {
                nonce_cache_ttl_secs: 60,
                nonce_max_retries: 5,
                nonce_retry_delay_ms: 1000,
                tx_timeout_secs: 120,
                mempool_max_retries: 3,
                mempool_retry_delay_ms: 2000,
                mempool_max_parallel_tasks: 10,
                mempool_poll_interval_secs: 2,
                gas_retry_bump: 1.15,
                default_gas_limit: 100_000,
            },
            monitoring: MonitoringConfig {
                telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
                telegram_chat_id: std::env::var("TELEGRAM_CHAT_ID").ok(),
                log_level: "info".into(),
                memory_check_interval_secs: 300,
                processed_hashes_cap: 200_000,
            },
        }
    }
}

/// Config fields parsed into the typed values the hot path actually needs,
/// so parse errors surface once at startup rather than on every call.
#[derive(Debug, Clone)]
pub struct ParsedConfig {
    pub chain_id: u64,
    pub arb_contract: Address,
    pub flashloan_helper: Address,
    pub monitored: Vec<Address>,
    pub allowed_tokens: Vec<Address>,
    pub min_balance_wei: U256,
    pub min_profit_wei: U256,
    pub gas_price_oracle: Option<Address>,
}

impl ParsedConfig {
    pub fn from_config(config: &Config) -> eyre::Result<Self> {
        let monitored = crate::collaborators::normalize_address_list(&config.monitored.addresses);
        let allowed_tokens =
            crate::collaborators::normalize_address_list(&config.monitored.allowed_tokens);

        let arb_contract = config
            .wallet
            .arb_contract
            .parse()
            .unwrap_or(Address::zero());
        let flashloan_helper = config
            .wallet
            .flashloan_helper
            .parse()
            .unwrap_or(Address::zero());

        let gas_price_oracle = match &config.safety.gas_price_oracle {
            Some(s) if !s.is_empty() => Some(s.parse()?),
            _ => None,
        };

        Ok(ParsedConfig {
            chain_id: config.rpc.chain_id,
            arb_contract,
            flashloan_helper,
            monitored,
            allowed_tokens,
            min_balance_wei: ethers::utils::parse_ether(config.safety.min_balance_eth)?,
            min_profit_wei: ethers::utils::parse_ether(config.safety.min_profit_eth)?,
            gas_price_oracle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        let config = Config::default();
        let parsed = ParsedConfig::from_config(&config).unwrap();
        assert_eq!(parsed.chain_id, config.rpc.chain_id);
        assert!(parsed.monitored.is_empty());
    }

    #[test]
    fn load_missing_file_falls_back_to_default() {
        assert!(Config::load("/nonexistent/path/config.toml").is_err());
        let _ = Config::load_or_default();
    }
}
