//! Central policy gate: profitability, slippage, duplicate detection, and the
//! process-wide circuit breaker. Grounded on `SafetyNet` in the original
//! system's `engines/safety_net.py`, cast in the teacher's
//! `Arc<WsClient>` + `DashMap`/`RwLock` idiom (`scout/safety.rs` is the
//! closest teacher analogue, a standalone safety gate consulted before a
//! trade commits).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethers::types::{Address, H256, U256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::collaborators::{NotificationSink, NotifyLevel, PriceOracle};
use crate::gas_oracle::GasOracle;
use crate::rpc::WsClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlippageTier {
    Low,
    Medium,
    High,
    Extreme,
}

#[derive(Debug, Clone)]
pub struct SafetyParams {
    pub min_balance_wei: U256,
    pub max_gas_price_gwei: f64,
    pub min_gas_price_gwei: f64,
    pub max_network_congestion: f64,
    pub min_safety_percentage: f64,
    pub min_profit_wei: U256,
    pub profit_safety_margin: f64,
    pub min_slippage_percent: f64,
    pub max_slippage_percent: f64,
    pub duplicate_cache_ttl: Duration,
    pub allowed_tokens: Vec<Address>,
}

/// Synthesized record an `analyse` or `execute` step hands the engine for a
/// full six-check pass. Mirrors the original's ad-hoc `tx_data` dict.
#[derive(Debug, Clone)]
pub struct TxSafetyProbe {
    pub tx_hash: Option<H256>,
    pub from: Address,
    pub gas_price_gwei: f64,
    pub gas_used: u64,
    pub value_wei: U256,
    pub input_token: Option<Address>,
    pub output_token: Option<Address>,
    pub amount_in_wei: U256,
    pub amount_out_wei: U256,
}

#[derive(Debug, Clone)]
pub struct CheckDetail {
    pub passed: bool,
    pub context: String,
}

#[derive(Debug, Clone)]
pub struct SafetyReport {
    pub checks_passed: u32,
    pub checks_total: u32,
    pub safety_percent: f64,
    pub details: Vec<(&'static str, CheckDetail)>,
}

impl SafetyReport {
    pub fn detail(&self, name: &str) -> Option<&CheckDetail> {
        self.details.iter().find(|(n, _)| *n == name).map(|(_, d)| d)
    }
}

struct RecentTxCache {
    hashes: HashSet<H256>,
    window_start: Instant,
}

pub struct SafetyEngine {
    client: Arc<WsClient>,
    gas_oracle: Arc<GasOracle>,
    price_oracle: Arc<dyn PriceOracle>,
    notifier: Arc<dyn NotificationSink>,
    account: Address,
    params: SafetyParams,
    circuit_broken: AtomicBool,
    circuit_reason: Mutex<Option<String>>,
    recent_txs: Mutex<RecentTxCache>,
}

impl SafetyEngine {
    pub fn new(
        client: Arc<WsClient>,
        gas_oracle: Arc<GasOracle>,
        price_oracle: Arc<dyn PriceOracle>,
        notifier: Arc<dyn NotificationSink>,
        account: Address,
        params: SafetyParams,
    ) -> Self {
        Self {
            client,
            gas_oracle,
            price_oracle,
            notifier,
            account,
            params,
            circuit_broken: AtomicBool::new(false),
            circuit_reason: Mutex::new(None),
            recent_txs: Mutex::new(RecentTxCache {
                hashes: HashSet::new(),
                window_start: Instant::now(),
            }),
        }
    }

    /// Circuit check, then balance check (breaking the circuit on
    /// violation), then a gas-price sanity check against the current oracle
    /// reading.
    pub async fn is_safe_to_proceed(&self) -> bool {
        if self.circuit_broken.load(Ordering::SeqCst) {
            return false;
        }

        match self.client.get_balance(self.account, None).await {
            Ok(balance) if balance < self.params.min_balance_wei => {
                self.break_circuit(&format!(
                    "account balance {} wei below minimum {} wei",
                    balance, self.params.min_balance_wei
                ))
                .await;
                return false;
            }
            Err(e) => {
                warn!("balance check failed during is_safe_to_proceed: {:?}", e);
                return false;
            }
            _ => {}
        }

        let gas_gwei = self.gas_oracle.dynamic_gas_price().await;
        if gas_gwei > self.params.max_gas_price_gwei {
            warn!(
                "current gas price {} gwei exceeds cap {} gwei",
                gas_gwei, self.params.max_gas_price_gwei
            );
            return false;
        }

        true
    }

    pub fn is_circuit_broken(&self) -> bool {
        self.circuit_broken.load(Ordering::SeqCst)
    }

    pub async fn break_circuit(&self, reason: &str) {
        self.circuit_broken.store(true, Ordering::SeqCst);
        *self.circuit_reason.lock().await = Some(reason.to_string());
        tracing::error!("circuit breaker tripped: {}", reason);
        self.notifier
            .notify("circuit breaker tripped", NotifyLevel::Critical, Some(reason))
            .await;
    }

    pub async fn reset_circuit(&self) {
        self.circuit_broken.store(false, Ordering::SeqCst);
        *self.circuit_reason.lock().await = None;
        info!("circuit breaker reset");
    }

    /// `< 0.3` low, `[0.3, 0.6)` medium, `[0.6, 0.8)` high, `>= 0.8` extreme,
    /// then clamped to the configured slippage bounds.
    pub async fn adjust_slippage_tolerance(&self, congestion: Option<f64>) -> f64 {
        let congestion = match congestion {
            Some(c) => c,
            None => self.gas_oracle.get_congestion().await,
        };

        let base = if congestion < 0.3 {
            0.5
        } else if congestion < 0.6 {
            1.0
        } else if congestion < 0.8 {
            2.0
        } else {
            5.0
        };

        base.max(self.params.min_slippage_percent)
            .min(self.params.max_slippage_percent)
    }

    fn gas_cost_eth(&self, gas_price_gwei: f64, gas_used: u64) -> f64 {
        gas_price_gwei * gas_used as f64 * 1e-9
    }

    /// Converts both legs to ether via the price oracle, subtracts gas cost,
    /// applies the safety margin, and compares against `min_profit_wei`.
    /// Degenerate cases (missing tokens/price) return false.
    pub async fn ensure_profit(&self, probe: &TxSafetyProbe) -> bool {
        let gas_cost_eth = self.gas_cost_eth(probe.gas_price_gwei, probe.gas_used);

        let (Some(input_token), Some(output_token)) = (probe.input_token, probe.output_token)
        else {
            return false;
        };

        let in_price = self
            .price_oracle
            .real_time_price(&format!("{:?}", input_token), "eth")
            .await;
        let out_price = self
            .price_oracle
            .real_time_price(&format!("{:?}", output_token), "eth")
            .await;

        let (Some(in_price), Some(out_price)) = (in_price, out_price) else {
            return false;
        };

        let in_eth = wei_to_eth(probe.amount_in_wei) * in_price;
        let out_eth = wei_to_eth(probe.amount_out_wei) * out_price;
        let net = out_eth - in_eth - gas_cost_eth;
        let adjusted = net * self.params.profit_safety_margin;

        adjusted >= wei_to_eth(self.params.min_profit_wei)
    }

    /// Cheap pre-flight check distinct from the full six-check report: gas
    /// price/limit sanity and a balance-vs-value comparison, useful before
    /// paying for the pricier `check_transaction_safety` pass.
    pub async fn validate_transaction_params(&self, probe: &TxSafetyProbe) -> Option<String> {
        if probe.gas_price_gwei <= 0.0 || probe.gas_price_gwei > self.params.max_gas_price_gwei {
            return Some(format!("gas price {} gwei out of bounds", probe.gas_price_gwei));
        }
        if probe.gas_used == 0 {
            return Some("gas limit must be positive".to_string());
        }

        match self.client.get_balance(probe.from, None).await {
            Ok(balance) => {
                // value must not exceed balance * 0.95, i.e. balance * 95 >= value * 100.
                if balance.saturating_mul(U256::from(95)) < probe.value_wei.saturating_mul(U256::from(100)) {
                    return Some(format!(
                        "value {} wei exceeds 95% of balance {} wei",
                        probe.value_wei, balance
                    ));
                }
            }
            Err(e) => return Some(format!("balance lookup failed: {:?}", e)),
        }

        None
    }

    /// Expiration clears the whole set, not per-entry. Matches the
    /// original's coarse-grained cache reset.
    async fn is_transaction_duplicate(&self, tx_hash: Option<H256>) -> bool {
        let Some(hash) = tx_hash else {
            return false;
        };

        let mut cache = self.recent_txs.lock().await;
        if cache.window_start.elapsed() >= self.params.duplicate_cache_ttl {
            cache.hashes.clear();
            cache.window_start = Instant::now();
        }

        if cache.hashes.contains(&hash) {
            return true;
        }
        cache.hashes.insert(hash);
        false
    }

    /// The six-check pass: gas, congestion, profit, token allow-list,
    /// balance, and duplicate detection. `is_safe = safety_percent >=
    /// min_safety_percentage`.
    pub async fn check_transaction_safety(&self, probe: &TxSafetyProbe) -> (bool, SafetyReport) {
        let mut details: Vec<(&'static str, CheckDetail)> = Vec::new();

        let gas_ok = probe.gas_price_gwei <= self.params.max_gas_price_gwei;
        details.push((
            "gas_check",
            CheckDetail {
                passed: gas_ok,
                context: format!("{} gwei vs cap {}", probe.gas_price_gwei, self.params.max_gas_price_gwei),
            },
        ));

        let congestion = self.gas_oracle.get_congestion().await;
        let congestion_ok = congestion <= self.params.max_network_congestion;
        details.push((
            "congestion_check",
            CheckDetail {
                passed: congestion_ok,
                context: format!("{:.3} vs cap {}", congestion, self.params.max_network_congestion),
            },
        ));

        let profit_ok = self.ensure_profit(probe).await;
        details.push((
            "profit_check",
            CheckDetail {
                passed: profit_ok,
                context: "ensure_profit".to_string(),
            },
        ));

        let token_ok = if self.params.allowed_tokens.is_empty() {
            true
        } else {
            let in_allowed = probe
                .input_token
                .map(|t| self.params.allowed_tokens.contains(&t))
                .unwrap_or(false);
            let out_allowed = probe
                .output_token
                .map(|t| self.params.allowed_tokens.contains(&t))
                .unwrap_or(false);
            in_allowed && out_allowed
        };
        details.push((
            "token_check",
            CheckDetail {
                passed: token_ok,
                context: "allow-list membership".to_string(),
            },
        ));

        let balance_ok = match self.client.get_balance(probe.from, None).await {
            Ok(balance) => {
                let required = probe.value_wei.saturating_mul(U256::from(105)) / U256::from(100);
                balance >= required
            }
            Err(_) => false,
        };
        details.push((
            "balance_check",
            CheckDetail {
                passed: balance_ok,
                context: "balance >= 1.05 * value".to_string(),
            },
        ));

        let duplicate = self.is_transaction_duplicate(probe.tx_hash).await;
        details.push((
            "duplicate_check",
            CheckDetail {
                passed: !duplicate,
                context: "recent_txs membership".to_string(),
            },
        ));

        let checks_total = details.len() as u32;
        let checks_passed = details.iter().filter(|(_, d)| d.passed).count() as u32;
        let safety_percent = (checks_passed as f64 / checks_total as f64) * 100.0;
        let is_safe = safety_percent >= self.params.min_safety_percentage;

        debug!(
            "safety check: {}/{} passed ({:.1}%) -> safe={}",
            checks_passed, checks_total, safety_percent, is_safe
        );

        (
            is_safe,
            SafetyReport {
                checks_passed,
                checks_total,
                safety_percent,
                details,
            },
        )
    }
}

fn wei_to_eth(wei: U256) -> f64 {
    wei.as_u128() as f64 / 1e18
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slippage_boundaries_are_deterministic() {
        fn tier_of(congestion: f64) -> SlippageTier {
            if congestion < 0.3 {
                SlippageTier::Low
            } else if congestion < 0.6 {
                SlippageTier::Medium
            } else if congestion < 0.8 {
                SlippageTier::High
            } else {
                SlippageTier::Extreme
            }
        }

        assert_eq!(tier_of(0.29), SlippageTier::Low);
        assert_eq!(tier_of(0.3), SlippageTier::Medium);
        assert_eq!(tier_of(0.59), SlippageTier::Medium);
        assert_eq!(tier_of(0.6), SlippageTier::High);
        assert_eq!(tier_of(0.79), SlippageTier::High);
        assert_eq!(tier_of(0.8), SlippageTier::Extreme);
    }

    #[test]
    fn balance_check_accepts_exact_105_percent() {
        let balance = U256::from(105u64);
        let value = U256::from(100u64);
        let required = value.saturating_mul(U256::from(105)) / U256::from(100);
        assert!(balance >= required);

        let short = U256::from(104u64);
        assert!(short < required);
    }

    #[test]
    fn wei_to_eth_conversion() {
        let one_eth = U256::from(10u64).pow(U256::from(18u64));
        assert!((wei_to_eth(one_eth) - 1.0).abs() < 1e-9);
    }
}
