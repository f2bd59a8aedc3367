//! Dynamic gas pricing and network-congestion sampling. Grounded on the
//! original system's `SafetyNet.get_dynamic_gas_price`/`get_congestion`, cast
//! in the teacher's `abigen!`-and-`DashMap`-cache idiom (`rpc/client.rs`'s
//! exponential-smoothing health tracking is the model for the trend signal
//! here).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethers::prelude::*;
use ethers::types::{Address, BlockNumber, I256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::rpc::WsClient;

const CONGESTION_WINDOW: Duration = Duration::from_secs(3600);
const PENDING_SATURATION: f64 = 5000.0;
const TREND_SAMPLE_CAP: usize = 10;

abigen!(
    GasPriceOracleLatest,
    r#"[
        function getLatestGasPrice() external view returns (uint256)
    ]"#
);

abigen!(
    GasPriceOracleChainlink,
    r#"[
        function latestAnswer() external view returns (int256)
    ]"#
);

pub struct GasOracle {
    client: Arc<WsClient>,
    oracle_address: Option<Address>,
    min_gwei: f64,
    max_gwei: f64,
    congestion_history: Mutex<VecDeque<(Instant, f64)>>,
    gas_price_trend: Mutex<VecDeque<f64>>,
}

impl GasOracle {
    pub fn new(
        client: Arc<WsClient>,
        oracle_address: Option<Address>,
        min_gwei: f64,
        max_gwei: f64,
    ) -> Self {
        Self {
            client,
            oracle_address,
            min_gwei,
            max_gwei,
            congestion_history: Mutex::new(VecDeque::new()),
            gas_price_trend: Mutex::new(VecDeque::new()),
        }
    }

    fn clamp(&self, gwei: f64) -> f64 {
        gwei.max(self.min_gwei).min(self.max_gwei).max(0.0)
    }

    /// Try the configured gas-price oracle contract, `getLatestGasPrice`
    /// first and `latestAnswer` (Chainlink-style) second. `None` on any
    /// failure or when unconfigured, which callers treat as "fall through
    /// to block-derived pricing".
    async fn oracle_gas_price_gwei(&self) -> Option<f64> {
        let addr = self.oracle_address?;

        let latest = GasPriceOracleLatest::new(addr, self.client.clone());
        if let Ok(price_wei) = latest.get_latest_gas_price().call().await {
            return Some(wei_to_gwei(price_wei));
        }

        let chainlink = GasPriceOracleChainlink::new(addr, self.client.clone());
        if let Ok(answer) = chainlink.latest_answer().call().await {
            if answer > I256::zero() {
                return Some(wei_to_gwei(answer.into_raw()));
            }
        }

        None
    }

    /// Blend gas-used ratio, pending-tx saturation, and gas-price trend into
    /// a single `[0,1]` congestion figure, then fold it into a rolling
    /// 1-hour window and return the linearly recency-weighted average.
    pub async fn get_congestion(&self) -> f64 {
        match self.sample_congestion().await {
            Ok(sample) => {
                let mut history = self.congestion_history.lock().await;
                let now = Instant::now();
                history.push_back((now, sample));
                while let Some((ts, _)) = history.front() {
                    if now.duration_since(*ts) > CONGESTION_WINDOW {
                        history.pop_front();
                    } else {
                        break;
                    }
                }
                recency_weighted_average(history.iter().map(|(_, v)| *v))
            }
            Err(e) => {
                warn!("congestion sample failed, defaulting to 0.5: {:?}", e);
                0.5
            }
        }
    }

    async fn sample_congestion(&self) -> eyre::Result<f64> {
        let block = self
            .client
            .get_block(BlockNumber::Latest)
            .await?
            .ok_or_else(|| eyre::eyre!("no latest block"))?;

        let gas_ratio = if block.gas_limit.is_zero() {
            0.0
        } else {
            block.gas_used.as_u128() as f64 / block.gas_limit.as_u128() as f64
        };

        let pending_count = self
            .client
            .txpool_status()
            .await
            .map(|s| s.pending.as_u64() as f64)
            .unwrap_or(0.0);
        let pending_factor = (pending_count / PENDING_SATURATION).min(1.0);

        let trend_ratio = {
            let mut trend = self.gas_price_trend.lock().await;
            trend.push_back(block.base_fee_per_gas.map(wei_to_gwei).unwrap_or(0.0));
            while trend.len() > TREND_SAMPLE_CAP {
                trend.pop_front();
            }
            gas_price_trend_ratio(trend.iter().copied())
        };
        let trend_signal = ((trend_ratio - 0.95) / 0.5).clamp(0.0, 1.0);

        Ok((gas_ratio * 0.5 + pending_factor * 0.3 + trend_signal * 0.2).clamp(0.0, 1.0))
    }

    /// Single gwei figure for immediate use: oracle contract, then
    /// EIP-1559 base-fee-plus-priority, then legacy node gas price,
    /// clamped to configured bounds as the final step.
    pub async fn dynamic_gas_price(&self) -> f64 {
        if let Some(oracle_price) = self.oracle_gas_price_gwei().await {
            return self.clamp(oracle_price);
        }

        match self.compute_from_block().await {
            Ok(gwei) => self.clamp(gwei),
            Err(e) => {
                warn!("gas price computation failed, using min_gwei: {:?}", e);
                self.clamp(self.min_gwei)
            }
        }
    }

    async fn compute_from_block(&self) -> eyre::Result<f64> {
        let block = self
            .client
            .get_block(BlockNumber::Latest)
            .await?
            .ok_or_else(|| eyre::eyre!("no latest block"))?;

        let congestion = self.get_congestion().await;

        if let Some(base_fee) = block.base_fee_per_gas {
            let base_gwei = wei_to_gwei(base_fee);
            let priority_wei = self
                .client
                .request::<_, U256>("eth_maxPriorityFeePerGas", ())
                .await
                .unwrap_or_else(|_| U256::from(2_000_000_000u64));
            let priority_gwei = wei_to_gwei(priority_wei);
            debug!(
                "EIP-1559 gas: base={} priority={} congestion={}",
                base_gwei, priority_gwei, congestion
            );
            Ok(base_gwei + priority_gwei * (1.0 + congestion))
        } else {
            let node_price = self.client.get_gas_price().await?;
            let node_gwei = wei_to_gwei(node_price);
            Ok(node_gwei * (1.0 + 0.5 * congestion))
        }
    }
}

fn wei_to_gwei(wei: U256) -> f64 {
    let wei_f64 = wei.as_u128() as f64;
    wei_f64 / 1e9
}

/// Ratio of the mean of the most recent three samples to the mean of the
/// rest; `1.0` (neutral) when there aren't enough samples to compare.
fn gas_price_trend_ratio(samples: impl Iterator<Item = f64>) -> f64 {
    let samples: Vec<f64> = samples.collect();
    if samples.len() < 4 {
        return 1.0;
    }
    let split = samples.len() - 3;
    let older = &samples[..split];
    let recent = &samples[split..];
    let older_avg = older.iter().sum::<f64>() / older.len() as f64;
    let recent_avg = recent.iter().sum::<f64>() / recent.len() as f64;
    if older_avg <= 0.0 {
        1.0
    } else {
        recent_avg / older_avg
    }
}

/// Chronological-position weighting: the i-th oldest surviving sample gets
/// weight `i+1`, so the most recent sample dominates without exponential
/// decay's hard cutoff.
fn recency_weighted_average(samples: impl Iterator<Item = f64>) -> f64 {
    let samples: Vec<f64> = samples.collect();
    if samples.is_empty() {
        return 0.5;
    }
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for (i, v) in samples.iter().enumerate() {
        let w = (i + 1) as f64;
        weighted_sum += w * v;
        weight_total += w;
    }
    weighted_sum / weight_total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_weighted_average_favors_recent_samples() {
        let avg = recency_weighted_average(vec![0.0, 0.0, 1.0].into_iter());
        // weights 1,2,3 -> (0*1 + 0*2 + 1*3) / 6 = 0.5
        assert!((avg - 0.5).abs() < 1e-9);
    }

    #[test]
    fn recency_weighted_average_empty_defaults_to_moderate() {
        assert_eq!(recency_weighted_average(std::iter::empty()), 0.5);
    }

    #[test]
    fn trend_ratio_neutral_with_too_few_samples() {
        assert_eq!(gas_price_trend_ratio(vec![10.0, 11.0].into_iter()), 1.0);
    }

    #[test]
    fn trend_ratio_rises_when_recent_gas_higher() {
        let ratio = gas_price_trend_ratio(vec![10.0, 10.0, 10.0, 10.0, 20.0, 20.0, 20.0].into_iter());
        assert!(ratio > 1.0);
    }
}
