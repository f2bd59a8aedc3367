//! Per-chain composition root: wires NonceRegistry, GasOracle, SafetyEngine,
//! TxBuilder, MempoolScanner/OpportunityAnalyzer and StrategySelector
//! together, owns their lifecycle, and exposes health/metrics. Grounded on
//! the original system's `ChainWorker` (`engines/chain_worker.py`:
//! dependency-ordered construction, a periodic `_update_metrics_periodically`
//! task, and a cooperative-cancellation `stop()`), cast in the teacher's
//! `tokio::spawn` + `Arc`-of-components idiom (`main.rs`'s task fan-out).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, U256};
use tokio::sync::{mpsc, Notify};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::collaborators::{NotificationSink, TxEvent, TxStore};
use crate::gas_oracle::GasOracle;
use crate::mempool::{MempoolScanner, Opportunity, StrategyClass};
use crate::nonce::NonceRegistry;
use crate::rpc::WsClient;
use crate::safety::SafetyEngine;
use crate::strategy::StrategySelector;
use crate::tx_builder::{SandwichProfile, TxBuilder, TxRequest};

/// Snapshot exposed for external health/metrics reporting. Mirrors the
/// original's periodic `metrics` dict (`_update_metrics_periodically`).
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    pub wallet_balance_wei: U256,
    pub dynamic_gas_price_gwei: f64,
    pub congestion: f64,
    pub circuit_broken: bool,
    pub opportunities_handled: u64,
}

pub struct ChainWorker {
    client: Arc<WsClient>,
    account: Address,
    nonce_registry: Arc<NonceRegistry>,
    gas_oracle: Arc<GasOracle>,
    safety: Arc<SafetyEngine>,
    tx_builder: Arc<TxBuilder>,
    scanner: Arc<MempoolScanner>,
    selector: Arc<StrategySelector>,
    tx_store: Arc<dyn TxStore>,
    notifier: Arc<dyn NotificationSink>,
    flashloan_helper: Address,
    metrics_refresh_interval: Duration,

    opportunity_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Opportunity>>>,
    opportunities_handled: std::sync::atomic::AtomicU64,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ChainWorker {
    /// Constructs components in the dependency order the original's
    /// container does (nonce -> gas -> safety -> builder -> scanner -> selector).
    /// MempoolScanner and TxBuilder each depend only on SafetyEngine/GasOracle,
    /// never on each other.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<WsClient>,
        account: Address,
        nonce_registry: Arc<NonceRegistry>,
        gas_oracle: Arc<GasOracle>,
        safety: Arc<SafetyEngine>,
        tx_builder: Arc<TxBuilder>,
        scanner: Arc<MempoolScanner>,
        opportunity_rx: mpsc::Receiver<Opportunity>,
        selector: Arc<StrategySelector>,
        tx_store: Arc<dyn TxStore>,
        notifier: Arc<dyn NotificationSink>,
        flashloan_helper: Address,
        metrics_refresh_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            account,
            nonce_registry,
            gas_oracle,
            safety,
            tx_builder,
            scanner,
            selector,
            tx_store,
            notifier,
            flashloan_helper,
            metrics_refresh_interval,
            opportunity_rx: tokio::sync::Mutex::new(Some(opportunity_rx)),
            opportunities_handled: std::sync::atomic::AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawns the scanner's discovery pipeline, the periodic metrics
    /// refresh, and the opportunity-consumption loop, then returns.
    pub async fn start(self: &Arc<Self>) {
        self.scanner.start();

        let metrics_worker = Arc::clone(self);
        let metrics_handle = tokio::spawn(async move {
            metrics_worker.metrics_loop().await;
        });

        let opportunity_worker = Arc::clone(self);
        let opportunity_handle = tokio::spawn(async move {
            opportunity_worker.opportunity_loop().await;
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(metrics_handle);
        tasks.push(opportunity_handle);
    }

    /// Periodic wallet-balance and gas-price refresh, matching the
    /// original's `_update_metrics_periodically`. Also the natural place to
    /// re-probe `is_safe_to_proceed`, since a low balance trips the circuit
    /// breaker as a side effect.
    async fn metrics_loop(self: Arc<Self>) {
        let mut ticker = interval(self.metrics_refresh_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown_notify.notified() => return,
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let metrics = self.metrics().await;
            info!(
                balance_wei = %metrics.wallet_balance_wei,
                gas_gwei = metrics.dynamic_gas_price_gwei,
                congestion = metrics.congestion,
                circuit_broken = metrics.circuit_broken,
                "chain worker metrics refreshed"
            );

            // Touching is_safe_to_proceed here (rather than only at dispatch
            // time) means the circuit breaker trips promptly on a balance
            // drop even during a quiet period with no pending opportunities.
            let _ = self.safety.is_safe_to_proceed().await;
        }
    }

    pub async fn metrics(&self) -> WorkerMetrics {
        let wallet_balance_wei = self
            .client
            .get_balance(self.account, None)
            .await
            .unwrap_or_default();
        let dynamic_gas_price_gwei = self.gas_oracle.dynamic_gas_price().await;
        let congestion = self.gas_oracle.get_congestion().await;

        WorkerMetrics {
            wallet_balance_wei,
            dynamic_gas_price_gwei,
            congestion,
            circuit_broken: self.safety.is_circuit_broken(),
            opportunities_handled: self.opportunities_handled.load(Ordering::SeqCst),
        }
    }

    /// True when every subordinate component is in a servable state: the
    /// circuit is not broken and the bandit registry is non-empty.
    pub async fn is_healthy(&self) -> bool {
        !self.safety.is_circuit_broken() && self.selector.is_healthy().await
    }

    /// The main consumption loop: pop a candidate, dispatch it through the
    /// bandit, record the outcome as a structured event. Mirrors the
    /// reference `main.rs`'s `match opportunity_rx.recv().await { Some(..)
    /// => .., None => restart }` shape, treating a closed channel as a
    /// signal to stop (the scanner only drops its sender on worker
    /// shutdown).
    async fn opportunity_loop(self: Arc<Self>) {
        let mut rx = match self.opportunity_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("opportunity loop started twice; second caller has nothing to consume");
                return;
            }
        };

        loop {
            let next = tokio::select! {
                n = rx.recv() => n,
                _ = self.shutdown_notify.notified() => return,
            };

            match next {
                Some(opportunity) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    self.handle_opportunity(opportunity).await;
                }
                None => {
                    error!("opportunity channel closed; mempool scanner is no longer producing");
                    return;
                }
            }
        }
    }

    async fn handle_opportunity(self: &Arc<Self>, opportunity: Opportunity) {
        if !self.safety.is_safe_to_proceed().await {
            warn!(
                tx_hash = %format!("{:?}", opportunity.tx_hash),
                "dropping opportunity: circuit broken or unsafe to proceed"
            );
            return;
        }

        let class = opportunity.strategy_class;
        let worker = Arc::clone(self);
        let target = opportunity.clone();

        let outcome = self
            .selector
            .execute_best(class, move |arm| {
                let worker = Arc::clone(&worker);
                let target = target.clone();
                async move { worker.dispatch_arm(arm, &target).await }
            })
            .await;

        self.opportunities_handled.fetch_add(1, Ordering::SeqCst);

        let event = if outcome.success {
            TxEvent::Confirmed {
                hash: format!("{:?}", opportunity.tx_hash),
                profit_wei: format!("{}", eth_to_wei(outcome.profit_eth)),
            }
        } else {
            TxEvent::Failed {
                hash: format!("{:?}", opportunity.tx_hash),
                reason: format!("strategy {} did not succeed", outcome.arm),
            }
        };
        self.tx_store.record(event).await;

        info!(
            tx_hash = %format!("{:?}", opportunity.tx_hash),
            arm = outcome.arm,
            success = outcome.success,
            profit_eth = outcome.profit_eth,
            exec_time_s = outcome.exec_time_s,
            "strategy execution finished"
        );
    }

    /// Maps a bandit-selected arm name to the matching TxBuilder primitive,
    /// measuring realized profit as the receipt-confirmed running total's
    /// delta across the call. The same technique the original's
    /// `execute_best_strategy` uses against `TransactionCore.current_profit`.
    async fn dispatch_arm(
        self: &Arc<Self>,
        arm: &'static str,
        opportunity: &Opportunity,
    ) -> Result<f64, String> {
        let before = self.tx_builder.current_profit_eth().await;

        let request = || {
            TxRequest::new(
                opportunity.target.to.unwrap_or(self.account),
                opportunity.target.value,
                opportunity.target.input.clone(),
            )
        };

        let result = match arm {
            "eth_transaction" => self.tx_builder.front_run(request()).await.map(|h| (h, None)),
            "front_run" => self.tx_builder.front_run(request()).await.map(|h| (h, None)),
            "back_run" => self.tx_builder.back_run(request()).await.map(|h| (h, None)),
            "aggressive_front_run" => self
                .tx_builder
                .aggressive_front_run(request())
                .await
                .map(|h| (h, None)),
            "volatility_front_run" => self
                .tx_builder
                .volatility_front_run(request())
                .await
                .map(|h| (h, None)),
            "predictive_front_run" => self
                .tx_builder
                .predictive_front_run(request())
                .await
                .map(|h| (h, None)),
            "price_dip_back_run" => self
                .tx_builder
                .price_dip_back_run(request())
                .await
                .map(|h| (h, None)),
            "high_volume_back_run" => self
                .tx_builder
                .high_volume_back_run(request())
                .await
                .map(|h| (h, None)),
            "flashloan_front_run" => self
                .tx_builder
                .flashloan_front_run(self.flashloan_helper, request())
                .await
                .map(|h| (h, None)),
            "flashloan_back_run" => self
                .tx_builder
                .flashloan_back_run(self.flashloan_helper, request())
                .await
                .map(|h| (h, None)),
            "execute_sandwich_attack" => self
                .tx_builder
                .execute_sandwich_attack(request(), request(), SandwichProfile::Default)
                .await
                .map(|(front, back)| (front, Some(back))),
            "flashloan_sandwich_attack" => self
                .tx_builder
                .flashloan_sandwich_attack(
                    self.flashloan_helper,
                    request(),
                    request(),
                    SandwichProfile::Default,
                )
                .await
                .map(|(front, back)| (front, Some(back))),
            other => return Err(format!("unregistered strategy arm {}", other)),
        };

        match result {
            Ok((hash, _back_hash)) => {
                self.tx_store
                    .record(TxEvent::Submitted {
                        hash: format!("{:?}", hash),
                    })
                    .await;
                let after = self.tx_builder.current_profit_eth().await;
                Ok((after - before).max(0.0))
            }
            Err(e) => Err(format!("{:?}", e)),
        }
    }

    /// Sets the shutdown flag, wakes every task parked on the shutdown
    /// notify, and awaits their termination with a soft timeout. In-flight
    /// RPC calls and already-submitted transactions are not rolled back.
    /// Only the cooperative loops stop spawning new work.
    pub async fn stop(self: &Arc<Self>, soft_timeout: Duration) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();

        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(soft_timeout, handle).await.is_err() {
                warn!("background task did not exit within the shutdown grace period");
            }
        }

        self.scanner.purge_processed().await;
        self.selector.save_weights().await;

        self.notifier
            .notify("chain worker stopped", crate::collaborators::NotifyLevel::Info, None)
            .await;
    }
}

fn eth_to_wei(eth: f64) -> U256 {
    U256::from((eth.max(0.0) * 1e18) as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eth_to_wei_round_trips_whole_ether() {
        assert_eq!(eth_to_wei(1.0), U256::from(10u64).pow(U256::from(18)));
    }

    #[test]
    fn eth_to_wei_clamps_negative_to_zero() {
        assert_eq!(eth_to_wei(-0.5), U256::zero());
    }

    // Every arm name StrategySelector::new registers across its four
    // classes must have a matching case in dispatch_arm, or a bandit pick
    // would fail at dispatch time with "unregistered strategy arm".
    #[test]
    fn dispatch_arm_covers_every_registered_arm_name() {
        let registered = [
            "eth_transaction",
            "front_run",
            "flashloan_front_run",
            "aggressive_front_run",
            "predictive_front_run",
            "volatility_front_run",
            "back_run",
            "price_dip_back_run",
            "flashloan_back_run",
            "high_volume_back_run",
            "flashloan_sandwich_attack",
            "execute_sandwich_attack",
        ];
        let handled = [
            "eth_transaction",
            "front_run",
            "back_run",
            "aggressive_front_run",
            "volatility_front_run",
            "predictive_front_run",
            "price_dip_back_run",
            "high_volume_back_run",
            "flashloan_front_run",
            "flashloan_back_run",
            "execute_sandwich_attack",
            "flashloan_sandwich_attack",
        ];
        for arm in registered {
            assert!(
                handled.contains(&arm),
                "arm {arm} registered by StrategySelector but not handled by dispatch_arm"
            );
        }
    }

    #[test]
    fn worker_metrics_snapshot_carries_all_fields() {
        let metrics = WorkerMetrics {
            wallet_balance_wei: U256::from(42u64),
            dynamic_gas_price_gwei: 12.5,
            congestion: 0.3,
            circuit_broken: false,
            opportunities_handled: 7,
        };
        assert_eq!(metrics.wallet_balance_wei, U256::from(42u64));
        assert_eq!(metrics.opportunities_handled, 7);
        assert!(!metrics.circuit_broken);
    }
}
