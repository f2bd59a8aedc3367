//! ε-greedy multi-armed bandit over named strategy functions, with
//! sorted-key JSON-persisted weights. Grounded on the pure-math,
//! doc-per-function style of `detector/solver.rs`, generalized to the
//! original system's `StrategyNet` (per-class arm registry, softmax
//! selection, decayed exec-time averaging, change-detected persistence).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::mempool::StrategyClass;

fn class_name(class: StrategyClass) -> &'static str {
    match class {
        StrategyClass::EthTransaction => "eth_transaction",
        StrategyClass::FrontRun => "front_run",
        StrategyClass::BackRun => "back_run",
        StrategyClass::SandwichAttack => "sandwich_attack",
    }
}

/// Running outcome statistics for one registered strategy function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyMetrics {
    pub successes: u64,
    pub failures: u64,
    pub total: u64,
    pub profit_sum_eth: f64,
    pub avg_exec_time_s: f64,
}

impl StrategyMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }
}

struct ClassArms {
    names: Vec<&'static str>,
    weights: Vec<f64>,
    metrics: Vec<StrategyMetrics>,
}

impl ClassArms {
    fn new(names: Vec<&'static str>) -> Self {
        let len = names.len();
        Self {
            names,
            weights: vec![1.0; len],
            metrics: vec![StrategyMetrics::default(); len],
        }
    }
}

#[derive(Debug, Clone)]
pub struct StrategySelectorParams {
    pub exploration_rate: f64,
    pub base_learning_rate: f64,
    pub decay_factor: f64,
    pub min_weight: f64,
    pub max_weight: f64,
    pub save_interval: u64,
    pub weights_path: PathBuf,
}

/// What a dispatched strategy run resolved to, handed back to the caller
/// alongside the bandit update it already triggered.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub arm: &'static str,
    pub success: bool,
    pub profit_eth: f64,
    pub exec_time_s: f64,
}

pub struct StrategySelector {
    classes: Mutex<HashMap<&'static str, ClassArms>>,
    params: StrategySelectorParams,
    total_executions: AtomicU64,
    updates_since_save: Mutex<u64>,
    last_saved_json: Mutex<Option<String>>,
}

impl StrategySelector {
    /// Registers the default function census: `eth_transaction` (1 arm),
    /// `front_run` (5), `back_run` (4), `sandwich_attack` (2), then loads
    /// any on-disk weights whose vector length still matches.
    pub fn new(params: StrategySelectorParams) -> Self {
        let mut classes = HashMap::new();
        classes.insert("eth_transaction", ClassArms::new(vec!["eth_transaction"]));
        classes.insert(
            "front_run",
            ClassArms::new(vec![
                "front_run",
                "flashloan_front_run",
                "aggressive_front_run",
                "predictive_front_run",
                "volatility_front_run",
            ]),
        );
        classes.insert(
            "back_run",
            ClassArms::new(vec![
                "back_run",
                "price_dip_back_run",
                "flashloan_back_run",
                "high_volume_back_run",
            ]),
        );
        classes.insert(
            "sandwich_attack",
            ClassArms::new(vec!["flashloan_sandwich_attack", "execute_sandwich_attack"]),
        );

        load_weights_from_disk(&params.weights_path, &mut classes);

        Self {
            classes: Mutex::new(classes),
            params,
            total_executions: AtomicU64::new(0),
            updates_since_save: Mutex::new(0),
            last_saved_json: Mutex::new(None),
        }
    }

    /// With probability `exploration_rate`, uniform random; otherwise a
    /// softmax draw over `weights - max(weights)`.
    pub async fn select(&self, class: StrategyClass) -> &'static str {
        let classes = self.classes.lock().await;
        let arms = classes
            .get(class_name(class))
            .expect("every StrategyClass variant is registered at construction");

        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < self.params.exploration_rate {
            return arms.names[rng.gen_range(0..arms.names.len())];
        }

        let probs = softmax_probs(&arms.weights);
        let mut draw: f64 = rng.gen();
        for (i, p) in probs.iter().enumerate() {
            if draw < *p {
                return arms.names[i];
            }
            draw -= p;
        }
        arms.names[arms.names.len() - 1]
    }

    /// Selects an arm, runs it via the caller-supplied closure (wall time
    /// and success/profit measured around the call), and feeds the outcome
    /// back into `update_after_run`.
    pub async fn execute_best<F, Fut>(&self, class: StrategyClass, run: F) -> ExecutionOutcome
    where
        F: FnOnce(&'static str) -> Fut,
        Fut: std::future::Future<Output = Result<f64, String>>,
    {
        let arm = self.select(class).await;
        let start = Instant::now();
        let result = run(arm).await;
        let exec_time_s = start.elapsed().as_secs_f64();

        let (success, profit_eth) = match result {
            Ok(profit) => (true, profit),
            Err(_) => (false, 0.0),
        };

        self.update_after_run(class, arm, success, profit_eth, exec_time_s).await;

        ExecutionOutcome {
            arm,
            success,
            profit_eth,
            exec_time_s,
        }
    }

    pub async fn update_after_run(
        &self,
        class: StrategyClass,
        arm: &'static str,
        success: bool,
        profit_eth: f64,
        exec_time_s: f64,
    ) {
        let reward = reward_for(success, profit_eth, exec_time_s);
        let total = self.total_executions.fetch_add(1, Ordering::SeqCst) + 1;
        let lr = self.params.base_learning_rate / (1.0 + 0.001 * total as f64);

        {
            let mut classes = self.classes.lock().await;
            if let Some(arms) = classes.get_mut(class_name(class)) {
                if let Some(idx) = arms.names.iter().position(|n| *n == arm) {
                    arms.weights[idx] = (arms.weights[idx] + lr * reward)
                        .clamp(self.params.min_weight, self.params.max_weight);

                    let m = &mut arms.metrics[idx];
                    m.total += 1;
                    if success {
                        m.successes += 1;
                    } else {
                        m.failures += 1;
                    }
                    m.profit_sum_eth += profit_eth;
                    m.avg_exec_time_s = m.avg_exec_time_s * self.params.decay_factor
                        + exec_time_s * (1.0 - self.params.decay_factor);
                }
            }
        }

        let mut updates = self.updates_since_save.lock().await;
        *updates += 1;
        if *updates >= self.params.save_interval {
            *updates = 0;
            drop(updates);
            self.save_weights().await;
        }
    }

    pub async fn metrics(&self, class: StrategyClass, arm: &str) -> Option<StrategyMetrics> {
        let classes = self.classes.lock().await;
        let arms = classes.get(class_name(class))?;
        let idx = arms.names.iter().position(|n| *n == arm)?;
        Some(arms.metrics[idx].clone())
    }

    /// Registry non-empty and every class has at least one arm.
    /// The bandit's contribution to ChainWorker's overall health surface.
    pub async fn is_healthy(&self) -> bool {
        let classes = self.classes.lock().await;
        !classes.is_empty() && classes.values().all(|c| !c.names.is_empty())
    }

    /// Writes `weights_path` only if the serialized form changed since the
    /// last save, keeping repeated no-op saves byte-identical to a no-op.
    pub async fn save_weights(&self) {
        let snapshot: BTreeMap<String, Vec<f64>> = {
            let classes = self.classes.lock().await;
            classes
                .iter()
                .map(|(name, arms)| (name.to_string(), arms.weights.clone()))
                .collect()
        };

        let json = match serde_json::to_string_pretty(&snapshot) {
            Ok(j) => j,
            Err(e) => {
                warn!("failed to serialize strategy weights: {:?}", e);
                return;
            }
        };

        let mut last = self.last_saved_json.lock().await;
        if last.as_deref() == Some(json.as_str()) {
            return;
        }

        if let Err(e) = tokio::fs::write(&self.params.weights_path, &json).await {
            warn!("failed to persist strategy weights to disk: {:?}", e);
            return;
        }
        *last = Some(json);
    }
}

/// `softmax(weights - max(weights))`, stabilized against overflow.
fn softmax_probs(weights: &[f64]) -> Vec<f64> {
    let max_w = weights.iter().cloned().fold(f64::MIN, f64::max);
    let exps: Vec<f64> = weights.iter().map(|w| (w - max_w).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

fn reward_for(success: bool, profit_eth: f64, exec_time_s: f64) -> f64 {
    (if success { profit_eth } else { -0.05 }) - 0.01 * exec_time_s
}

/// Tolerates a missing or malformed file; ignores any class whose loaded
/// vector length no longer matches the registered arm count, keeping the
/// default `1.0` weights for that class instead.
fn load_weights_from_disk(path: &std::path::Path, classes: &mut HashMap<&'static str, ClassArms>) {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return,
    };
    let parsed: BTreeMap<String, Vec<f64>> = match serde_json::from_str(&contents) {
        Ok(p) => p,
        Err(_) => return,
    };

    for (name, arms) in classes.iter_mut() {
        if let Some(loaded) = parsed.get(*name) {
            if loaded.len() == arms.weights.len() {
                arms.weights = loaded.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax_probs(&[1.0, 2.0, 3.0]);
        let sum: f64 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn softmax_favors_higher_weight() {
        let probs = softmax_probs(&[1.0, 5.0]);
        assert!(probs[1] > probs[0]);
    }

    #[test]
    fn reward_penalizes_failure_and_exec_time() {
        let success_reward = reward_for(true, 0.05, 2.0);
        let failure_reward = reward_for(false, 0.05, 2.0);
        assert!((success_reward - (0.05 - 0.02)).abs() < 1e-9);
        assert!((failure_reward - (-0.05 - 0.02)).abs() < 1e-9);
        assert!(success_reward > failure_reward);
    }

    #[test]
    fn weight_clamp_respects_bounds() {
        let min = 0.10;
        let max = 10.0;
        assert_eq!((-5.0_f64).clamp(min, max), min);
        assert_eq!((50.0_f64).clamp(min, max), max);
        assert_eq!((1.0_f64).clamp(min, max), 1.0);
    }

    #[test]
    fn default_registry_matches_spec_census() {
        let params = StrategySelectorParams {
            exploration_rate: 0.10,
            base_learning_rate: 0.01,
            decay_factor: 0.95,
            min_weight: 0.10,
            max_weight: 10.0,
            save_interval: 25,
            weights_path: PathBuf::from("/nonexistent/strategy_weights.json"),
        };
        let selector = StrategySelector::new(params);
        let classes = selector.classes.blocking_lock();
        assert_eq!(classes.get("eth_transaction").unwrap().names.len(), 1);
        assert_eq!(classes.get("front_run").unwrap().names.len(), 5);
        assert_eq!(classes.get("back_run").unwrap().names.len(), 4);
        assert_eq!(classes.get("sandwich_attack").unwrap().names.len(), 2);
    }

    #[test]
    fn load_weights_ignores_length_mismatch() {
        let mut classes = HashMap::new();
        classes.insert("front_run", ClassArms::new(vec!["a", "b", "c"]));

        let dir = std::env::temp_dir().join(format!("strategy_weights_test_{:p}.json", &classes));
        std::fs::write(&dir, r#"{"front_run": [1.0, 2.0]}"#).unwrap();

        load_weights_from_disk(&dir, &mut classes);
        assert_eq!(classes.get("front_run").unwrap().weights, vec![1.0, 1.0, 1.0]);

        std::fs::remove_file(&dir).ok();
    }
}
