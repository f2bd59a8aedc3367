//! Pending-transaction discovery, dedup, and bounded-parallelism dispatch.
//! Grounded on the teacher's `CombinedWatcher` (`watcher.rs`: `tokio::select!`
//! fan-in of multiple streams into one channel) generalized to the original
//! system's `TxpoolMonitor` (`txpool_monitor.py`: three discovery strategies
//! tried in priority order, `processed_hashes` dedup, a semaphore-bounded
//! `analyse` dispatcher).

use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use ethers::prelude::*;
use ethers::types::{Address, Transaction, TxHash};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::rpc::WsClient;
use crate::safety::{SafetyEngine, TxSafetyProbe};

#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("no pending-transaction discovery strategy available on this node")]
    NoDiscoveryStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyClass {
    EthTransaction,
    FrontRun,
    BackRun,
    SandwichAttack,
}

#[derive(Debug, Clone)]
pub struct Opportunity {
    pub tx_hash: TxHash,
    pub target: Transaction,
    pub strategy_class: StrategyClass,
    pub safety_percent: f64,
}

/// Consults the SafetyEngine and turns a pending transaction into an
/// `Opportunity`, or nothing. Kept as a standalone type so a source other
/// than MempoolScanner's own discovery (e.g. a simulated-replay feed) can
/// reuse the same contract.
pub struct OpportunityAnalyzer {
    safety: Arc<SafetyEngine>,
    monitored: Vec<Address>,
}

impl OpportunityAnalyzer {
    pub fn new(safety: Arc<SafetyEngine>, monitored: Vec<Address>) -> Self {
        Self { safety, monitored }
    }

    /// `to` must be in the monitored set and `value > 0`; the tx must then
    /// pass the full six-check safety report with `profit_check` included.
    pub async fn analyse(&self, hash: TxHash, tx: Transaction) -> Option<Opportunity> {
        let to = tx.to?;
        if !self.monitored.contains(&to) || tx.value.is_zero() {
            return None;
        }

        let probe = TxSafetyProbe {
            tx_hash: Some(hash),
            from: tx.from,
            gas_price_gwei: tx.gas_price.map(|p| p.as_u128() as f64 / 1e9).unwrap_or(0.0),
            gas_used: tx.gas.as_u64(),
            value_wei: tx.value,
            input_token: Some(to),
            output_token: Some(to),
            amount_in_wei: tx.value,
            amount_out_wei: tx.value,
        };

        let (is_safe, report) = self.safety.check_transaction_safety(&probe).await;
        let profit_ok = report.detail("profit_check").map(|d| d.passed).unwrap_or(false);
        if !is_safe || !profit_ok {
            return None;
        }

        Some(Opportunity {
            tx_hash: hash,
            target: tx,
            strategy_class: StrategyClass::FrontRun,
            safety_percent: report.safety_percent,
        })
    }
}

#[derive(Debug, Clone)]
struct PriorityEntry {
    key: i128,
    hash: TxHash,
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for PriorityEntry {}
impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PriorityEntry {
    // BinaryHeap is a max-heap; inverting the comparison makes the lowest
    // key (= highest gas price) pop first, matching "-max(gas_price, max_fee)".
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.key.cmp(&self.key)
    }
}

fn priority_key(tx: &Transaction) -> i128 {
    let gas_price = tx.gas_price.map(|p| p.as_u128()).unwrap_or(0);
    let max_fee = tx.max_fee_per_gas.map(|p| p.as_u128()).unwrap_or(0);
    -(gas_price.max(max_fee) as i128)
}

pub struct MempoolScanner {
    client: Arc<WsClient>,
    analyzer: OpportunityAnalyzer,
    processed_hashes: DashSet<TxHash>,
    processed_order: Mutex<VecDeque<TxHash>>,
    processed_cap: usize,
    priority_queue: Mutex<BinaryHeap<PriorityEntry>>,
    poll_interval: Duration,
    max_parallel: usize,
    opportunity_tx: mpsc::Sender<Opportunity>,
}

impl MempoolScanner {
    pub fn new(
        client: Arc<WsClient>,
        safety: Arc<SafetyEngine>,
        monitored: Vec<Address>,
        poll_interval: Duration,
        max_parallel: usize,
        processed_cap: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Opportunity>) {
        let (opportunity_tx, opportunity_rx) = mpsc::channel(1000);
        let scanner = Arc::new(Self {
            client,
            analyzer: OpportunityAnalyzer::new(safety, monitored),
            processed_hashes: DashSet::new(),
            processed_order: Mutex::new(VecDeque::new()),
            processed_cap,
            priority_queue: Mutex::new(BinaryHeap::new()),
            poll_interval,
            max_parallel,
            opportunity_tx,
        });
        (scanner, opportunity_rx)
    }

    pub fn start(self: &Arc<Self>) {
        let scanner = Arc::clone(self);
        tokio::spawn(async move {
            scanner.run().await;
        });
    }

    /// Tries direct txpool polling, then a pending-tx filter subscription,
    /// then falls back to block polling, in that priority order. Each is
    /// tried only if the previous one's capability probe failed.
    async fn run(self: Arc<Self>) {
        let (hash_tx, mut hash_rx) = mpsc::unbounded_channel();

        if self.spawn_txpool_strategy(hash_tx.clone()).await.is_ok() {
            info!("mempool discovery: direct txpool polling");
        } else if self.spawn_pending_filter_strategy(hash_tx.clone()).await.is_ok() {
            info!("mempool discovery: pending-tx filter subscription");
        } else {
            info!("mempool discovery: block-polling fallback");
            self.spawn_block_polling_strategy(hash_tx.clone());
        }
        drop(hash_tx);

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        while let Some(hash) = hash_rx.recv().await {
            if !self.mark_seen(hash).await {
                continue;
            }
            let permit = Arc::clone(&semaphore);
            let scanner = self.clone();
            tokio::spawn(async move {
                let _permit = permit.acquire().await;
                scanner.analyse(hash).await;
            });
        }
    }

    async fn spawn_txpool_strategy(&self, tx: mpsc::UnboundedSender<TxHash>) -> Result<(), ScannerError> {
        if self.client.txpool_content().await.is_err() {
            return Err(ScannerError::NoDiscoveryStrategy);
        }

        let client = Arc::clone(&self.client);
        let interval = self.poll_interval;
        tokio::spawn(async move {
            loop {
                match client.txpool_content().await {
                    Ok(content) => {
                        for by_nonce in content.pending.values() {
                            for t in by_nonce.values() {
                                if tx.send(t.hash).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => warn!("txpool_content poll failed: {:?}", e),
                }
                sleep(interval).await;
            }
        });

        Ok(())
    }

    async fn spawn_pending_filter_strategy(&self, tx: mpsc::UnboundedSender<TxHash>) -> Result<(), ScannerError> {
        let mut stream = match self.client.watch_pending_transactions().await {
            Ok(s) => s,
            Err(_) => return Err(ScannerError::NoDiscoveryStrategy),
        };

        tokio::spawn(async move {
            while let Some(hash) = stream.next().await {
                if tx.send(hash).is_err() {
                    break;
                }
            }
        });

        Ok(())
    }

    fn spawn_block_polling_strategy(self: &Arc<Self>, tx: mpsc::UnboundedSender<TxHash>) {
        let client = Arc::clone(&self.client);
        let interval = self.poll_interval;
        tokio::spawn(async move {
            let mut last_block = client.get_block_number().await.map(|n| n.as_u64()).unwrap_or(0);
            loop {
                sleep(interval).await;
                let current = match client.get_block_number().await {
                    Ok(n) => n.as_u64(),
                    Err(_) => continue,
                };
                for num in (last_block + 1)..=current {
                    if let Ok(Some(block)) = client.get_block_with_txs(num).await {
                        for t in block.transactions {
                            if tx.send(t.hash).is_err() {
                                return;
                            }
                        }
                    }
                }
                last_block = current;
            }
        });
    }

    /// `processed_hashes` membership check plus insertion-order bookkeeping
    /// for the cap-based truncation below. Returns `false` for a hash seen
    /// before (the caller should drop it silently).
    async fn mark_seen(&self, hash: TxHash) -> bool {
        if !self.processed_hashes.insert(hash) {
            return false;
        }
        let mut order = self.processed_order.lock().await;
        order.push_back(hash);
        while order.len() > self.processed_cap {
            if let Some(old) = order.pop_front() {
                self.processed_hashes.remove(&old);
            }
        }
        true
    }

    /// Bulk eviction for sustained memory pressure. Clears the whole dedup
    /// set instead of evicting entry-by-entry.
    pub async fn purge_processed(&self) {
        self.processed_hashes.clear();
        self.processed_order.lock().await.clear();
    }

    async fn analyse(&self, hash: TxHash) {
        let tx = match self.fetch_transaction(hash).await {
            Some(tx) => tx,
            None => return,
        };

        {
            let mut queue = self.priority_queue.lock().await;
            queue.push(PriorityEntry {
                key: priority_key(&tx),
                hash,
            });
        }

        if let Some(opportunity) = self.analyzer.analyse(hash, tx).await {
            if self.opportunity_tx.send(opportunity).await.is_err() {
                warn!("opportunity channel closed, dropping {:?}", hash);
            }
        }
    }

    /// Second consumer interface ordered by `-gas_price`, for callers that
    /// want to rank rather than consume opportunities as they complete.
    pub async fn pop_priority(&self) -> Option<TxHash> {
        self.priority_queue.lock().await.pop().map(|e| e.hash)
    }

    /// `get_transaction` first; if the node hasn't indexed a strictly-pending
    /// hash yet, falls back to a raw `eth_getTransactionByHash` request, with
    /// a multiplicative (not power-of-two) backoff between attempts.
    async fn fetch_transaction(&self, hash: TxHash) -> Option<Transaction> {
        let mut delay = Duration::from_millis(200);
        for _ in 0..3 {
            if let Ok(Some(tx)) = self.client.get_transaction(hash).await {
                return Some(tx);
            }
            if let Ok(Some(tx)) = self
                .client
                .request::<_, Option<Transaction>>("eth_getTransactionByHash", [hash])
                .await
            {
                return Some(tx);
            }
            sleep(delay).await;
            delay = delay.mul_f64(1.7);
        }
        debug!("failed to fetch transaction {:?} after retries", hash);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn tx_with_gas(gas_price: Option<u64>, max_fee: Option<u64>) -> Transaction {
        Transaction {
            gas_price: gas_price.map(U256::from),
            max_fee_per_gas: max_fee.map(U256::from),
            ..Default::default()
        }
    }

    #[test]
    fn priority_key_favors_higher_gas() {
        let cheap = priority_key(&tx_with_gas(Some(10), None));
        let expensive = priority_key(&tx_with_gas(Some(50), None));
        // lower key = higher priority, so the expensive tx's key is smaller.
        assert!(expensive < cheap);
    }

    #[test]
    fn priority_queue_orders_highest_gas_first() {
        let mut heap = BinaryHeap::new();
        heap.push(PriorityEntry { key: priority_key(&tx_with_gas(Some(10), None)), hash: TxHash::zero() });
        heap.push(PriorityEntry { key: priority_key(&tx_with_gas(Some(90), None)), hash: TxHash::repeat_byte(1) });
        heap.push(PriorityEntry { key: priority_key(&tx_with_gas(Some(50), None)), hash: TxHash::repeat_byte(2) });

        assert_eq!(heap.pop().unwrap().hash, TxHash::repeat_byte(1));
        assert_eq!(heap.pop().unwrap().hash, TxHash::repeat_byte(2));
        assert_eq!(heap.pop().unwrap().hash, TxHash::zero());
    }

    #[tokio::test]
    async fn mark_seen_rejects_duplicate_and_truncates_by_cap() {
        let hashes = DashSet::new();
        let order: Mutex<VecDeque<TxHash>> = Mutex::new(VecDeque::new());
        let cap = 2usize;

        async fn mark(hashes: &DashSet<TxHash>, order: &Mutex<VecDeque<TxHash>>, cap: usize, hash: TxHash) -> bool {
            if !hashes.insert(hash) {
                return false;
            }
            let mut o = order.lock().await;
            o.push_back(hash);
            while o.len() > cap {
                if let Some(old) = o.pop_front() {
                    hashes.remove(&old);
                }
            }
            true
        }

        let h1 = TxHash::repeat_byte(1);
        let h2 = TxHash::repeat_byte(2);
        let h3 = TxHash::repeat_byte(3);

        assert!(mark(&hashes, &order, cap, h1).await);
        assert!(!mark(&hashes, &order, cap, h1).await);
        assert!(mark(&hashes, &order, cap, h2).await);
        assert!(mark(&hashes, &order, cap, h3).await);

        assert_eq!(hashes.len(), 2);
        assert!(!hashes.contains(&h1));
    }
}
