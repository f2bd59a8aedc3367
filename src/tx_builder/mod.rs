//! Build, sign, and dispatch transactions: nonce-and-gas retry loop with
//! mutual-exclusivity enforcement between legacy and EIP-1559 gas fields,
//! plus the strategy-wrapper functions StrategySelector dispatches through.
//! Grounded on the teacher's `Executor` (`executor/mod.rs`: resubmission
//! loop, nonce-error handling, gas-buffer math) generalized with the
//! original system's `TransactionCore` (`_bump_gas`, `execute_sandwich_attack`,
//! `transfer_profit_to_account`, flash-loan wrapping).

use std::sync::Arc;
use std::time::Duration;

use ethers::prelude::*;
use ethers::providers::ProviderError;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, H256, U256};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::gas_oracle::GasOracle;
use crate::nonce::{NonceError, NonceRegistry};
use crate::rpc::WsClient;

const GAS_RETRY_BUMP: f64 = 1.15;
const GAS_BUFFER: f64 = 1.1;

abigen!(
    FlashLoanHelper,
    r#"[
        function withdrawETH() external
    ]"#
);

abigen!(
    Erc20Transfer,
    r#"[
        function transfer(address to, uint256 amount) external returns (bool)
        event Transfer(address indexed from, address indexed to, uint256 value)
    ]"#
);

#[derive(Debug, Error)]
pub enum TxBuilderError {
    #[error("nonce allocation failed: {0}")]
    Nonce(#[from] NonceError),
    #[error("simulation reverted: {0}")]
    SimulationReverted(String),
    #[error("gas price {0} gwei exceeds cap {1} gwei")]
    GasCapExceeded(f64, f64),
    #[error("submit failed after {0} retries: {1}")]
    SubmitFailed(u32, String),
    #[error("rpc error: {0}")]
    Rpc(#[from] ProviderError),
}

/// Draft request for a send; `build` fills in gas, nonce, and chain id.
/// `gas_multiplier`, when set, is applied on the first build and then
/// consumed. Later bumps during `execute`'s retry loop always use
/// `GAS_RETRY_BUMP`.
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_multiplier: Option<f64>,
}

impl TxRequest {
    pub fn new(to: Address, value: U256, data: Bytes) -> Self {
        Self {
            to,
            value,
            data,
            gas_multiplier: None,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.gas_multiplier = Some(multiplier);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandwichProfile {
    Default,
    Aggressive,
    Safe,
}

impl SandwichProfile {
    fn multipliers(self) -> (f64, f64) {
        match self {
            SandwichProfile::Default => (1.15, 0.90),
            SandwichProfile::Aggressive => (1.25, 0.95),
            SandwichProfile::Safe => (1.10, 0.85),
        }
    }
}

pub struct TxBuilder {
    client: Arc<WsClient>,
    wallet: LocalWallet,
    nonce_registry: Arc<NonceRegistry>,
    gas_oracle: Arc<GasOracle>,
    chain_id: u64,
    max_gas_price_gwei: f64,
    default_gas_limit: u64,
    mempool_max_retries: u32,
    mempool_retry_delay: Duration,
    /// Running receipt-confirmed profit total, in ether. Mirrors the
    /// original system's `TransactionCore.current_profit`, which
    /// `StrategySelector.execute_best` diffs across a strategy call to
    /// derive the reward signal.
    current_profit_eth: tokio::sync::Mutex<f64>,
}

impl TxBuilder {
    pub fn new(
        client: Arc<WsClient>,
        wallet: LocalWallet,
        nonce_registry: Arc<NonceRegistry>,
        gas_oracle: Arc<GasOracle>,
        chain_id: u64,
        max_gas_price_gwei: f64,
        default_gas_limit: u64,
        mempool_max_retries: u32,
        mempool_retry_delay: Duration,
    ) -> Self {
        Self {
            client,
            wallet,
            nonce_registry,
            gas_oracle,
            chain_id,
            max_gas_price_gwei,
            default_gas_limit,
            mempool_max_retries,
            mempool_retry_delay,
            current_profit_eth: tokio::sync::Mutex::new(0.0),
        }
    }

    pub fn account(&self) -> Address {
        self.wallet.address()
    }

    /// Decides EIP-1559 vs legacy from the latest block's `base_fee_per_gas`
    /// presence, allocates a nonce, estimates gas, and returns a fresh
    /// `TypedTransaction` carrying exactly the correct gas field(s), never
    /// all three at once.
    pub async fn build(&self, req: &TxRequest) -> Result<TypedTransaction, TxBuilderError> {
        let nonce = self.nonce_registry.next_nonce(self.account()).await?;
        let block = self
            .client
            .get_block(BlockNumber::Latest)
            .await?
            .ok_or_else(|| TxBuilderError::Rpc(ProviderError::CustomError("no latest block".into())))?;

        let multiplier = req.gas_multiplier.unwrap_or(1.0);

        let mut tx = if let Some(base_fee) = block.base_fee_per_gas {
            let priority = self
                .client
                .request::<_, U256>("eth_maxPriorityFeePerGas", ())
                .await
                .unwrap_or_else(|_| U256::from(2_000_000_000u64));

            TypedTransaction::Eip1559(Eip1559TransactionRequest {
                to: Some(req.to.into()),
                value: Some(req.value),
                data: Some(req.data.clone()),
                nonce: Some(nonce.into()),
                max_fee_per_gas: Some(apply_multiplier(base_fee * 2, multiplier)),
                max_priority_fee_per_gas: Some(apply_multiplier(priority, multiplier)),
                chain_id: Some(self.chain_id.into()),
                ..Default::default()
            })
        } else {
            let oracle_gwei = self.gas_oracle.dynamic_gas_price().await;
            TypedTransaction::Legacy(TransactionRequest {
                to: Some(req.to.into()),
                value: Some(req.value),
                data: Some(req.data.clone()),
                nonce: Some(nonce.into()),
                gas_price: Some(apply_multiplier(gwei_to_wei(oracle_gwei), multiplier)),
                chain_id: Some(self.chain_id.into()),
                ..Default::default()
            })
        };

        let estimate = self
            .client
            .estimate_gas(&tx, None)
            .await
            .unwrap_or_else(|_| U256::from(self.default_gas_limit));
        let buffered = (estimate.as_u128() as f64 * GAS_BUFFER) as u64;
        tx.set_gas(U256::from(buffered.max(self.default_gas_limit)));

        Ok(tx)
    }

    /// Deterministic secp256k1 signature over the canonicalized fields.
    /// `ethers` already excludes unset fields from the signing payload, so
    /// no separate stripping step is needed beyond `build`'s own
    /// exclusivity guarantee.
    pub async fn sign(&self, tx: &TypedTransaction) -> Result<Bytes, TxBuilderError> {
        let sig = self
            .wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| TxBuilderError::SubmitFailed(0, format!("signing failed: {:?}", e)))?;
        Ok(tx.rlp_signed(&sig))
    }

    /// Simulate via `eth_call` against `pending`, then sign/submit/retry
    /// with a gas bump between attempts, aborting if the bumped price would
    /// exceed `max_gas_price_gwei`. Spawns nonce tracking on success.
    pub async fn execute(self: &Arc<Self>, mut tx: TypedTransaction) -> Result<H256, TxBuilderError> {
        if let Err(e) = self
            .client
            .call(&tx, Some(BlockId::Number(BlockNumber::Pending)))
            .await
        {
            return Err(TxBuilderError::SimulationReverted(format!("{:?}", e)));
        }

        let nonce = tx.nonce().copied().unwrap_or_default();
        let mut attempt = 0u32;

        loop {
            let gas_gwei = current_gas_gwei(&tx);
            if gas_gwei > self.max_gas_price_gwei {
                return Err(TxBuilderError::GasCapExceeded(gas_gwei, self.max_gas_price_gwei));
            }

            let raw = self.sign(&tx).await?;
            match self.client.send_raw_transaction(raw).await {
                Ok(pending) => {
                    let hash = pending.tx_hash();
                    info!(tx_hash = %format!("{:?}", hash), "transaction submitted");
                    self.nonce_registry.track(hash, nonce.as_u64(), self.account());
                    return Ok(hash);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.mempool_max_retries {
                        return Err(TxBuilderError::SubmitFailed(attempt, format!("{:?}", e)));
                    }
                    warn!("submit attempt {} failed: {:?}; bumping gas", attempt, e);
                    sleep(self.mempool_retry_delay).await;
                    bump_gas(&mut tx, GAS_RETRY_BUMP);
                }
            }
        }
    }

    pub async fn front_run(self: &Arc<Self>, req: TxRequest) -> Result<H256, TxBuilderError> {
        let tx = self.build(&req).await?;
        self.execute(tx).await
    }

    pub async fn back_run(self: &Arc<Self>, req: TxRequest) -> Result<H256, TxBuilderError> {
        let tx = self.build(&req).await?;
        self.execute(tx).await
    }

    pub async fn aggressive_front_run(self: &Arc<Self>, req: TxRequest) -> Result<H256, TxBuilderError> {
        self.front_run(req.with_multiplier(1.30)).await
    }

    pub async fn volatility_front_run(self: &Arc<Self>, req: TxRequest) -> Result<H256, TxBuilderError> {
        self.front_run(req.with_multiplier(1.50)).await
    }

    pub async fn price_dip_back_run(self: &Arc<Self>, req: TxRequest) -> Result<H256, TxBuilderError> {
        self.back_run(req.with_multiplier(0.80)).await
    }

    pub async fn high_volume_back_run(self: &Arc<Self>, req: TxRequest) -> Result<H256, TxBuilderError> {
        self.back_run(req.with_multiplier(0.85)).await
    }

    /// Runs the simulation gate before building rather than leaning solely
    /// on `execute`'s own simulate-first step, so a doomed send never even
    /// allocates a nonce.
    pub async fn predictive_front_run(self: &Arc<Self>, req: TxRequest) -> Result<H256, TxBuilderError> {
        let tx = self.build(&req).await?;
        if self
            .client
            .call(&tx, Some(BlockId::Number(BlockNumber::Pending)))
            .await
            .is_err()
        {
            return Err(TxBuilderError::SimulationReverted("predictive pre-check failed".into()));
        }
        self.execute(tx).await
    }

    /// Builds front/back legs with the profile's multiplier pair and
    /// dispatches the back leg one second after the front.
    pub async fn execute_sandwich_attack(
        self: &Arc<Self>,
        front_req: TxRequest,
        back_req: TxRequest,
        profile: SandwichProfile,
    ) -> Result<(H256, H256), TxBuilderError> {
        let (front_mult, back_mult) = profile.multipliers();

        let front_tx = self.build(&front_req.with_multiplier(front_mult)).await?;
        let front_hash = self.execute(front_tx).await?;

        sleep(Duration::from_secs(1)).await;

        let back_tx = self.build(&back_req.with_multiplier(back_mult)).await?;
        let back_hash = self.execute(back_tx).await?;

        Ok((front_hash, back_hash))
    }

    /// Submits the flash-loan helper's `withdrawETH()` as a real transaction
    /// through the same build/execute pipeline as every other send, not a
    /// read-only `eth_call` simulation. The helper actually moves
    /// accumulated balance; it doesn't just report a value.
    async fn withdraw_eth(self: &Arc<Self>, helper: Address) -> Result<H256, TxBuilderError> {
        let contract = FlashLoanHelper::new(helper, self.client.clone());
        let calldata = contract.withdraw_eth().tx.data().cloned().unwrap_or_default();

        let req = TxRequest::new(helper, U256::zero(), calldata);
        let tx = self.build(&req).await?;
        self.execute(tx).await
    }

    pub async fn flashloan_front_run(
        self: &Arc<Self>,
        helper: Address,
        req: TxRequest,
    ) -> Result<H256, TxBuilderError> {
        self.withdraw_eth(helper).await?;
        self.front_run(req).await
    }

    pub async fn flashloan_back_run(
        self: &Arc<Self>,
        helper: Address,
        req: TxRequest,
    ) -> Result<H256, TxBuilderError> {
        self.withdraw_eth(helper).await?;
        self.back_run(req).await
    }

    pub async fn flashloan_sandwich_attack(
        self: &Arc<Self>,
        helper: Address,
        front_req: TxRequest,
        back_req: TxRequest,
        profile: SandwichProfile,
    ) -> Result<(H256, H256), TxBuilderError> {
        self.withdraw_eth(helper).await?;
        self.execute_sandwich_attack(front_req, back_req, profile).await
    }

    /// Submits each request in order. Caller pre-assigns distinct
    /// consecutive nonces by calling `build` sequentially before invoking
    /// this. The builder never reorders or batches the sends.
    pub async fn bundle(self: &Arc<Self>, txs: Vec<TypedTransaction>) -> Vec<Result<H256, TxBuilderError>> {
        let mut results = Vec::with_capacity(txs.len());
        for tx in txs {
            results.push(self.execute(tx).await);
        }
        results
    }

    /// Awaits receipts in submission order, logging reverts.
    pub async fn execute_bundle(&self, hashes: &[H256]) {
        for hash in hashes {
            match self.client.get_transaction_receipt(*hash).await {
                Ok(Some(receipt)) => match receipt.status.map(|s| s.as_u64()) {
                    Some(1) => debug!("bundle tx {:?} confirmed", hash),
                    _ => warn!("bundle tx {:?} reverted", hash),
                },
                _ => warn!("bundle tx {:?} receipt unavailable", hash),
            }
        }
    }

    /// Self-transfer of value 0 at the same nonce and 1.5x the current gas
    /// price, to preempt a stuck send.
    pub async fn cancel(self: &Arc<Self>, nonce: u64) -> Result<H256, TxBuilderError> {
        let gas_gwei = self.gas_oracle.dynamic_gas_price().await;

        let tx = TypedTransaction::Legacy(TransactionRequest {
            to: Some(self.account().into()),
            value: Some(U256::zero()),
            nonce: Some(nonce.into()),
            gas_price: Some(gwei_to_wei(gas_gwei * 1.5)),
            chain_id: Some(self.chain_id.into()),
            ..Default::default()
        });

        self.execute(tx).await
    }

    /// Submits an ERC-20 transfer and, on a confirmed receipt, returns the
    /// on-chain `Transfer` amount; falls back to the requested amount if the
    /// event can't be decoded or the receipt never arrives.
    pub async fn transfer_profit(
        self: &Arc<Self>,
        token: Address,
        amount: U256,
        target: Address,
    ) -> Result<U256, TxBuilderError> {
        let contract = Erc20Transfer::new(token, self.client.clone());
        let call = contract.transfer(target, amount);
        let calldata = call.tx.data().cloned().unwrap_or_default();

        let req = TxRequest::new(token, U256::zero(), calldata);
        let tx = self.build(&req).await?;
        let hash = self.execute(tx).await?;

        let credited = match self.client.get_transaction_receipt(hash).await {
            Ok(Some(receipt)) if receipt.status.map(|s| s.as_u64()) == Some(1) => {
                let mut decoded_amount = amount;
                for log in &receipt.logs {
                    if let Ok(decoded) = ethers::contract::parse_log::<TransferFilter>(log.clone()) {
                        decoded_amount = decoded.value;
                        break;
                    }
                }
                decoded_amount
            }
            _ => amount,
        };

        *self.current_profit_eth.lock().await += wei_to_eth(credited);
        Ok(credited)
    }

    /// Snapshot of the receipt-confirmed running profit total, in ether.
    /// `StrategySelector.execute_best` diffs this across a strategy call to
    /// derive its reward signal.
    pub async fn current_profit_eth(&self) -> f64 {
        *self.current_profit_eth.lock().await
    }
}

fn current_gas_gwei(tx: &TypedTransaction) -> f64 {
    match tx {
        TypedTransaction::Eip1559(t) => t.max_fee_per_gas.map(wei_to_gwei).unwrap_or(0.0),
        TypedTransaction::Legacy(t) => t.gas_price.map(wei_to_gwei).unwrap_or(0.0),
        TypedTransaction::Eip2930(t) => t.tx.gas_price.map(wei_to_gwei).unwrap_or(0.0),
    }
}

/// Bumps whichever gas field(s) the transaction actually carries. Never
/// introduces a `gas_price` key onto an EIP-1559 tx or vice versa.
fn bump_gas(tx: &mut TypedTransaction, multiplier: f64) {
    match tx {
        TypedTransaction::Eip1559(t) => {
            t.max_fee_per_gas = t.max_fee_per_gas.map(|v| apply_multiplier(v, multiplier));
            t.max_priority_fee_per_gas = t
                .max_priority_fee_per_gas
                .map(|v| apply_multiplier(v, multiplier));
        }
        TypedTransaction::Legacy(t) => {
            t.gas_price = t.gas_price.map(|v| apply_multiplier(v, multiplier));
        }
        TypedTransaction::Eip2930(t) => {
            t.tx.gas_price = t.tx.gas_price.map(|v| apply_multiplier(v, multiplier));
        }
    }
}

fn wei_to_gwei(wei: U256) -> f64 {
    wei.as_u128() as f64 / 1e9
}

fn wei_to_eth(wei: U256) -> f64 {
    wei.as_u128() as f64 / 1e18
}

fn gwei_to_wei(gwei: f64) -> U256 {
    U256::from((gwei.max(0.0) * 1e9) as u128)
}

fn apply_multiplier(wei: U256, multiplier: f64) -> U256 {
    U256::from((wei.as_u128() as f64 * multiplier).max(0.0) as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_multiplier_scales_wei() {
        let base = U256::from(100u64);
        assert_eq!(apply_multiplier(base, 1.15), U256::from(115u64));
    }

    #[test]
    fn bump_gas_touches_only_legacy_field() {
        let mut tx = TypedTransaction::Legacy(TransactionRequest {
            gas_price: Some(U256::from(100u64)),
            ..Default::default()
        });
        bump_gas(&mut tx, 1.15);
        match tx {
            TypedTransaction::Legacy(t) => assert_eq!(t.gas_price, Some(U256::from(115u64))),
            _ => panic!("expected legacy"),
        }
    }

    #[test]
    fn bump_gas_touches_both_eip1559_fields() {
        let mut tx = TypedTransaction::Eip1559(Eip1559TransactionRequest {
            max_fee_per_gas: Some(U256::from(200u64)),
            max_priority_fee_per_gas: Some(U256::from(10u64)),
            ..Default::default()
        });
        bump_gas(&mut tx, 1.15);
        match tx {
            TypedTransaction::Eip1559(t) => {
                assert_eq!(t.max_fee_per_gas, Some(U256::from(230u64)));
                assert_eq!(t.max_priority_fee_per_gas, Some(U256::from(11u64)));
            }
            _ => panic!("expected eip1559"),
        }
    }

    #[test]
    fn sandwich_profile_multipliers_match_spec() {
        assert_eq!(SandwichProfile::Default.multipliers(), (1.15, 0.90));
        assert_eq!(SandwichProfile::Aggressive.multipliers(), (1.25, 0.95));
        assert_eq!(SandwichProfile::Safe.multipliers(), (1.10, 0.85));
    }

    #[test]
    fn gas_cap_boundary_is_strictly_greater_than() {
        let cap = 100.0;
        assert!(!(100.0 > cap));
        assert!(109.25 > cap);
    }
}
