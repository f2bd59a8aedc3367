//! Narrow interfaces to everything the core treats as external: price feeds,
//! alerting, transaction history, and ABI lookup. Production backends for
//! these (a SQL-backed store, an HTTP price aggregator, a TUI/API surface)
//! live outside this crate; only the seams and a couple of dependency-free
//! implementations live here.

use std::collections::HashMap;

use async_trait::async_trait;
use ethers::types::Address;
use tracing::{info, warn};

/// Severity attached to a `NotificationSink::notify` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Warn,
    Error,
    Critical,
}

/// One data point from `PriceOracle::price_history`.
#[derive(Debug, Clone, Copy)]
pub struct PricePoint {
    pub timestamp_secs: u64,
    pub price: f64,
}

/// Spot and historical price lookups for the tokens the engine trades.
/// Implemented by an external market-data aggregator; the core only ever
/// reads through this trait.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn real_time_price(&self, token_symbol_or_addr: &str, vs: &str) -> Option<f64>;
    async fn price_history(&self, token: &str, days: u32) -> Option<Vec<PricePoint>>;
}

/// Outbound alerting. A missing or unconfigured sink is always tolerated by
/// callers. Notification delivery never gates a safety decision.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, message: &str, level: NotifyLevel, details: Option<&str>);
}

/// One row of the transaction/profit event log the core emits; persistence
/// is owned by an external SQL-backed collaborator.
#[derive(Debug, Clone)]
pub enum TxEvent {
    Submitted { hash: String },
    Confirmed { hash: String, profit_wei: String },
    Failed { hash: String, reason: String },
    ProfitRecorded { amount_wei: String },
}

#[async_trait]
pub trait TxStore: Send + Sync {
    async fn record(&self, event: TxEvent);
}

/// Resolves a human-readable contract name to its ABI JSON, and a 4-byte
/// selector back to a function name, for diagnostics and calldata decoding.
pub trait ABIRegistry: Send + Sync {
    fn abi(&self, name: &str) -> Option<String>;
    fn selector(&self, four_byte_hex: &str) -> Option<String>;
}

/// `NotificationSink` over the Telegram Bot HTTP API, mirroring the teacher's
/// `Monitor::send_telegram`. Silently drops messages when unconfigured.
pub struct TelegramNotifier {
    bot_token: Option<String>,
    chat_id: Option<String>,
    http_client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: Option<String>, chat_id: Option<String>) -> Self {
        Self {
            bot_token,
            chat_id,
            http_client: reqwest::Client::new(),
        }
    }

    fn prefix(level: NotifyLevel) -> &'static str {
        match level {
            NotifyLevel::Info => "",
            NotifyLevel::Warn => "⚠️ ",
            NotifyLevel::Error => "❌ ",
            NotifyLevel::Critical => "🚨 CRITICAL: ",
        }
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn notify(&self, message: &str, level: NotifyLevel, details: Option<&str>) {
        let text = match details {
            Some(d) => format!("{}{}\n{}", Self::prefix(level), message, d),
            None => format!("{}{}", Self::prefix(level), message),
        };

        match level {
            NotifyLevel::Critical | NotifyLevel::Error => warn!("{}", text),
            _ => info!("{}", text),
        }

        let (Some(token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            return;
        };

        let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
        let params = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML"
        });

        if let Err(e) = self.http_client.post(&url).json(&params).send().await {
            warn!("failed to deliver Telegram notification: {:?}", e);
        }
    }
}

/// A `TxStore` that only logs; used when no SQL-backed collaborator is wired.
pub struct LoggingTxStore;

#[async_trait]
impl TxStore for LoggingTxStore {
    async fn record(&self, event: TxEvent) {
        info!("tx event: {:?}", event);
    }
}

/// A `PriceOracle` that always misses; lets `SafetyEngine::ensure_profit`
/// exercise its degenerate-case path when no real aggregator is configured.
pub struct NullPriceOracle;

#[async_trait]
impl PriceOracle for NullPriceOracle {
    async fn real_time_price(&self, _token_symbol_or_addr: &str, _vs: &str) -> Option<f64> {
        None
    }

    async fn price_history(&self, _token: &str, _days: u32) -> Option<Vec<PricePoint>> {
        None
    }
}

/// An in-memory `ABIRegistry` populated at construction; stands in for the
/// file-backed registry the full system loads ABIs from.
pub struct StaticABIRegistry {
    by_name: HashMap<String, String>,
    by_selector: HashMap<String, String>,
}

impl StaticABIRegistry {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            by_selector: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, abi_json: &str, selectors: &[(&str, &str)]) {
        self.by_name.insert(name.to_string(), abi_json.to_string());
        for (selector, fn_name) in selectors {
            self.by_selector
                .insert(selector.to_string(), fn_name.to_string());
        }
    }
}

impl Default for StaticABIRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ABIRegistry for StaticABIRegistry {
    fn abi(&self, name: &str) -> Option<String> {
        self.by_name.get(name).cloned()
    }

    fn selector(&self, four_byte_hex: &str) -> Option<String> {
        self.by_selector.get(four_byte_hex).cloned()
    }
}

/// Addresses considered for monitoring/token-allow-list purposes; shared
/// shape between SafetyEngine's `token_check` and MempoolScanner's filter.
pub fn normalize_address_list(raw: &[String]) -> Vec<Address> {
    raw.iter()
        .filter(|s| s.to_lowercase().starts_with("0x"))
        .filter_map(|s| s.to_lowercase().parse::<Address>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_non_hex_entries() {
        let raw = vec![
            "0xae7ab96520DE3A18E5e111B5EaAb095312D7fE84".to_string(),
            "WETH".to_string(),
            "not-an-address".to_string(),
        ];
        let out = normalize_address_list(&raw);
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn telegram_notifier_noop_without_config() {
        let sink = TelegramNotifier::new(None, None);
        sink.notify("test", NotifyLevel::Info, None).await;
    }
}
