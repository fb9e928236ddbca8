use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use super::coinjoin::detect_coinjoin;
use super::score::{blend, saturate};
use super::{ProcessingContext, ProcessorError, Signal, SignalProcessor, SignalType};
use crate::config::{ProcessorConfig, SignalConfig};
use crate::core::{Block, SATS_PER_BTC, sats_to_btc};
use crate::tags::EntityDirectory;

/// Outputs below this share of the whale threshold are not tracked.
const TRACKING_FLOOR: f64 = 0.001;

#[derive(Debug)]
struct Receipt {
    height: u64,
    at: DateTime<Utc>,
    address: String,
    value: u64,
}

/// Trailing received amounts per address, oldest first.
#[derive(Debug, Default)]
struct TrailingReceipts {
    entries: VecDeque<Receipt>,
    totals: HashMap<String, u64>,
}

impl TrailingReceipts {
    fn record(&mut self, height: u64, at: DateTime<Utc>, address: &str, value: u64) {
        self.entries.push_back(Receipt {
            height,
            at,
            address: address.to_string(),
            value,
        });
        *self.totals.entry(address.to_string()).or_default() += value;
    }

    fn forget(totals: &mut HashMap<String, u64>, receipt: &Receipt) {
        if let Some(total) = totals.get_mut(&receipt.address) {
            *total = total.saturating_sub(receipt.value);
            if *total == 0 {
                totals.remove(&receipt.address);
            }
        }
    }

    fn expire(&mut self, cutoff: DateTime<Utc>) {
        while self.entries.front().is_some_and(|r| r.at < cutoff) {
            let Some(receipt) = self.entries.pop_front() else {
                break;
            };
            Self::forget(&mut self.totals, &receipt);
        }
    }

    /// Drop receipts from `from_height` and above.
    fn rewind(&mut self, from_height: u64) {
        let totals = &mut self.totals;
        self.entries.retain(|r| {
            let keep = r.height < from_height;
            if !keep {
                Self::forget(totals, r);
            }
            keep
        });
    }

    fn total(&self, address: &str) -> u64 {
        self.totals.get(address).copied().unwrap_or(0)
    }
}

/// Large transfers to addresses that have been accumulating.
pub struct WhaleProcessor {
    config: ProcessorConfig,
    threshold_sats: u64,
    lookback: Duration,
    directory: Arc<EntityDirectory>,
    receipts: Mutex<TrailingReceipts>,
}

impl WhaleProcessor {
    pub fn new(
        config: ProcessorConfig,
        signals: &SignalConfig,
        directory: Arc<EntityDirectory>,
    ) -> Self {
        let lookback = if config.time_window_secs > 0 {
            Duration::seconds(config.time_window_secs as i64)
        } else {
            Duration::days(signals.whale_lookback_days)
        };
        Self {
            config,
            threshold_sats: (signals.whale_threshold_btc * SATS_PER_BTC).round() as u64,
            lookback,
            directory,
            receipts: Mutex::new(TrailingReceipts::default()),
        }
    }

    fn receipts(&self) -> Result<std::sync::MutexGuard<'_, TrailingReceipts>, ProcessorError> {
        self.receipts
            .lock()
            .map_err(|_| ProcessorError::State("whale receipts poisoned".into()))
    }
}

#[async_trait]
impl SignalProcessor for WhaleProcessor {
    fn name(&self) -> &'static str {
        "whale"
    }

    fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn rewind(&self, from_height: u64) {
        if let Ok(mut receipts) = self.receipts() {
            receipts.rewind(from_height);
        }
    }

    async fn process_block(
        &self,
        block: &Block,
        _ctx: &ProcessingContext,
    ) -> Result<Vec<Signal>, ProcessorError> {
        if block.limited_detail || self.threshold_sats == 0 {
            return Ok(Vec::new());
        }
        let floor = (self.threshold_sats as f64 * TRACKING_FLOOR) as u64;
        let mut receipts = self.receipts()?;
        // a replayed height replaces what it recorded before
        receipts.rewind(block.height);
        receipts.expire(block.timestamp - self.lookback);

        // judged against receipts from earlier blocks only
        let snapshot = self.directory.snapshot();
        let threshold_btc = sats_to_btc(self.threshold_sats);
        let mut signals = Vec::new();
        for tx in block.spends() {
            let coinjoin = detect_coinjoin(tx);
            for output in tx.outputs.iter().filter(|o| o.value >= self.threshold_sats) {
                let Some(address) = output.addresses.first() else {
                    continue;
                };
                let trailing = receipts.total(address);
                if trailing <= self.threshold_sats {
                    continue;
                }
                let value_btc = sats_to_btc(output.value);
                let trailing_btc = sats_to_btc(trailing);
                let mut confidence = blend(&[
                    (saturate(value_btc / threshold_btc, 1.0), 0.6),
                    (saturate(trailing_btc / threshold_btc, 1.0), 0.4),
                ]);
                if let Some(cj) = &coinjoin {
                    confidence *= cj.discount();
                }
                signals.push(Signal::new(
                    SignalType::WhaleTransfer,
                    block.height,
                    confidence,
                    json!({
                        "txid": tx.txid,
                        "address": address,
                        "value_btc": value_btc,
                        "trailing_received_btc": trailing_btc,
                        "lookback_secs": self.lookback.num_seconds(),
                        "threshold_btc": threshold_btc,
                        "entity": snapshot.entity(address).map(|e| e.name.clone()),
                        "coinjoin": coinjoin.as_ref().map(|c| c.pattern),
                    }),
                ));
            }
        }

        for tx in block.spends() {
            for output in tx.outputs.iter().filter(|o| o.value >= floor.max(1)) {
                for address in &output.addresses {
                    receipts.record(block.height, block.timestamp, address, output.value);
                }
            }
        }
        Ok(signals)
    }
}
