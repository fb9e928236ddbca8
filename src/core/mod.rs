pub mod history;
pub mod mempool;
pub mod normalize;
pub mod pipeline;
pub mod poller;
pub mod reorg;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SATS_PER_BTC: f64 = 100_000_000.0;

/// Convert satoshis to BTC. Presentation boundary only.
pub fn sats_to_btc(sats: u64) -> f64 {
    sats as f64 / SATS_PER_BTC
}

/// Signed variant of [`sats_to_btc`] for net flows.
pub fn signed_sats_to_btc(sats: i64) -> f64 {
    sats as f64 / SATS_PER_BTC
}

/// A block as returned by a source, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBlock {
    pub payload: serde_json::Value,
    /// Set when the source could not provide per-transaction detail.
    pub limited_detail: bool,
    pub source: String,
}

/// Canonical block record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    pub height: u64,
    pub prev_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
    pub weight: u64,
    pub tx_count: usize,
    pub fees_total: u64,
    pub transactions: Vec<Transaction>,
    pub limited_detail: bool,
}

impl Block {
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase)
    }

    /// Non-coinbase transactions.
    pub fn spends(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|tx| !tx.is_coinbase)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptInfo {
    pub script_type: Option<String>,
    pub hex: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxInput {
    pub index: usize,
    pub prev_txid: Option<String>,
    pub prev_vout: Option<u32>,
    pub value: u64,
    pub addresses: Vec<String>,
    pub script: ScriptInfo,
    /// Hex-encoded coinbase script, present only on coinbase inputs.
    pub coinbase_data: Option<String>,
}

impl TxInput {
    pub fn has_prevout(&self) -> bool {
        self.prev_txid.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    pub index: usize,
    pub value: u64,
    pub addresses: Vec<String>,
    pub script: ScriptInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    pub block_height: u64,
    /// Position within the block.
    pub position: usize,
    pub input_count: usize,
    pub output_count: usize,
    pub input_value: u64,
    pub output_value: u64,
    pub fee: u64,
    pub size: u64,
    pub vsize: u64,
    pub weight: u64,
    pub is_coinbase: bool,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Fee rate in sat/vB.
    pub fn fee_rate(&self) -> f64 {
        if self.vsize == 0 {
            return 0.0;
        }
        self.fee as f64 / self.vsize as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeePercentiles {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

/// Mempool summary as reported by a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MempoolSummary {
    pub size: u64,
    pub bytes: u64,
    pub total_fee: u64,
    /// Per-transaction fee rates (sat/vB), possibly sampled.
    pub fee_rates: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MempoolSnapshot {
    pub size: u64,
    pub bytes: u64,
    pub total_fee: u64,
    pub avg_fee_rate: f64,
    pub fee_percentiles: FeePercentiles,
    pub timestamp: DateTime<Utc>,
}

impl MempoolSnapshot {
    pub fn from_summary(summary: &MempoolSummary, timestamp: DateTime<Utc>) -> Self {
        let avg_fee_rate = if summary.bytes > 0 {
            summary.total_fee as f64 / summary.bytes as f64
        } else {
            0.0
        };
        let mut rates = summary.fee_rates.clone();
        rates.retain(|r| r.is_finite());
        rates.sort_by(|a, b| a.total_cmp(b));
        Self {
            size: summary.size,
            bytes: summary.bytes,
            total_fee: summary.total_fee,
            avg_fee_rate,
            fee_percentiles: FeePercentiles {
                p10: percentile(&rates, 0.10),
                p25: percentile(&rates, 0.25),
                p50: percentile(&rates, 0.50),
                p75: percentile(&rates, 0.75),
                p90: percentile(&rates, 0.90),
            },
            timestamp,
        }
    }
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
