use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::MempoolSnapshot;
use super::mempool::Anomaly;

/// Historical series plus the latest observations handed to processors.
/// Series are ordered oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalData {
    pub fee_rates: Vec<f64>,
    pub mempool_sizes: Vec<f64>,
    /// Block time each mempool sample was recorded under.
    #[serde(default)]
    pub mempool_times: Vec<DateTime<Utc>>,
    /// Net exchange flow per block, in BTC (positive = into exchanges).
    pub exchange_net_flows: Vec<f64>,
    pub block_fees: Vec<u64>,
    /// Block time of each `exchange_net_flows` / `block_fees` entry.
    #[serde(default)]
    pub block_times: Vec<DateTime<Utc>>,
    pub mempool: Option<MempoolSnapshot>,
    pub anomalies: Vec<Anomaly>,
}

/// Entries of `values` stamped at or after `cutoff`. Unstamped series are kept whole.
fn recent<T: Copy>(values: &[T], times: &[DateTime<Utc>], cutoff: DateTime<Utc>) -> Vec<T> {
    if times.len() != values.len() {
        return values.to_vec();
    }
    values
        .iter()
        .zip(times)
        .filter(|(_, at)| **at >= cutoff)
        .map(|(v, _)| *v)
        .collect()
}

fn recent_times(times: &[DateTime<Utc>], cutoff: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    times.iter().copied().filter(|at| *at >= cutoff).collect()
}

impl HistoricalData {
    /// Copy limited to samples from the `window` before `now`.
    pub fn within(&self, window: Duration, now: DateTime<Utc>) -> HistoricalData {
        let cutoff = now - window;
        HistoricalData {
            fee_rates: recent(&self.fee_rates, &self.mempool_times, cutoff),
            mempool_sizes: recent(&self.mempool_sizes, &self.mempool_times, cutoff),
            mempool_times: recent_times(&self.mempool_times, cutoff),
            exchange_net_flows: recent(&self.exchange_net_flows, &self.block_times, cutoff),
            block_fees: recent(&self.block_fees, &self.block_times, cutoff),
            block_times: recent_times(&self.block_times, cutoff),
            mempool: self.mempool.clone(),
            anomalies: self.anomalies.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct MempoolPoint {
    height: u64,
    at: DateTime<Utc>,
    fee_rate: f64,
    size: f64,
}

#[derive(Debug, Clone)]
struct BlockPoint {
    height: u64,
    at: DateTime<Utc>,
    net_flow_btc: f64,
    fees: u64,
}

/// Bounded series owned by the poll loop, keyed by the height that produced them.
#[derive(Debug)]
pub struct HistoryTracker {
    mempool_points: VecDeque<MempoolPoint>,
    block_points: VecDeque<BlockPoint>,
    latest_mempool: Option<MempoolSnapshot>,
    capacity: usize,
}

fn push_bounded<T>(series: &mut VecDeque<T>, value: T, capacity: usize) {
    if series.len() == capacity {
        series.pop_front();
    }
    series.push_back(value);
}

impl HistoryTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            mempool_points: VecDeque::new(),
            block_points: VecDeque::new(),
            latest_mempool: None,
            capacity: capacity.max(1),
        }
    }

    /// Snapshot for the block about to be processed. The current mempool
    /// reading is carried separately from the series it will join.
    pub fn snapshot(&self, anomalies: Vec<Anomaly>) -> HistoricalData {
        HistoricalData {
            fee_rates: self.mempool_points.iter().map(|p| p.fee_rate).collect(),
            mempool_sizes: self.mempool_points.iter().map(|p| p.size).collect(),
            mempool_times: self.mempool_points.iter().map(|p| p.at).collect(),
            exchange_net_flows: self.block_points.iter().map(|p| p.net_flow_btc).collect(),
            block_fees: self.block_points.iter().map(|p| p.fees).collect(),
            block_times: self.block_points.iter().map(|p| p.at).collect(),
            mempool: self.latest_mempool.clone(),
            anomalies,
        }
    }

    pub fn observe_mempool(&mut self, snapshot: MempoolSnapshot) {
        self.latest_mempool = Some(snapshot);
    }

    /// Forget the current reading when it could not be refreshed.
    pub fn clear_mempool(&mut self) {
        self.latest_mempool = None;
    }

    /// Fold the processed block's observations into the series. The current
    /// mempool reading joins at most once.
    pub fn record_block(
        &mut self,
        height: u64,
        at: DateTime<Utc>,
        net_exchange_flow_btc: f64,
        fees_total: u64,
    ) {
        if let Some(mempool) = self.latest_mempool.take() {
            let point = MempoolPoint {
                height,
                at,
                fee_rate: mempool.avg_fee_rate,
                size: mempool.size as f64,
            };
            push_bounded(&mut self.mempool_points, point, self.capacity);
        }
        let point = BlockPoint {
            height,
            at,
            net_flow_btc: net_exchange_flow_btc,
            fees: fees_total,
        };
        push_bounded(&mut self.block_points, point, self.capacity);
    }

    /// Drop everything recorded for `from_height` and above.
    pub fn rewind(&mut self, from_height: u64) {
        self.mempool_points.retain(|p| p.height < from_height);
        self.block_points.retain(|p| p.height < from_height);
        self.latest_mempool = None;
    }

    pub fn len(&self) -> usize {
        self.block_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_points.is_empty()
    }
}
