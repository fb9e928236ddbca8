use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::MempoolSnapshot;

/// Samples required before anomaly checks run.
pub const MIN_SAMPLES: usize = 10;
/// Standard deviations above the mean that count as a spike.
pub const SIGMA_THRESHOLD: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    MempoolSpike,
    FeeSpike,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::MempoolSpike => "mempool_spike",
            AnomalyKind::FeeSpike => "fee_spike",
        }
    }
}

/// Informational event surfaced next to the signals of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub severity: String,
    pub value: f64,
    pub threshold: f64,
    pub mean: f64,
    pub std_dev: f64,
}

/// Mean and population standard deviation.
pub fn mean_std(values: impl IntoIterator<Item = f64>) -> Option<(f64, f64)> {
    let mut n = 0usize;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for v in values {
        n += 1;
        sum += v;
        sum_sq += v * v;
    }
    if n == 0 {
        return None;
    }
    let mean = sum / n as f64;
    let variance = (sum_sq / n as f64 - mean * mean).max(0.0);
    Some((mean, variance.sqrt()))
}

/// Rolling `(fee_rate, size)` history with a 3σ spike check.
#[derive(Debug)]
pub struct MempoolAnalyzer {
    fee_rates: VecDeque<f64>,
    sizes: VecDeque<f64>,
    capacity: usize,
}

impl MempoolAnalyzer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            fee_rates: VecDeque::with_capacity(capacity),
            sizes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.fee_rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fee_rates.is_empty()
    }

    /// Check the snapshot against the existing history, then append it.
    pub fn update(&mut self, snapshot: &MempoolSnapshot) -> Vec<Anomaly> {
        self.push(snapshot.avg_fee_rate, snapshot.size as f64)
    }

    /// Raw form of [`update`](Self::update).
    pub fn push(&mut self, fee_rate: f64, size: f64) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        if self.fee_rates.len() >= MIN_SAMPLES {
            if let Some(a) = check(&self.fee_rates, fee_rate, AnomalyKind::FeeSpike) {
                anomalies.push(a);
            }
            if let Some(a) = check(&self.sizes, size, AnomalyKind::MempoolSpike) {
                anomalies.push(a);
            }
        }

        if self.fee_rates.len() == self.capacity {
            self.fee_rates.pop_front();
            self.sizes.pop_front();
        }
        self.fee_rates.push_back(fee_rate);
        self.sizes.push_back(size);
        anomalies
    }
}

fn check(history: &VecDeque<f64>, current: f64, kind: AnomalyKind) -> Option<Anomaly> {
    let (mean, std_dev) = mean_std(history.iter().copied())?;
    let threshold = mean + SIGMA_THRESHOLD * std_dev;
    (current > threshold).then(|| Anomaly {
        kind,
        severity: "high".to_string(),
        value: current,
        threshold,
        mean,
        std_dev,
    })
}
