use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;

use super::score::{saturate, z_score};
use super::{ProcessingContext, ProcessorError, Signal, SignalProcessor, SignalType};
use crate::config::ProcessorConfig;
use crate::core::Block;
use crate::core::mempool::MIN_SAMPLES;

/// |z| at which pressure confidence reaches 0.5.
const Z_MIDPOINT: f64 = 2.0;

/// Fee and backlog pressure of the mempool relative to its recent history.
pub struct MempoolPressureProcessor {
    config: ProcessorConfig,
    window: Duration,
}

impl MempoolPressureProcessor {
    pub fn new(config: ProcessorConfig, realtime_window_hours: u64) -> Self {
        let window = config.window(realtime_window_hours);
        Self { config, window }
    }
}

#[async_trait]
impl SignalProcessor for MempoolPressureProcessor {
    fn name(&self) -> &'static str {
        "mempool"
    }

    fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    async fn process_block(
        &self,
        block: &Block,
        ctx: &ProcessingContext,
    ) -> Result<Vec<Signal>, ProcessorError> {
        let Some(current) = &ctx.history.mempool else {
            return Ok(Vec::new());
        };
        let history = ctx.history.within(self.window, block.timestamp);

        let fee_z = z_score(current.avg_fee_rate, &history.fee_rates, MIN_SAMPLES);
        let size_z = z_score(current.size as f64, &history.mempool_sizes, MIN_SAMPLES);
        let dominant = match (fee_z, size_z) {
            (None, None) => return Ok(Vec::new()),
            (Some(f), Some(s)) => {
                if f.abs() >= s.abs() {
                    f
                } else {
                    s
                }
            }
            (Some(z), None) | (None, Some(z)) => z,
        };

        let strength = dominant.abs();
        let confidence = saturate(strength, Z_MIDPOINT);
        let metadata = json!({
            "avg_fee_rate": current.avg_fee_rate,
            "mempool_size": current.size,
            "mempool_bytes": current.bytes,
            "fee_percentiles": current.fee_percentiles,
            "fee_z_score": fee_z,
            "size_z_score": size_z,
            "strength": strength,
            "direction": if dominant >= 0.0 { "rising" } else { "easing" },
            "history_samples": history.fee_rates.len(),
            "window_secs": self.window.num_seconds(),
            "anomalies": history.anomalies,
        });
        Ok(vec![Signal::new(
            SignalType::MempoolPressure,
            block.height,
            confidence,
            metadata,
        )])
    }
}
