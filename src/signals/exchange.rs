use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use super::score::{blend, saturate, z_score};
use super::{ProcessingContext, ProcessorError, Signal, SignalProcessor, SignalType, entity_flows};
use crate::config::ProcessorConfig;
use crate::core::{Block, signed_sats_to_btc};
use crate::tags::{DirectorySnapshot, EntityDirectory, EntityType};

/// |z| at which the deviation component reaches 0.5.
const Z_MIDPOINT: f64 = 2.0;

/// Net BTC flowing into all known exchanges in `block`
/// (negative when exchanges are net senders).
pub fn net_exchange_flow_btc(block: &Block, snapshot: &DirectorySnapshot) -> f64 {
    let net: i64 = entity_flows(block, snapshot, EntityType::Exchange)
        .iter()
        .map(|f| f.net_sats())
        .sum();
    signed_sats_to_btc(net)
}

#[derive(Debug, Clone, Copy)]
struct FlowSample {
    height: u64,
    at: DateTime<Utc>,
    net_btc: f64,
}

/// Per-exchange inflow/outflow imbalance against a rolling window.
pub struct ExchangeFlowProcessor {
    config: ProcessorConfig,
    window: Duration,
    min_flow_btc: f64,
    directory: Arc<EntityDirectory>,
    windows: Mutex<HashMap<String, VecDeque<FlowSample>>>,
}

impl ExchangeFlowProcessor {
    pub fn new(
        config: ProcessorConfig,
        realtime_window_hours: u64,
        min_flow_btc: f64,
        directory: Arc<EntityDirectory>,
    ) -> Self {
        let window = config.window(realtime_window_hours);
        Self {
            config,
            window,
            min_flow_btc,
            directory,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SignalProcessor for ExchangeFlowProcessor {
    fn name(&self) -> &'static str {
        "exchange"
    }

    fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn rewind(&self, from_height: u64) {
        if let Ok(mut windows) = self.windows.lock() {
            for window in windows.values_mut() {
                window.retain(|s| s.height < from_height);
            }
            windows.retain(|_, w| !w.is_empty());
        }
    }

    async fn process_block(
        &self,
        block: &Block,
        _ctx: &ProcessingContext,
    ) -> Result<Vec<Signal>, ProcessorError> {
        if block.limited_detail {
            return Ok(Vec::new());
        }
        let snapshot = self.directory.snapshot();
        let flows = entity_flows(block, &snapshot, EntityType::Exchange);
        if flows.is_empty() {
            return Ok(Vec::new());
        }

        let mut windows = self
            .windows
            .lock()
            .map_err(|_| ProcessorError::State("exchange flow window poisoned".into()))?;
        let cutoff = block.timestamp - self.window;

        let mut signals = Vec::new();
        for flow in flows {
            let net_btc = signed_sats_to_btc(flow.net_sats());
            let window = windows.entry(flow.entity.entity_id.clone()).or_default();
            // a replayed height replaces its earlier sample
            window.retain(|s| s.at >= cutoff && s.height < block.height);
            let past: Vec<f64> = window.iter().map(|s| s.net_btc).collect();
            window.push_back(FlowSample {
                height: block.height,
                at: block.timestamp,
                net_btc,
            });

            if flow.net_sats() == 0 {
                continue;
            }
            let magnitude = saturate(net_btc.abs(), self.min_flow_btc);
            let z = z_score(net_btc, &past, 2);
            let confidence = match z {
                Some(z) => blend(&[(magnitude, 0.6), (saturate(z.abs(), Z_MIDPOINT), 0.4)]),
                None => magnitude,
            };
            let signal_type = if net_btc > 0.0 {
                SignalType::ExchangeInflow
            } else {
                SignalType::ExchangeOutflow
            };
            signals.push(Signal::new(
                signal_type,
                block.height,
                confidence,
                json!({
                    "entity_id": flow.entity.entity_id,
                    "entity_name": flow.entity.name,
                    "inflow_btc": signed_sats_to_btc(flow.inflow as i64),
                    "outflow_btc": signed_sats_to_btc(flow.outflow as i64),
                    "net_flow_btc": net_btc,
                    "z_score": z,
                    "window_samples": past.len(),
                    "window_secs": self.window.num_seconds(),
                    "tx_count": flow.tx_count,
                }),
            ));
        }
        windows.retain(|_, w| !w.is_empty());
        Ok(signals)
    }
}
