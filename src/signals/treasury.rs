use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::score::saturate;
use super::{ProcessingContext, ProcessorError, Signal, SignalProcessor, SignalType, entity_flows};
use crate::config::ProcessorConfig;
use crate::core::{Block, sats_to_btc, signed_sats_to_btc};
use crate::tags::{EntityDirectory, EntityType};

const BASE_CONFIDENCE: f64 = 0.6;
/// Holdings change, in percent, at which the size component reaches 0.5.
const PCT_MIDPOINT: f64 = 1.0;

/// Movements of known corporate/sovereign treasury wallets.
pub struct TreasuryProcessor {
    config: ProcessorConfig,
    directory: Arc<EntityDirectory>,
}

impl TreasuryProcessor {
    pub fn new(config: ProcessorConfig, directory: Arc<EntityDirectory>) -> Self {
        Self { config, directory }
    }
}

#[async_trait]
impl SignalProcessor for TreasuryProcessor {
    fn name(&self) -> &'static str {
        "treasury"
    }

    fn config(&self) -> &ProcessorConfig {
        &self.config
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
        let signals = entity_flows(block, &snapshot, EntityType::Treasury)
            .into_iter()
            .map(|flow| {
                let net_btc = signed_sats_to_btc(flow.net_sats());
                let holdings = flow.entity.holdings_btc();
                let change_pct = holdings.map(|h| net_btc / h * 100.0);
                let confidence = BASE_CONFIDENCE
                    + (1.0 - BASE_CONFIDENCE)
                        * change_pct.map_or(0.0, |pct| saturate(pct.abs(), PCT_MIDPOINT));
                Signal::new(
                    SignalType::TreasuryMovement,
                    block.height,
                    confidence,
                    json!({
                        "entity_id": flow.entity.entity_id,
                        "entity_name": flow.entity.name,
                        "inflow_btc": sats_to_btc(flow.inflow),
                        "outflow_btc": sats_to_btc(flow.outflow),
                        "net_flow_btc": net_btc,
                        "holdings_btc": holdings,
                        "holdings_change_pct": change_pct,
                        "direction": if net_btc >= 0.0 { "accumulation" } else { "distribution" },
                        "tx_count": flow.tx_count,
                    }),
                )
            })
            .collect();
        Ok(signals)
    }
}
