use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::score::{blend, saturate};
use super::{ProcessingContext, ProcessorError, Signal, SignalProcessor, SignalType};
use crate::config::ProcessorConfig;
use crate::core::{Block, sats_to_btc, signed_sats_to_btc};
use crate::tags::{EntityDirectory, EntityType, PoolMatchMethod};

/// Spent BTC at which the outflow component reaches 0.5.
const OUTFLOW_MIDPOINT_BTC: f64 = 50.0;

/// Which pool mined the block, and whether pool wallets are moving coins.
pub struct MinerProcessor {
    config: ProcessorConfig,
    directory: Arc<EntityDirectory>,
}

impl MinerProcessor {
    pub fn new(config: ProcessorConfig, directory: Arc<EntityDirectory>) -> Self {
        Self { config, directory }
    }
}

fn match_confidence(method: PoolMatchMethod) -> f64 {
    match method {
        PoolMatchMethod::CoinbaseTag => 0.95,
        PoolMatchMethod::Address => 0.8,
    }
}

#[async_trait]
impl SignalProcessor for MinerProcessor {
    fn name(&self) -> &'static str {
        "miner"
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
        let Some(coinbase) = block.coinbase() else {
            return Ok(Vec::new());
        };
        let snapshot = self.directory.snapshot();
        let Some(pool) = snapshot.identify_mining_pool(coinbase) else {
            return Ok(Vec::new());
        };
        let pool_id = pool.entity.entity_id.as_str();
        let is_pool_address = |addresses: &[String]| {
            addresses.iter().any(|a| {
                snapshot
                    .entity(a)
                    .is_some_and(|e| e.entity_type == EntityType::MiningPool && e.entity_id == pool_id)
            })
        };

        let mut received = 0u64;
        let mut spent = 0u64;
        let mut to_exchanges = 0u64;
        let mut spending_txs = HashSet::new();
        for tx in &block.transactions {
            received += tx
                .outputs
                .iter()
                .filter(|o| is_pool_address(o.addresses.as_slice()))
                .map(|o| o.value)
                .sum::<u64>();
            let tx_spent: u64 = tx
                .inputs
                .iter()
                .filter(|i| is_pool_address(i.addresses.as_slice()))
                .map(|i| i.value)
                .sum();
            if tx_spent > 0 {
                spent += tx_spent;
                spending_txs.insert(tx.txid.as_str());
                to_exchanges += tx
                    .outputs
                    .iter()
                    .filter(|o| {
                        o.addresses.iter().any(|a| {
                            snapshot
                                .entity(a)
                                .is_some_and(|e| e.entity_type == EntityType::Exchange)
                        })
                    })
                    .map(|o| o.value)
                    .sum::<u64>();
            }
        }
        let balance_delta = signed_sats_to_btc(received as i64 - spent as i64);
        let matched = match_confidence(pool.method);

        let mut signals = vec![Signal::new(
            SignalType::MinerBlock,
            block.height,
            matched,
            json!({
                "pool_id": pool_id,
                "pool_name": pool.entity.name,
                "match_method": pool.method,
                "coinbase_reward_btc": sats_to_btc(coinbase.output_value),
                "block_fees_btc": sats_to_btc(block.fees_total),
                "tx_count": block.tx_count,
                "balance_delta_btc": balance_delta,
            }),
        )];

        if spent > 0 {
            let spent_btc = sats_to_btc(spent);
            let confidence = blend(&[
                (matched, 0.5),
                (saturate(spent_btc, OUTFLOW_MIDPOINT_BTC), 0.5),
            ]);
            signals.push(Signal::new(
                SignalType::MinerOutflow,
                block.height,
                confidence,
                json!({
                    "pool_id": pool_id,
                    "pool_name": pool.entity.name,
                    "spent_btc": spent_btc,
                    "received_btc": sats_to_btc(received),
                    "balance_delta_btc": balance_delta,
                    "to_exchanges_btc": sats_to_btc(to_exchanges),
                    "spending_tx_count": spending_txs.len(),
                }),
            ));
        }
        Ok(signals)
    }
}
