//! Signal processors and the records they emit.
//!
//! Each processor looks at one normalized block plus the historical series
//! the poller maintains and returns zero or more [`Signal`]s. Processors are
//! independent: the orchestrator runs them concurrently and a failure in one
//! never affects the others.

pub mod coinjoin;
pub mod exchange;
pub mod mempool;
pub mod miner;
pub mod predictive;
pub mod score;
pub mod treasury;
pub mod whale;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{Config, ProcessorConfig};
use crate::core::Block;
use crate::core::history::HistoricalData;
use crate::db::persistence::generate_signal_id;
use crate::tags::{DirectorySnapshot, Entity, EntityDirectory, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    MempoolPressure,
    ExchangeInflow,
    ExchangeOutflow,
    MinerBlock,
    MinerOutflow,
    WhaleTransfer,
    TreasuryMovement,
    FeeForecast,
    LiquidityPressure,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::MempoolPressure => "mempool_pressure",
            SignalType::ExchangeInflow => "exchange_inflow",
            SignalType::ExchangeOutflow => "exchange_outflow",
            SignalType::MinerBlock => "miner_block",
            SignalType::MinerOutflow => "miner_outflow",
            SignalType::WhaleTransfer => "whale_transfer",
            SignalType::TreasuryMovement => "treasury_movement",
            SignalType::FeeForecast => "fee_forecast",
            SignalType::LiquidityPressure => "liquidity_pressure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }

    pub fn is_predictive(&self) -> bool {
        matches!(self, SignalType::FeeForecast | SignalType::LiquidityPressure)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub signal_type: SignalType,
    pub block_height: u64,
    pub confidence: f64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub is_predictive: bool,
}

impl Signal {
    pub fn new(
        signal_type: SignalType,
        block_height: u64,
        confidence: f64,
        metadata: serde_json::Value,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            signal_id: generate_signal_id(),
            signal_type,
            block_height,
            confidence,
            metadata,
            created_at: Utc::now(),
            processed: false,
            processed_at: None,
            is_predictive: signal_type.is_predictive(),
        }
    }
}

/// Per-block inputs shared by all processors.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub correlation_id: String,
    pub history: Arc<HistoricalData>,
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("state unavailable: {0}")]
    State(String),
    #[error("{0}")]
    Internal(String),
}

impl ProcessorError {
    /// Label used for the `error_type` metric dimension.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProcessorError::InsufficientData(_) => "insufficient_data",
            ProcessorError::State(_) => "state",
            ProcessorError::Internal(_) => "internal",
        }
    }
}

#[async_trait]
pub trait SignalProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn config(&self) -> &ProcessorConfig;

    /// Forget rolling state built from blocks at `from_height` and above.
    fn rewind(&self, _from_height: u64) {}

    async fn process_block(
        &self,
        block: &Block,
        ctx: &ProcessingContext,
    ) -> Result<Vec<Signal>, ProcessorError>;
}

/// Builds a processor set with empty rolling state.
pub type ProcessorFactory = Arc<dyn Fn() -> Vec<Arc<dyn SignalProcessor>> + Send + Sync>;

/// The six processors, in a fixed order, whether enabled or not.
pub fn default_processors(
    config: &Config,
    directory: Arc<EntityDirectory>,
) -> Vec<Arc<dyn SignalProcessor>> {
    let realtime = config.pipeline.realtime_window_hours;
    vec![
        Arc::new(mempool::MempoolPressureProcessor::new(
            config.processors.mempool.clone(),
            realtime,
        )),
        Arc::new(exchange::ExchangeFlowProcessor::new(
            config.processors.exchange.clone(),
            realtime,
            config.signals.exchange_min_flow_btc,
            directory.clone(),
        )),
        Arc::new(miner::MinerProcessor::new(
            config.processors.miner.clone(),
            directory.clone(),
        )),
        Arc::new(whale::WhaleProcessor::new(
            config.processors.whale.clone(),
            &config.signals,
            directory.clone(),
        )),
        Arc::new(treasury::TreasuryProcessor::new(
            config.processors.treasury.clone(),
            directory.clone(),
        )),
        Arc::new(predictive::PredictiveProcessor::new(
            config.processors.predictive.clone(),
            realtime,
            directory,
        )),
    ]
}

/// Value moving into and out of one entity within a block.
#[derive(Debug, Clone)]
pub struct EntityFlow {
    pub entity: Arc<Entity>,
    /// Satoshis paid to the entity's addresses.
    pub inflow: u64,
    /// Satoshis spent from the entity's addresses.
    pub outflow: u64,
    pub tx_count: usize,
}

impl EntityFlow {
    pub fn net_sats(&self) -> i64 {
        self.inflow as i64 - self.outflow as i64
    }
}

/// Aggregate flows of every entity of `entity_type` touched by `block`,
/// ordered by entity id.
pub fn entity_flows(
    block: &Block,
    snapshot: &DirectorySnapshot,
    entity_type: EntityType,
) -> Vec<EntityFlow> {
    let mut flows: BTreeMap<String, EntityFlow> = BTreeMap::new();
    let lookup = |addresses: &[String]| {
        addresses
            .iter()
            .filter_map(|a| snapshot.entity(a))
            .find(|e| e.entity_type == entity_type)
            .cloned()
    };

    for tx in &block.transactions {
        let mut touched: Vec<String> = Vec::new();
        for output in &tx.outputs {
            if let Some(entity) = lookup(output.addresses.as_slice()) {
                let flow = flows.entry(entity.entity_id.clone()).or_insert_with(|| EntityFlow {
                    entity: entity.clone(),
                    inflow: 0,
                    outflow: 0,
                    tx_count: 0,
                });
                flow.inflow += output.value;
                touched.push(entity.entity_id.clone());
            }
        }
        for input in &tx.inputs {
            if let Some(entity) = lookup(input.addresses.as_slice()) {
                let flow = flows.entry(entity.entity_id.clone()).or_insert_with(|| EntityFlow {
                    entity: entity.clone(),
                    inflow: 0,
                    outflow: 0,
                    tx_count: 0,
                });
                flow.outflow += input.value;
                touched.push(entity.entity_id.clone());
            }
        }
        touched.sort();
        touched.dedup();
        for id in touched {
            if let Some(flow) = flows.get_mut(&id) {
                flow.tx_count += 1;
            }
        }
    }
    flows.into_values().collect()
}
