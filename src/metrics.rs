use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProcessorErrorLabels {
    pub processor: String,
    pub error_type: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SignalLabels {
    pub signal_type: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AnomalyLabels {
    pub kind: String,
}

/// Counters and gauges emitted by the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    pub blocks_processed: Counter,
    pub blocks_skipped: Counter,
    pub signals_generated: Family<SignalLabels, Counter>,
    pub processor_errors: Family<ProcessorErrorLabels, Counter>,
    pub retry_attempts: Family<OperationLabels, Counter>,
    pub anomalies: Family<AnomalyLabels, Counter>,
    pub reorgs: Counter,
    pub persistence_failures: Counter,
    pub latest_height: Gauge,
    /// 0 = primary, 1 = degraded, 2 = fallback.
    pub connector_state: Gauge,
    pub entity_cache_size: Gauge,
    pub pipeline_duration_ms: Gauge<f64, AtomicU64>,
}

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "chainsignal_blocks_processed",
            "Blocks run through the signal pipeline",
            metrics.blocks_processed.clone(),
        );
        registry.register(
            "chainsignal_blocks_skipped",
            "Blocks skipped because they failed validation",
            metrics.blocks_skipped.clone(),
        );
        registry.register(
            "chainsignal_signals_generated",
            "Signals generated, by type",
            metrics.signals_generated.clone(),
        );
        registry.register(
            "chainsignal_processor_errors",
            "Signal processor failures, by processor and error type",
            metrics.processor_errors.clone(),
        );
        registry.register(
            "chainsignal_retry_attempts",
            "Failed attempts of retried operations",
            metrics.retry_attempts.clone(),
        );
        registry.register(
            "chainsignal_anomalies",
            "Mempool anomalies detected, by kind",
            metrics.anomalies.clone(),
        );
        registry.register(
            "chainsignal_reorgs",
            "Chain reorganizations detected",
            metrics.reorgs.clone(),
        );
        registry.register(
            "chainsignal_persistence_failures",
            "Signal batches that could not be persisted",
            metrics.persistence_failures.clone(),
        );
        registry.register(
            "chainsignal_latest_block_height",
            "Height of the last processed block",
            metrics.latest_height.clone(),
        );
        registry.register(
            "chainsignal_connector_state",
            "Node connector state (0 primary, 1 degraded, 2 fallback)",
            metrics.connector_state.clone(),
        );
        registry.register(
            "chainsignal_entity_cache_size",
            "Addresses in the active entity snapshot",
            metrics.entity_cache_size.clone(),
        );
        registry.register(
            "chainsignal_pipeline_duration_ms",
            "Duration of the last pipeline invocation",
            metrics.pipeline_duration_ms.clone(),
        );
        metrics
    }

    pub fn record_signal(&self, signal_type: &str) {
        self.signals_generated
            .get_or_create(&SignalLabels {
                signal_type: signal_type.to_string(),
            })
            .inc();
    }

    pub fn record_processor_error(&self, processor: &str, error_type: &str) {
        self.processor_errors
            .get_or_create(&ProcessorErrorLabels {
                processor: processor.to_string(),
                error_type: error_type.to_string(),
            })
            .inc();
    }

    pub fn processor_error_count(&self, processor: &str, error_type: &str) -> u64 {
        self.processor_errors
            .get_or_create(&ProcessorErrorLabels {
                processor: processor.to_string(),
                error_type: error_type.to_string(),
            })
            .get()
    }

    pub fn retry_count(&self, operation: &str) -> u64 {
        self.retry_attempts
            .get_or_create(&OperationLabels {
                operation: operation.to_string(),
            })
            .get()
    }

    pub fn record_retry(&self, operation: &str) {
        self.retry_attempts
            .get_or_create(&OperationLabels {
                operation: operation.to_string(),
            })
            .inc();
    }

    pub fn record_anomaly(&self, kind: &str) {
        self.anomalies
            .get_or_create(&AnomalyLabels {
                kind: kind.to_string(),
            })
            .inc();
    }
}

/// Render the registry in the OpenMetrics text format.
pub fn encode(registry: &Registry) -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, registry)?;
    Ok(buffer)
}
