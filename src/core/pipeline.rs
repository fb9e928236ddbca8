use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::timeout_at;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::core::Block;
use crate::core::history::HistoricalData;
use crate::core::mempool::Anomaly;
use crate::db::persistence::SignalPersistence;
use crate::errors::{ErrorHandler, PipelineError};
use crate::signals::{ProcessingContext, Signal, SignalProcessor};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineTiming {
    pub signal_generation_ms: f64,
    pub signal_persistence_ms: f64,
    pub total_duration_ms: f64,
}

/// Outcome of running every processor over one block.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub correlation_id: String,
    pub block_height: u64,
    pub signals: Vec<Signal>,
    pub anomalies: Vec<Anomaly>,
    pub timing: PipelineTiming,
    pub failed_processors: Vec<String>,
    pub persisted: usize,
    pub success: bool,
    pub error: Option<String>,
}

/// Fans a block out to the processors, gathers their signals and persists them.
pub struct PipelineOrchestrator {
    processors: Vec<Arc<dyn SignalProcessor>>,
    persistence: SignalPersistence,
    handler: Arc<ErrorHandler>,
    processor_timeout: Duration,
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

impl PipelineOrchestrator {
    pub fn new(
        processors: Vec<Arc<dyn SignalProcessor>>,
        persistence: SignalPersistence,
        handler: Arc<ErrorHandler>,
        processor_timeout: Duration,
    ) -> Self {
        Self {
            processors,
            persistence,
            handler,
            processor_timeout,
        }
    }

    /// Same persistence and error handling over another processor set.
    pub fn with_processors(&self, processors: Vec<Arc<dyn SignalProcessor>>) -> Self {
        Self::new(
            processors,
            self.persistence.clone(),
            self.handler.clone(),
            self.processor_timeout,
        )
    }

    /// Drop processor state derived from `from_height` and above.
    pub fn rewind(&self, from_height: u64) {
        for processor in &self.processors {
            processor.rewind(from_height);
        }
    }

    /// Names of the processors that will run.
    pub fn enabled_processors(&self) -> Vec<&'static str> {
        self.processors
            .iter()
            .filter(|p| p.config().enabled)
            .map(|p| p.name())
            .collect()
    }

    pub async fn process_new_block(
        &self,
        block: Arc<Block>,
        history: Arc<HistoricalData>,
    ) -> PipelineResult {
        let correlation_id = Uuid::new_v4().to_string();
        let span = info_span!("pipeline", %correlation_id, height = block.height);
        self.run(block, history, correlation_id).instrument(span).await
    }

    async fn run(
        &self,
        block: Arc<Block>,
        history: Arc<HistoricalData>,
        correlation_id: String,
    ) -> PipelineResult {
        let started = Instant::now();
        let height = block.height;
        let ctx = ProcessingContext {
            correlation_id: correlation_id.clone(),
            history: history.clone(),
        };

        let mut tasks = Vec::new();
        for processor in self.processors.iter().filter(|p| p.config().enabled) {
            let name = processor.name();
            let threshold = processor.config().confidence_threshold;
            let processor = processor.clone();
            let block = block.clone();
            let ctx = ctx.clone();
            let handle = tokio::spawn(
                async move { processor.process_block(&block, &ctx).await }.in_current_span(),
            );
            tasks.push((name, threshold, handle));
        }

        // processors start together, so they share one deadline
        let deadline = tokio::time::Instant::now() + self.processor_timeout;
        let mut signals = Vec::new();
        let mut failed_processors = Vec::new();
        for (name, threshold, mut handle) in tasks {
            let failure = match timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(found))) => {
                    let produced = found.len();
                    signals.extend(found.into_iter().filter(|s| s.confidence >= threshold));
                    debug!(processor = name, produced, "processor finished");
                    None
                }
                Ok(Ok(Err(e))) => Some((e.error_type(), e.to_string())),
                Ok(Err(join_err)) if join_err.is_panic() => {
                    Some(("panic", "processor task panicked".to_string()))
                }
                Ok(Err(join_err)) => Some(("cancelled", join_err.to_string())),
                Err(_) => {
                    handle.abort();
                    Some((
                        "timeout",
                        format!("no result within {:?}", self.processor_timeout),
                    ))
                }
            };
            if let Some((error_type, message)) = failure {
                let err = PipelineError::ProcessorFailure {
                    processor: name.to_string(),
                    message,
                };
                self.handler.handle_processor_error(
                    name,
                    height,
                    &correlation_id,
                    error_type,
                    &err.to_string(),
                );
                failed_processors.push(name.to_string());
            }
        }
        let signal_generation_ms = elapsed_ms(started);

        let metrics = self.handler.metrics();
        for signal in &signals {
            metrics.record_signal(signal.signal_type.as_str());
        }

        let persist_started = Instant::now();
        let outcome = self.persistence.persist_signals(&signals, &correlation_id).await;
        let signal_persistence_ms = elapsed_ms(persist_started);
        let error = outcome
            .error
            .map(|e| PipelineError::PersistenceFailure(e).to_string());
        if let Some(error) = &error {
            warn!(signals = signals.len(), "signals kept in result only: {error}");
        }

        let total_duration_ms = elapsed_ms(started);
        metrics.blocks_processed.inc();
        metrics.pipeline_duration_ms.set(total_duration_ms);
        info!(
            signals = signals.len(),
            failed = failed_processors.len(),
            anomalies = history.anomalies.len(),
            total_ms = total_duration_ms,
            "block processed"
        );

        PipelineResult {
            correlation_id,
            block_height: height,
            signals,
            anomalies: history.anomalies.clone(),
            timing: PipelineTiming {
                signal_generation_ms,
                signal_persistence_ms,
                total_duration_ms,
            },
            failed_processors,
            persisted: outcome.count,
            success: outcome.success,
            error,
        }
    }
}
