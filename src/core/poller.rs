//! The block poll loop.
//!
//! One task owns the rolling state (mempool window, reorg history, series
//! fed to the processors) and walks the chain height by height:
//! fetch, normalize, reorg check, mempool update, orchestrate, store.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::history::HistoryTracker;
use super::mempool::MempoolAnalyzer;
use super::normalize::Normalizer;
use super::pipeline::{PipelineOrchestrator, PipelineResult};
use super::reorg::{HeaderLink, ReorgCheck, ReorgDetector, ReorgSeverity};
use super::{Block, MempoolSnapshot};
use crate::config::PipelineConfig;
use crate::db::SharedDatabase;
use crate::db::persistence::persist_block;
use crate::errors::{ErrorHandler, PipelineError};
use crate::metrics::Metrics;
use crate::rpc::RpcError;
use crate::rpc::connector::NodeConnector;
use crate::signals::ProcessorFactory;
use crate::signals::exchange::net_exchange_flow_btc;
use crate::tags::EntityDirectory;

/// Condensed [`PipelineResult`] kept for the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSummary {
    pub correlation_id: String,
    pub block_height: u64,
    pub signals: usize,
    pub anomalies: usize,
    pub failed_processors: Vec<String>,
    pub success: bool,
    pub total_duration_ms: f64,
    pub finished_at: DateTime<Utc>,
}

impl From<&PipelineResult> for PipelineSummary {
    fn from(result: &PipelineResult) -> Self {
        Self {
            correlation_id: result.correlation_id.clone(),
            block_height: result.block_height,
            signals: result.signals.len(),
            anomalies: result.anomalies.len(),
            failed_processors: result.failed_processors.clone(),
            success: result.success,
            total_duration_ms: result.timing.total_duration_ms,
            finished_at: Utc::now(),
        }
    }
}

/// Most recent reorg, kept for the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReorgEvent {
    pub height: u64,
    pub depth: u64,
    pub resume_height: u64,
    pub severity: ReorgSeverity,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Board {
    latest_height: Option<u64>,
    last_pipeline: Option<PipelineSummary>,
    last_reorg: Option<ReorgEvent>,
}

/// Progress shared between the poll loop and the HTTP surface.
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: Mutex<Board>,
}

impl StatusBoard {
    fn lock(&self) -> std::sync::MutexGuard<'_, Board> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn latest_height(&self) -> Option<u64> {
        self.lock().latest_height
    }

    pub fn set_latest_height(&self, height: u64) {
        self.lock().latest_height = Some(height);
    }

    pub fn last_pipeline(&self) -> Option<PipelineSummary> {
        self.lock().last_pipeline.clone()
    }

    pub fn record_run(&self, result: &PipelineResult) {
        self.lock().last_pipeline = Some(PipelineSummary::from(result));
    }

    pub fn last_reorg(&self) -> Option<ReorgEvent> {
        self.lock().last_reorg.clone()
    }

    pub fn record_reorg(&self, event: ReorgEvent) {
        self.lock().last_reorg = Some(event);
    }
}

/// Handles shared by the poll loop and the HTTP surface.
#[derive(Clone)]
pub struct Services {
    pub connector: Arc<NodeConnector>,
    pub normalizer: Normalizer,
    pub orchestrator: Arc<PipelineOrchestrator>,
    /// Fresh processors for ad hoc runs that must not touch the poller's state.
    pub processor_factory: ProcessorFactory,
    pub directory: Arc<EntityDirectory>,
    pub db: SharedDatabase,
    pub handler: Arc<ErrorHandler>,
    pub status: Arc<StatusBoard>,
    pub metrics: Arc<Metrics>,
}

enum Step {
    Advance,
    Skipped,
    Rewind(u64),
}

pub struct BlockPoller {
    services: Services,
    interval: Duration,
    start_height: Option<u64>,
    max_blocks_per_cycle: u64,
    next_height: Option<u64>,
    mempool: MempoolAnalyzer,
    reorg: ReorgDetector,
    history: HistoryTracker,
}

impl BlockPoller {
    pub fn new(config: &PipelineConfig, services: Services) -> Self {
        Self {
            services,
            interval: config.poll_interval(),
            start_height: config.start_height,
            max_blocks_per_cycle: config.max_blocks_per_cycle.max(1),
            next_height: None,
            mempool: MempoolAnalyzer::new(config.mempool_window),
            reorg: ReorgDetector::new(config.reorg_depth),
            history: HistoryTracker::new(config.mempool_window),
        }
    }

    /// Height the next cycle starts from, once known.
    pub fn next_height(&self) -> Option<u64> {
        self.next_height
    }

    /// Poll until `cancel` fires. A failed cycle is logged and retried on the next tick.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "block poller started");
        loop {
            match self.poll_once().await {
                Ok(0) => debug!("no new blocks"),
                Ok(n) => debug!(blocks = n, "poll cycle complete"),
                Err(e) => warn!("poll cycle failed: {e}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("block poller stopped");
    }

    /// One cycle: process up to `max_blocks_per_cycle` heights towards the tip.
    /// Returns the number of blocks run through the pipeline.
    pub async fn poll_once(&mut self) -> Result<usize, PipelineError> {
        let connector = self.services.connector.clone();
        let tip = self
            .fetch("get_current_height", || {
                let connector = connector.clone();
                async move { connector.get_current_height().await }
            })
            .await?;
        let mut next = self
            .next_height
            .or(self.start_height)
            .unwrap_or(tip);
        if next > tip {
            return Ok(0);
        }
        let last = tip.min(next + self.max_blocks_per_cycle - 1);

        let mut processed = 0;
        while next <= last {
            match self.process_height(next).await {
                Ok(Step::Advance) => {
                    processed += 1;
                    next += 1;
                }
                Ok(Step::Skipped) => next += 1,
                Ok(Step::Rewind(resume_height)) => {
                    self.next_height = Some(resume_height);
                    return Ok(processed);
                }
                Err(e) => {
                    self.next_height = Some(next);
                    return Err(e);
                }
            }
            self.next_height = Some(next);
        }
        Ok(processed)
    }

    /// Node call with the shared retry policy applied.
    async fn fetch<T, F, Fut>(&self, name: &str, call: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        self.services
            .handler
            .retry_with_backoff(call, name, "poll")
            .await
            .map_err(|e| PipelineError::TransientIo(e.to_string()))
    }

    async fn process_height(&mut self, height: u64) -> Result<Step, PipelineError> {
        let connector = self.services.connector.clone();
        let raw = self
            .fetch("get_block", || {
                let connector = connector.clone();
                async move { connector.get_block(height).await }
            })
            .await?;
        let block = match self.services.normalizer.normalize_block(&raw) {
            Ok(block) => block,
            Err(e) => {
                let err = PipelineError::from(e);
                warn!(height, source = %raw.source, "skipping block: {err}");
                self.services.metrics.blocks_skipped.inc();
                return Ok(Step::Skipped);
            }
        };

        if let Some(resume_height) = self.check_reorg(&block).await? {
            self.history.rewind(resume_height);
            self.services.orchestrator.rewind(resume_height);
            return Ok(Step::Rewind(resume_height));
        }

        let anomalies = self.observe_mempool().await;
        let history = Arc::new(self.history.snapshot(anomalies));
        let block = Arc::new(block);
        let result = self
            .services
            .orchestrator
            .process_new_block(block.clone(), history)
            .await;
        self.services.status.record_run(&result);

        let store = Arc::new(self.services.db.clone());
        if let Err(e) =
            persist_block(store, &self.services.handler, block.clone(), &result.correlation_id).await
        {
            warn!(height, "failed to store block: {e}");
        }
        if !block.limited_detail {
            let snapshot = self.services.directory.snapshot();
            let net_flow = net_exchange_flow_btc(&block, &snapshot);
            self.history
                .record_block(block.height, block.timestamp, net_flow, block.fees_total);
        }
        self.services.metrics.latest_height.set(height as i64);
        self.services.status.set_latest_height(height);
        Ok(Step::Advance)
    }

    /// Resume height when `block` reveals a genuine reorg. Stored hashes are
    /// checked against the node's current chain to size the fork.
    async fn check_reorg(&mut self, block: &Block) -> Result<Option<u64>, PipelineError> {
        let link = HeaderLink {
            height: block.height,
            hash: block.hash.clone(),
            prev_hash: block.prev_hash.clone(),
        };
        let connector = self.services.connector.clone();
        let handler = self.services.handler.clone();
        let check = self
            .reorg
            .check(link, |h| {
                let connector = connector.clone();
                let handler = handler.clone();
                async move {
                    handler
                        .retry_with_backoff(
                            || {
                                let connector = connector.clone();
                                async move { connector.get_block_hash(h).await }
                            },
                            "get_block_hash",
                            "reorg",
                        )
                        .await
                }
            })
            .await
            .map_err(|e| PipelineError::TransientIo(e.to_string()))?;

        match check {
            ReorgCheck::Linked => Ok(None),
            ReorgCheck::TipReplaced { height } => {
                warn!(height, hash = %block.hash, "tip replaced");
                Ok(None)
            }
            ReorgCheck::Reorg {
                height,
                depth,
                resume_height,
                severity,
            } => {
                self.services.metrics.reorgs.inc();
                let err = PipelineError::ReorgDetected {
                    height,
                    depth,
                    resume_height,
                };
                match severity {
                    ReorgSeverity::Critical => error!(severity = "critical", "{err}"),
                    ReorgSeverity::Emergency => error!(severity = "emergency", "{err}"),
                }
                self.services.status.record_reorg(ReorgEvent {
                    height,
                    depth,
                    resume_height,
                    severity,
                    detected_at: Utc::now(),
                });
                Ok(Some(resume_height))
            }
        }
    }

    async fn observe_mempool(&mut self) -> Vec<super::mempool::Anomaly> {
        let summary = match self.services.connector.get_mempool_summary().await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("mempool summary unavailable: {e}");
                // a stale reading must not join the series under this block
                self.history.clear_mempool();
                return Vec::new();
            }
        };
        let snapshot = MempoolSnapshot::from_summary(&summary, Utc::now());
        let anomalies = self.mempool.update(&snapshot);
        for anomaly in &anomalies {
            self.services.metrics.record_anomaly(anomaly.kind.as_str());
            warn!(
                kind = anomaly.kind.as_str(),
                value = anomaly.value,
                threshold = anomaly.threshold,
                "mempool anomaly"
            );
        }
        self.history.observe_mempool(snapshot);
        anomalies
    }
}
