use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{BlockSource, RpcError};
use crate::core::{MempoolSummary, RawBlock};
use crate::errors::Transient;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "failures", rename_all = "snake_case")]
pub enum ConnectorState {
    Primary,
    /// Consecutive primary failures, still below the switch threshold.
    Degraded(u32),
    Fallback,
}

impl ConnectorState {
    fn gauge_value(&self) -> i64 {
        match self {
            ConnectorState::Primary => 0,
            ConnectorState::Degraded(_) => 1,
            ConnectorState::Fallback => 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: ConnectorState,
    fallback_since: Option<Instant>,
}

/// Node access with failover from the primary node to a fallback source.
pub struct NodeConnector {
    primary: Arc<dyn BlockSource>,
    fallback: Option<Arc<dyn BlockSource>>,
    max_failures: u32,
    min_dwell: Duration,
    inner: Mutex<Inner>,
    metrics: Arc<Metrics>,
}

impl NodeConnector {
    pub fn new(
        primary: Arc<dyn BlockSource>,
        fallback: Option<Arc<dyn BlockSource>>,
        max_failures: u32,
        min_dwell: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            primary,
            fallback,
            max_failures: max_failures.max(1),
            min_dwell,
            inner: Mutex::new(Inner {
                state: ConnectorState::Primary,
                fallback_since: None,
            }),
            metrics,
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // state is a plain value; a poisoned guard still holds a usable one
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectorState) {
        inner.state = state;
        self.metrics.connector_state.set(state.gauge_value());
    }

    pub async fn get_current_height(&self) -> Result<u64, RpcError> {
        self.dispatch("tip_height", |source| async move { source.tip_height().await })
            .await
    }

    pub async fn get_block(&self, height: u64) -> Result<RawBlock, RpcError> {
        self.dispatch("block_at", move |source| async move {
            source.block_at(height).await
        })
        .await
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.dispatch("block_hash", move |source| async move {
            source.block_hash(height).await
        })
        .await
    }

    pub async fn get_mempool_summary(&self) -> Result<MempoolSummary, RpcError> {
        self.dispatch("mempool_summary", |source| async move {
            source.mempool_summary().await
        })
        .await
    }

    async fn dispatch<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, RpcError>
    where
        F: Fn(Arc<dyn BlockSource>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let (state, try_primary) = {
            let inner = self.lock();
            let dwelled = inner
                .fallback_since
                .is_none_or(|since| since.elapsed() >= self.min_dwell);
            (inner.state, dwelled)
        };

        let fallback = match (state, &self.fallback) {
            (ConnectorState::Fallback, Some(fallback)) => fallback.clone(),
            _ => {
                return match call(self.primary.clone()).await {
                    Ok(value) => {
                        self.record_success();
                        Ok(value)
                    }
                    Err(e) if e.is_transient() => {
                        self.record_failure(operation, &e);
                        Err(e)
                    }
                    // the node answered; a bad request says nothing about its health
                    Err(e) => Err(e),
                };
            }
        };

        if try_primary {
            match call(self.primary.clone()).await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) => debug!(operation, "primary still unavailable: {e}"),
            }
        }
        call(fallback).await
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != ConnectorState::Primary {
            info!(
                source = self.primary.name(),
                previous = ?inner.state,
                "primary node available again"
            );
            inner.fallback_since = None;
            self.set_state(&mut inner, ConnectorState::Primary);
        }
    }

    fn record_failure(&self, operation: &str, error: &RpcError) {
        let mut inner = self.lock();
        let failures = match inner.state {
            ConnectorState::Degraded(n) => n + 1,
            _ => 1,
        };
        match &self.fallback {
            Some(fallback) if failures >= self.max_failures => {
                warn!(
                    operation,
                    failures,
                    fallback = fallback.name(),
                    "primary node failing, switching to fallback: {error}"
                );
                inner.fallback_since = Some(Instant::now());
                self.set_state(&mut inner, ConnectorState::Fallback);
            }
            _ => {
                warn!(operation, failures, "primary node call failed: {error}");
                self.set_state(&mut inner, ConnectorState::Degraded(failures));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Scriptable in-memory source.
    pub(crate) struct StubSource {
        pub name: &'static str,
        pub failing: AtomicBool,
        /// Answer with a JSON-RPC error instead of a transport failure.
        pub rejecting: AtomicBool,
        pub calls: AtomicU32,
        pub tip: u64,
    }

    impl StubSource {
        pub(crate) fn new(name: &'static str, tip: u64) -> Arc<Self> {
            Arc::new(Self {
                name,
                failing: AtomicBool::new(false),
                rejecting: AtomicBool::new(false),
                calls: AtomicU32::new(0),
                tip,
            })
        }

        fn attempt(&self) -> Result<(), RpcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(RpcError::Status(503))
            } else if self.rejecting.load(Ordering::SeqCst) {
                Err(RpcError::Rpc {
                    code: -8,
                    message: "Block height out of range".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl BlockSource for StubSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn tip_height(&self) -> Result<u64, RpcError> {
            self.attempt()?;
            Ok(self.tip)
        }

        async fn block_at(&self, height: u64) -> Result<RawBlock, RpcError> {
            self.attempt()?;
            Ok(RawBlock {
                payload: json!({"hash": format!("{}-{height}", self.name), "height": height, "time": 1718000000}),
                limited_detail: self.name == "fallback",
                source: self.name.to_string(),
            })
        }

        async fn block_hash(&self, height: u64) -> Result<String, RpcError> {
            self.attempt()?;
            Ok(format!("{}-{height}", self.name))
        }

        async fn mempool_summary(&self) -> Result<MempoolSummary, RpcError> {
            self.attempt()?;
            Ok(MempoolSummary::default())
        }
    }

    fn connector(primary: &Arc<StubSource>, fallback: Option<&Arc<StubSource>>) -> NodeConnector {
        NodeConnector::new(
            primary.clone(),
            fallback.map(|f| f.clone() as Arc<dyn BlockSource>),
            3,
            Duration::ZERO,
            Arc::new(Metrics::default()),
        )
    }

    #[tokio::test]
    async fn switches_to_fallback_on_third_failure() {
        let primary = StubSource::new("primary", 100);
        let fallback = StubSource::new("fallback", 99);
        let conn = connector(&primary, Some(&fallback));
        primary.failing.store(true, Ordering::SeqCst);

        assert!(conn.get_current_height().await.is_err());
        assert_eq!(conn.state(), ConnectorState::Degraded(1));
        assert!(conn.get_current_height().await.is_err());
        assert!(conn.get_current_height().await.is_err());
        assert_eq!(conn.state(), ConnectorState::Fallback);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);

        // next call tries the primary, then is served by the fallback
        assert_eq!(conn.get_current_height().await.unwrap(), 99);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 4);
        let block = conn.get_block(5).await.unwrap();
        assert!(block.limited_detail);
    }

    #[tokio::test]
    async fn reverts_when_primary_recovers() {
        let primary = StubSource::new("primary", 100);
        let fallback = StubSource::new("fallback", 99);
        let conn = connector(&primary, Some(&fallback));
        primary.failing.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            let _ = conn.get_current_height().await;
        }
        assert_eq!(conn.state(), ConnectorState::Fallback);

        primary.failing.store(false, Ordering::SeqCst);
        assert_eq!(conn.get_current_height().await.unwrap(), 100);
        assert_eq!(conn.state(), ConnectorState::Primary);
        assert_eq!(conn.metrics.connector_state.get(), 0);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let primary = StubSource::new("primary", 100);
        let fallback = StubSource::new("fallback", 99);
        let conn = connector(&primary, Some(&fallback));
        primary.failing.store(true, Ordering::SeqCst);
        let _ = conn.get_current_height().await;
        let _ = conn.get_current_height().await;
        primary.failing.store(false, Ordering::SeqCst);
        conn.get_current_height().await.unwrap();
        assert_eq!(conn.state(), ConnectorState::Primary);
    }

    #[tokio::test]
    async fn stays_degraded_without_fallback() {
        let primary = StubSource::new("primary", 100);
        let conn = connector(&primary, None);
        primary.failing.store(true, Ordering::SeqCst);
        for _ in 0..5 {
            assert!(conn.get_block(1).await.is_err());
        }
        assert_eq!(conn.state(), ConnectorState::Degraded(5));
    }

    #[tokio::test]
    async fn dwell_holds_off_primary_attempts() {
        let primary = StubSource::new("primary", 100);
        let fallback = StubSource::new("fallback", 99);
        let conn = NodeConnector::new(
            primary.clone(),
            Some(fallback.clone()),
            1,
            Duration::from_secs(3600),
            Arc::new(Metrics::default()),
        );
        primary.failing.store(true, Ordering::SeqCst);
        let _ = conn.get_current_height().await;
        primary.failing.store(false, Ordering::SeqCst);

        assert_eq!(conn.get_current_height().await.unwrap(), 99);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectorState::Fallback);
    }

    #[tokio::test]
    async fn rejected_requests_do_not_trigger_failover() {
        let primary = StubSource::new("primary", 100);
        let fallback = StubSource::new("fallback", 99);
        let conn = connector(&primary, Some(&fallback));
        primary.rejecting.store(true, Ordering::SeqCst);
        for _ in 0..5 {
            assert!(conn.get_block(900_000).await.is_err());
        }
        assert_eq!(conn.state(), ConnectorState::Primary);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }
}
