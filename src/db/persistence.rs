use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

use super::{SharedDatabase, StoreError};
use crate::core::Block;
use crate::errors::{ErrorHandler, RetryError};
use crate::signals::Signal;

/// Fresh random (v4) signal identifier.
pub fn generate_signal_id() -> String {
    Uuid::new_v4().to_string()
}

/// Destination for signal batches.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn insert_signals(&self, signals: &[Signal]) -> Result<usize, StoreError>;
}

#[async_trait]
impl SignalStore for SharedDatabase {
    async fn insert_signals(&self, signals: &[Signal]) -> Result<usize, StoreError> {
        let batch = signals.to_vec();
        self.blocking(move |db| db.insert_signals(&batch)).await
    }
}

/// Destination for normalized blocks.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn store_block(&self, block: Arc<Block>) -> Result<(), StoreError>;
}

#[async_trait]
impl BlockStore for SharedDatabase {
    async fn store_block(&self, block: Arc<Block>) -> Result<(), StoreError> {
        self.store_block_async(block).await
    }
}

/// Write `block`, retrying transient store failures.
pub async fn persist_block(
    store: Arc<dyn BlockStore>,
    handler: &ErrorHandler,
    block: Arc<Block>,
    correlation_id: &str,
) -> Result<(), RetryError> {
    handler
        .retry_with_backoff(
            || {
                let store = store.clone();
                let block = block.clone();
                async move { store.store_block(block).await }
            },
            "store_block",
            correlation_id,
        )
        .await
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PersistOutcome {
    pub success: bool,
    /// Signals durably written.
    pub count: usize,
    pub error: Option<String>,
}

/// Batched, retried writes of pipeline output.
#[derive(Clone)]
pub struct SignalPersistence {
    store: Arc<dyn SignalStore>,
    handler: Arc<ErrorHandler>,
    batch_size: usize,
}

impl SignalPersistence {
    pub fn new(store: Arc<dyn SignalStore>, handler: Arc<ErrorHandler>, batch_size: usize) -> Self {
        Self {
            store,
            handler,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn persist_signals(&self, signals: &[Signal], correlation_id: &str) -> PersistOutcome {
        if signals.is_empty() {
            return PersistOutcome {
                success: true,
                count: 0,
                error: None,
            };
        }

        let mut written = 0;
        for batch in signals.chunks(self.batch_size) {
            let result = self
                .handler
                .retry_with_backoff(
                    || {
                        let store = self.store.clone();
                        async move { store.insert_signals(batch).await }
                    },
                    "persist_signals",
                    correlation_id,
                )
                .await;
            match result {
                Ok(n) => written += n,
                Err(e) => {
                    self.handler.metrics().persistence_failures.inc();
                    error!(%correlation_id, written, pending = signals.len() - written, "signal persistence failed: {e}");
                    return PersistOutcome {
                        success: false,
                        count: written,
                        error: Some(e.to_string()),
                    };
                }
            }
        }
        debug!(%correlation_id, count = written, "signals persisted");
        PersistOutcome {
            success: true,
            count: written,
            error: None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::metrics::Metrics;
    use crate::signals::SignalType;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `fail_first` calls, then records batches.
    pub(crate) struct FlakyStore {
        pub fail_first: u32,
        pub calls: AtomicU32,
        pub batches: Mutex<Vec<usize>>,
    }

    impl FlakyStore {
        pub(crate) fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                calls: AtomicU32::new(0),
                batches: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SignalStore for FlakyStore {
        async fn insert_signals(&self, signals: &[Signal]) -> Result<usize, StoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.batches.lock().unwrap().push(signals.len());
            Ok(signals.len())
        }
    }

    #[async_trait]
    impl BlockStore for FlakyStore {
        async fn store_block(&self, _block: Arc<Block>) -> Result<(), StoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(StoreError::Unavailable("database is locked".into()));
            }
            Ok(())
        }
    }

    pub(crate) fn handler() -> Arc<ErrorHandler> {
        Arc::new(ErrorHandler::new(
            &RetryConfig {
                max_retries: 3,
                base_delay_ms: 1,
            },
            Arc::new(Metrics::default()),
        ))
    }

    fn signals(n: usize) -> Vec<Signal> {
        (0..n)
            .map(|i| Signal::new(SignalType::WhaleTransfer, i as u64, 0.7, json!({})))
            .collect()
    }

    #[test]
    fn ids_are_uuid_v4() {
        let id = generate_signal_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('-').count(), 4);
        assert_eq!(Uuid::parse_str(&id).unwrap().get_version_num(), 4);
        assert_ne!(id, generate_signal_id());
    }

    #[tokio::test]
    async fn empty_input_skips_store() {
        let store = FlakyStore::new(0);
        let p = SignalPersistence::new(store.clone(), handler(), 500);
        let outcome = p.persist_signals(&[], "cid").await;
        assert!(outcome.success);
        assert_eq!(outcome.count, 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_until_store_recovers() {
        let store = FlakyStore::new(2);
        let p = SignalPersistence::new(store.clone(), handler(), 500);
        let outcome = p.persist_signals(&signals(4), "cid").await;
        assert!(outcome.success);
        assert_eq!(outcome.count, 4);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_failure() {
        let store = FlakyStore::new(10);
        let h = handler();
        let p = SignalPersistence::new(store.clone(), h.clone(), 500);
        let outcome = p.persist_signals(&signals(2), "cid").await;
        assert!(!outcome.success);
        assert_eq!(outcome.count, 0);
        assert!(outcome.error.unwrap().contains("3 attempts"));
        assert_eq!(h.metrics().persistence_failures.get(), 1);
    }

    #[tokio::test]
    async fn writes_in_batches() {
        let store = FlakyStore::new(0);
        let p = SignalPersistence::new(store.clone(), handler(), 2);
        let outcome = p.persist_signals(&signals(5), "cid").await;
        assert_eq!(outcome.count, 5);
        assert_eq!(*store.batches.lock().unwrap(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn sqlite_store_accepts_batches() {
        let db = crate::db::tests::temp_db();
        let p = SignalPersistence::new(Arc::new(db.clone()), handler(), 2);
        let outcome = p.persist_signals(&signals(3), "cid").await;
        assert!(outcome.success);
        assert_eq!(db.signal_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn block_write_survives_a_locked_store() {
        let store = FlakyStore::new(1);
        let block = Arc::new(crate::signals::tests::sample_block());
        persist_block(store.clone(), &handler(), block, "cid").await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);

        let store = FlakyStore::new(10);
        let block = Arc::new(crate::signals::tests::sample_block());
        let err = persist_block(store.clone(), &handler(), block, "cid").await.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn sqlite_store_accepts_blocks() {
        let db = crate::db::tests::temp_db();
        let block = Arc::new(crate::signals::tests::sample_block());
        persist_block(Arc::new(db.clone()), &handler(), block, "cid").await.unwrap();
        assert_eq!(db.latest_block_height().unwrap(), Some(850_000));
    }
}
