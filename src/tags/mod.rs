use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hex::FromHex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::Transaction;
use crate::db::StoreError;
use crate::errors::{ErrorHandler, RetryError};
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Exchange,
    MiningPool,
    Treasury,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Exchange => "exchange",
            EntityType::MiningPool => "mining_pool",
            EntityType::Treasury => "treasury",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exchange" => Some(EntityType::Exchange),
            "mining_pool" => Some(EntityType::MiningPool),
            "treasury" => Some(EntityType::Treasury),
            _ => None,
        }
    }
}

/// A known on-chain actor and the addresses attributed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub name: String,
    pub entity_type: EntityType,
    pub addresses: Vec<String>,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl Entity {
    /// `metadata.coinbase_tags`, for mining pools.
    pub fn coinbase_tags(&self) -> Vec<String> {
        self.metadata
            .get("coinbase_tags")
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str())
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `metadata.holdings_btc`, for treasuries that disclose it.
    pub fn holdings_btc(&self) -> Option<f64> {
        self.metadata
            .get("holdings_btc")
            .and_then(|v| v.as_f64())
            .filter(|h| *h > 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMatchMethod {
    CoinbaseTag,
    Address,
}

#[derive(Debug, Clone)]
pub struct PoolMatch {
    pub entity: Arc<Entity>,
    pub method: PoolMatchMethod,
}

/// Source of entity records.
#[async_trait]
pub trait EntityLoader: Send + Sync {
    async fn load_entities(&self) -> Result<Vec<Entity>, StoreError>;
}

/// Immutable lookup tables built from one load.
#[derive(Debug, Default)]
pub struct DirectorySnapshot {
    by_address: HashMap<String, Arc<Entity>>,
    entities: Vec<Arc<Entity>>,
}

impl DirectorySnapshot {
    pub fn build(entities: Vec<Entity>) -> Self {
        let mut by_address: HashMap<String, Arc<Entity>> = HashMap::new();
        let mut kept = Vec::with_capacity(entities.len());
        for entity in entities {
            if entity.addresses.is_empty() {
                warn!(entity_id = %entity.entity_id, "entity has no addresses, skipped");
                continue;
            }
            let entity = Arc::new(entity);
            for address in &entity.addresses {
                match by_address.entry(address.clone()) {
                    Entry::Occupied(existing) => {
                        warn!(
                            address = %address,
                            kept = %existing.get().entity_id,
                            ignored = %entity.entity_id,
                            "address claimed by two entities"
                        );
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(entity.clone());
                    }
                }
            }
            kept.push(entity);
        }
        Self {
            by_address,
            entities: kept,
        }
    }

    pub fn address_count(&self) -> usize {
        self.by_address.len()
    }

    pub fn entity(&self, address: &str) -> Option<&Arc<Entity>> {
        self.by_address.get(address)
    }

    pub fn of_type(&self, entity_type: EntityType) -> impl Iterator<Item = &Arc<Entity>> {
        self.entities
            .iter()
            .filter(move |e| e.entity_type == entity_type)
    }

    pub fn identify_treasury(&self, address: &str) -> Option<&Arc<Entity>> {
        self.entity(address)
            .filter(|e| e.entity_type == EntityType::Treasury)
    }

    /// Match coinbase script text against pool tags and names, then fall back
    /// to the addresses the coinbase pays.
    pub fn identify_mining_pool(&self, coinbase: &Transaction) -> Option<PoolMatch> {
        let script_text = coinbase_text(coinbase);
        if !script_text.is_empty() {
            for pool in self.of_type(EntityType::MiningPool) {
                let mut needles = pool.coinbase_tags();
                needles.push(pool.name.clone());
                let hit = needles
                    .iter()
                    .map(|n| n.to_lowercase())
                    .any(|n| !n.is_empty() && script_text.contains(&n));
                if hit {
                    return Some(PoolMatch {
                        entity: pool.clone(),
                        method: PoolMatchMethod::CoinbaseTag,
                    });
                }
            }
        }

        coinbase
            .outputs
            .iter()
            .flat_map(|o| o.addresses.iter())
            .filter_map(|a| self.entity(a))
            .find(|e| e.entity_type == EntityType::MiningPool)
            .map(|entity| PoolMatch {
                entity: entity.clone(),
                method: PoolMatchMethod::Address,
            })
    }
}

/// Coinbase script bytes rendered as lowercase text.
fn coinbase_text(coinbase: &Transaction) -> String {
    coinbase
        .inputs
        .first()
        .and_then(|input| input.coinbase_data.as_deref())
        .and_then(|hex| Vec::<u8>::from_hex(hex).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).to_lowercase())
        .unwrap_or_default()
}

/// Address → entity directory, refreshed in the background by swapping in
/// a freshly built snapshot.
pub struct EntityDirectory {
    snapshot: RwLock<Arc<DirectorySnapshot>>,
    metrics: Arc<Metrics>,
}

impl EntityDirectory {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(DirectorySnapshot::default())),
            metrics,
        }
    }

    /// Current snapshot. Callers keep it for the duration of one unit of work.
    pub fn snapshot(&self) -> Arc<DirectorySnapshot> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, entities: Vec<Entity>) {
        let fresh = Arc::new(DirectorySnapshot::build(entities));
        self.metrics
            .entity_cache_size
            .set(fresh.address_count() as i64);
        let mut guard = match self.snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = fresh;
    }

    /// Reload from `loader`. On failure the previous snapshot stays active.
    pub async fn refresh(&self, loader: &dyn EntityLoader) -> Result<usize, StoreError> {
        let entities = loader.load_entities().await?;
        let count = entities.len();
        self.replace(entities);
        debug!(entities = count, "entity directory refreshed");
        Ok(count)
    }

    /// [`refresh`](Self::refresh) with transient loader failures retried.
    pub async fn refresh_with_retry(
        &self,
        loader: &dyn EntityLoader,
        handler: &ErrorHandler,
    ) -> Result<usize, RetryError> {
        let entities = handler
            .retry_with_backoff(|| loader.load_entities(), "load_entities", "entity-refresh")
            .await?;
        let count = entities.len();
        self.replace(entities);
        debug!(entities = count, "entity directory refreshed");
        Ok(count)
    }

    pub fn identify_entity(&self, address: &str) -> Option<Arc<Entity>> {
        self.snapshot().entity(address).cloned()
    }

    pub fn identify_mining_pool(&self, coinbase: &Transaction) -> Option<PoolMatch> {
        self.snapshot().identify_mining_pool(coinbase)
    }

    pub fn identify_treasury(&self, address: &str) -> Option<Arc<Entity>> {
        self.snapshot().identify_treasury(address).cloned()
    }

    /// Periodic reload until `cancel` fires.
    pub fn spawn_refresh(
        self: Arc<Self>,
        loader: Arc<dyn EntityLoader>,
        handler: Arc<ErrorHandler>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = self.refresh_with_retry(loader.as_ref(), &handler).await {
                    warn!("entity refresh failed, keeping previous snapshot: {e}");
                }
            }
            info!("entity refresh stopped");
        })
    }
}
