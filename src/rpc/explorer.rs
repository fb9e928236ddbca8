//! Esplora-style public REST API, used as the fallback source.
//!
//! Esplora serves headers cheaply but per-transaction detail only page by
//! page, so blocks from here carry `limited_detail` and no transactions.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{BlockSource, RpcError};
use crate::core::{MempoolSummary, RawBlock};

pub struct ExplorerClient {
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct EsploraBlock {
    id: String,
    height: u64,
    timestamp: i64,
    #[serde(default)]
    tx_count: usize,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    weight: u64,
    #[serde(default)]
    previousblockhash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EsploraMempool {
    count: u64,
    vsize: u64,
    #[serde(default)]
    total_fee: u64,
    /// `[fee_rate, vsize]` buckets, highest rate first.
    #[serde(default)]
    fee_histogram: Vec<(f64, u64)>,
}

impl ExplorerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RpcError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get_text(&self, path: &str) -> Result<String, RpcError> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RpcError::Status(resp.status().as_u16()));
        }
        Ok(resp.text().await?.trim().to_string())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RpcError> {
        let body = self.get_text(path).await?;
        serde_json::from_str(&body).map_err(|e| RpcError::Parse(format!("{path}: {e}")))
    }
}

/// Node-shaped header payload, so the normalizer sees one format.
fn header_payload(block: EsploraBlock) -> serde_json::Value {
    json!({
        "hash": block.id,
        "height": block.height,
        "time": block.timestamp,
        "size": block.size,
        "weight": block.weight,
        "nTx": block.tx_count,
        "previousblockhash": block.previousblockhash,
        "tx": [],
    })
}

/// Expand the histogram into one sample per bucket, weighted by its share of
/// the mempool in 1000 vB units (at least one sample per bucket).
fn histogram_rates(histogram: &[(f64, u64)]) -> Vec<f64> {
    let mut rates = Vec::new();
    for &(rate, vsize) in histogram {
        let weight = (vsize / 1000).max(1) as usize;
        rates.extend(std::iter::repeat_n(rate, weight));
    }
    rates
}

#[async_trait]
impl BlockSource for ExplorerClient {
    fn name(&self) -> &str {
        "esplora"
    }

    async fn tip_height(&self) -> Result<u64, RpcError> {
        let body = self.get_text("/blocks/tip/height").await?;
        body.parse()
            .map_err(|_| RpcError::Parse(format!("tip height {body:?}")))
    }

    async fn block_at(&self, height: u64) -> Result<RawBlock, RpcError> {
        let hash = self.get_text(&format!("/block-height/{height}")).await?;
        let block: EsploraBlock = self.get_json(&format!("/block/{hash}")).await?;
        Ok(RawBlock {
            payload: header_payload(block),
            limited_detail: true,
            source: self.name().to_string(),
        })
    }

    async fn block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.get_text(&format!("/block-height/{height}")).await
    }

    async fn mempool_summary(&self) -> Result<MempoolSummary, RpcError> {
        let mempool: EsploraMempool = self.get_json("/mempool").await?;
        Ok(MempoolSummary {
            size: mempool.count,
            bytes: mempool.vsize,
            total_fee: mempool.total_fee,
            fee_rates: histogram_rates(&mempool.fee_histogram),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::normalize::Normalizer;
    use bitcoin::Network;

    #[test]
    fn header_payload_normalizes_with_limited_detail() {
        let block: EsploraBlock = serde_json::from_value(json!({
            "id": "00000000000000000001c4",
            "height": 850001,
            "version": 536870912,
            "timestamp": 1718000600,
            "tx_count": 3120,
            "size": 1610000,
            "weight": 3993000,
            "merkle_root": "ab",
            "previousblockhash": "000000000000000000023a",
            "mediantime": 1717998000,
            "nonce": 1,
            "bits": 386089497,
            "difficulty": 1.0
        }))
        .unwrap();
        let raw = RawBlock {
            payload: header_payload(block),
            limited_detail: true,
            source: "esplora".into(),
        };
        let normalized = Normalizer::new(Network::Bitcoin).normalize_block(&raw).unwrap();
        assert!(normalized.limited_detail);
        assert!(normalized.transactions.is_empty());
        assert_eq!(normalized.tx_count, 3120);
        assert_eq!(normalized.prev_hash.as_deref(), Some("000000000000000000023a"));
    }

    #[test]
    fn histogram_expansion() {
        let rates = histogram_rates(&[(50.0, 2500), (10.0, 300)]);
        assert_eq!(rates, vec![50.0, 50.0, 10.0]);
    }

    #[test]
    fn base_url_trailing_slash() {
        let client = ExplorerClient::new("https://example.org/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url, "https://example.org/api");
    }
}
