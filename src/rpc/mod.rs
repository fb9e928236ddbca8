pub mod connector;
pub mod explorer;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::BitcoinConfig;
use crate::core::{MempoolSummary, RawBlock, SATS_PER_BTC};
use crate::errors::Transient;

/// Upper bound on mempool entries folded into fee percentiles.
const MEMPOOL_FEE_SAMPLE: usize = 20_000;

/// Node is still loading its block index.
const RPC_IN_WARMUP: i64 = -28;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("unexpected response: {0}")]
    Parse(String),
}

impl Transient for RpcError {
    fn is_transient(&self) -> bool {
        match self {
            RpcError::Http(_) => true,
            RpcError::Status(code) => *code == 429 || *code >= 500,
            RpcError::Rpc { code, .. } => *code == RPC_IN_WARMUP,
            RpcError::Parse(_) => false,
        }
    }
}

/// Anything that can serve chain tip, blocks and mempool state.
#[async_trait]
pub trait BlockSource: Send + Sync {
    fn name(&self) -> &str;

    async fn tip_height(&self) -> Result<u64, RpcError>;

    async fn block_at(&self, height: u64) -> Result<RawBlock, RpcError>;

    /// Hash of the block the source currently has at `height`.
    async fn block_hash(&self, height: u64) -> Result<String, RpcError>;

    async fn mempool_summary(&self) -> Result<MempoolSummary, RpcError>;
}

/// Bitcoin Core JSON-RPC client.
pub struct BitcoinRpc {
    url: String,
    client: Client,
    auth: Option<String>, // base64 encoded user:pass
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct MempoolInfo {
    size: u64,
    bytes: u64,
    #[serde(default)]
    total_fee: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MempoolEntry {
    vsize: u64,
    fees: MempoolEntryFees,
}

#[derive(Debug, Deserialize)]
struct MempoolEntryFees {
    base: f64,
}

impl BitcoinRpc {
    pub fn new(config: &BitcoinConfig) -> Result<Self, RpcError> {
        use base64::{Engine, engine::general_purpose::STANDARD};
        let auth = match (&config.rpc_user, &config.rpc_password) {
            (Some(user), Some(pass)) => Some(STANDARD.encode(format!("{user}:{pass}"))),
            _ => None,
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            url: format!("http://{}:{}", config.rpc_host, config.rpc_port),
            client,
            auth,
        })
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "chainsignal",
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(auth) = &self.auth {
            request = request.header("Authorization", format!("Basic {auth}"));
        }
        let resp = request.send().await?;

        // Core answers RPC-level errors with 500 and a JSON body
        let status = resp.status();
        let json: Value = match resp.json().await {
            Ok(json) => json,
            Err(_) if !status.is_success() => return Err(RpcError::Status(status.as_u16())),
            Err(e) => return Err(e.into()),
        };

        if let Some(err) = json.get("error").filter(|e| !e.is_null()) {
            let err: RpcErrorBody = serde_json::from_value(err.clone())
                .map_err(|e| RpcError::Parse(format!("error body: {e}")))?;
            return Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        if !status.is_success() {
            return Err(RpcError::Status(status.as_u16()));
        }

        Ok(json.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn getblockcount(&self) -> Result<u64, RpcError> {
        self.call("getblockcount", vec![])
            .await?
            .as_u64()
            .ok_or_else(|| RpcError::Parse("getblockcount: not an integer".into()))
    }

    pub async fn getblockhash(&self, height: u64) -> Result<String, RpcError> {
        self.call("getblockhash", vec![json!(height)])
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Parse("getblockhash: not a string".into()))
    }

    /// Verbosity 3 includes `prevout` on every input.
    pub async fn getblock(&self, hash: &str, verbosity: u8) -> Result<Value, RpcError> {
        self.call("getblock", vec![json!(hash), json!(verbosity)]).await
    }

    /// Get mempool info (size, bytes, usage, fees).
    pub async fn getmempoolinfo(&self) -> Result<Value, RpcError> {
        self.call("getmempoolinfo", vec![]).await
    }

    pub async fn getrawmempool_verbose(&self) -> Result<Value, RpcError> {
        self.call("getrawmempool", vec![json!(true)]).await
    }
}

#[async_trait]
impl BlockSource for BitcoinRpc {
    fn name(&self) -> &str {
        "bitcoind"
    }

    async fn tip_height(&self) -> Result<u64, RpcError> {
        self.getblockcount().await
    }

    async fn block_at(&self, height: u64) -> Result<RawBlock, RpcError> {
        let hash = self.getblockhash(height).await?;
        let payload = self.getblock(&hash, 3).await?;
        Ok(RawBlock {
            payload,
            limited_detail: false,
            source: self.name().to_string(),
        })
    }

    async fn block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.getblockhash(height).await
    }

    async fn mempool_summary(&self) -> Result<MempoolSummary, RpcError> {
        let info: MempoolInfo = serde_json::from_value(self.getmempoolinfo().await?)
            .map_err(|e| RpcError::Parse(format!("getmempoolinfo: {e}")))?;
        let raw = self.getrawmempool_verbose().await?;
        let entries = raw
            .as_object()
            .ok_or_else(|| RpcError::Parse("getrawmempool: not an object".into()))?;

        let mut fee_rates = Vec::with_capacity(entries.len().min(MEMPOOL_FEE_SAMPLE));
        let mut summed_fee = 0u64;
        for value in entries.values() {
            let Ok(entry) = serde_json::from_value::<MempoolEntry>(value.clone()) else {
                continue;
            };
            let fee_sats = (entry.fees.base * SATS_PER_BTC).round() as u64;
            summed_fee += fee_sats;
            if entry.vsize > 0 && fee_rates.len() < MEMPOOL_FEE_SAMPLE {
                fee_rates.push(fee_sats as f64 / entry.vsize as f64);
            }
        }

        let total_fee = info
            .total_fee
            .map(|btc| (btc * SATS_PER_BTC).round() as u64)
            .unwrap_or(summed_fee);
        Ok(MempoolSummary {
            size: info.size,
            bytes: info.bytes,
            total_fee,
            fee_rates,
        })
    }
}
