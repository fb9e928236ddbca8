use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub bitcoin: BitcoinConfig,
    pub pipeline: PipelineConfig,
    pub signals: SignalConfig,
    pub processors: ProcessorsConfig,
    pub retry: RetryConfig,
    pub persistence: PersistenceConfig,
    pub entities: EntityConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BitcoinConfig {
    pub rpc_host: String,
    pub rpc_port: u16,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    /// One of "bitcoin", "testnet", "testnet4", "signet", "regtest".
    pub network: String,
    /// Esplora-style REST base URL used when the node is unreachable.
    pub fallback_url: Option<String>,
    pub max_failures: u32,
    pub request_timeout_secs: u64,
    /// Minimum time spent on the fallback before probing the node again. 0 disables.
    pub fallback_min_dwell_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub poll_interval_secs: u64,
    pub realtime_window_hours: u64,
    /// Mempool anomaly window, in samples.
    pub mempool_window: usize,
    pub reorg_depth: usize,
    /// First height to process. Defaults to the current tip.
    pub start_height: Option<u64>,
    pub max_blocks_per_cycle: u64,
    pub processor_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SignalConfig {
    pub whale_threshold_btc: f64,
    pub whale_lookback_days: i64,
    /// Net exchange flow (BTC) that maps to 0.5 magnitude confidence.
    pub exchange_min_flow_btc: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProcessorConfig {
    pub enabled: bool,
    pub confidence_threshold: f64,
    /// Rolling window in seconds. 0 means `realtime_window_hours`.
    pub time_window_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProcessorsConfig {
    pub mempool: ProcessorConfig,
    pub exchange: ProcessorConfig,
    pub miner: ProcessorConfig,
    pub whale: ProcessorConfig,
    pub treasury: ProcessorConfig,
    pub predictive: ProcessorConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PersistenceConfig {
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EntityConfig {
    pub reload_interval_secs: u64,
    /// JSON list of entities upserted into the store at start-up.
    pub seed_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for BitcoinConfig {
    fn default() -> Self {
        Self {
            rpc_host: "127.0.0.1".into(),
            rpc_port: 8332,
            rpc_user: None,
            rpc_password: None,
            network: "bitcoin".into(),
            fallback_url: Some("https://blockstream.info/api".into()),
            max_failures: 3,
            request_timeout_secs: 30,
            fallback_min_dwell_secs: 0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            realtime_window_hours: 24,
            mempool_window: 144,
            reorg_depth: 10,
            start_height: None,
            max_blocks_per_cycle: 10,
            processor_timeout_secs: 30,
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            whale_threshold_btc: 1000.0,
            whale_lookback_days: 30,
            exchange_min_flow_btc: 100.0,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.5,
            time_window_secs: 0,
        }
    }
}

impl ProcessorConfig {
    fn with_threshold(confidence_threshold: f64) -> Self {
        Self {
            confidence_threshold,
            ..Self::default()
        }
    }

    /// Effective rolling window, falling back to the pipeline-wide realtime window.
    pub fn window(&self, realtime_window_hours: u64) -> chrono::Duration {
        if self.time_window_secs > 0 {
            chrono::Duration::seconds(self.time_window_secs as i64)
        } else {
            chrono::Duration::hours(realtime_window_hours as i64)
        }
    }
}

impl Default for ProcessorsConfig {
    fn default() -> Self {
        Self {
            mempool: ProcessorConfig::with_threshold(0.6),
            exchange: ProcessorConfig::with_threshold(0.6),
            miner: ProcessorConfig::with_threshold(0.5),
            whale: ProcessorConfig::with_threshold(0.5),
            treasury: ProcessorConfig::with_threshold(0.5),
            predictive: ProcessorConfig::with_threshold(0.5),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { batch_size: 500 }
    }
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            reload_interval_secs: 300,
            seed_path: Some("data/entities.json".into()),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/chainsignal.db".into(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:8080".into(),
        }
    }
}

impl BitcoinConfig {
    pub fn network(&self) -> bitcoin::Network {
        match self.network.as_str() {
            // testnet4 shares testnet's address encoding
            "testnet" | "testnet3" | "testnet4" => bitcoin::Network::Testnet,
            "signet" => bitcoin::Network::Signet,
            "regtest" => bitcoin::Network::Regtest,
            _ => bitcoin::Network::Bitcoin,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn processor_timeout(&self) -> Duration {
        Duration::from_secs(self.processor_timeout_secs.max(1))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }
        match Self::try_load(path) {
            Ok(config) => {
                tracing::info!("Config loaded from {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!("{e}, using defaults");
                Self::default()
            }
        }
    }

    pub fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.pipeline.mempool_window, 144);
        assert_eq!(config.pipeline.reorg_depth, 10);
        assert_eq!(config.bitcoin.max_failures, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.entities.reload_interval_secs, 300);
        assert_eq!(config.signals.whale_threshold_btc, 1000.0);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::parse(
            r#"
            [pipeline]
            poll_interval_secs = 5

            [processors.whale]
            enabled = false
            confidence_threshold = 0.8
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.poll_interval_secs, 5);
        assert_eq!(config.pipeline.mempool_window, 144);
        assert!(!config.processors.whale.enabled);
        assert_eq!(config.processors.whale.confidence_threshold, 0.8);
        assert!(config.processors.exchange.enabled);
    }

    #[test]
    fn window_falls_back_to_realtime_hours() {
        let cfg = ProcessorConfig::default();
        assert_eq!(cfg.window(24), chrono::Duration::hours(24));
        let cfg = ProcessorConfig {
            time_window_secs: 600,
            ..ProcessorConfig::default()
        };
        assert_eq!(cfg.window(24), chrono::Duration::seconds(600));
    }

    #[test]
    fn network_names() {
        let mut cfg = BitcoinConfig::default();
        assert_eq!(cfg.network(), bitcoin::Network::Bitcoin);
        cfg.network = "regtest".into();
        assert_eq!(cfg.network(), bitcoin::Network::Regtest);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/chainsignal.toml");
        assert_eq!(config.server.bind, "0.0.0.0:8080");
    }

    #[test]
    fn invalid_file_reports_parse_error() {
        let path = std::env::temp_dir().join(format!("chainsignal_bad_{}.toml", std::process::id()));
        std::fs::write(&path, "[pipeline\npoll_interval_secs = ").unwrap();
        let err = Config::try_load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(Config::load(&path).pipeline.poll_interval_secs, 30);
        let _ = std::fs::remove_file(&path);
    }
}
