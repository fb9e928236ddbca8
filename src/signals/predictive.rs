//! Short-horizon forecasts derived from the historical series.
//!
//! Two outputs, each suppressed below [`MIN_CONFIDENCE`]:
//!
//! * `fee_forecast`: simple exponential smoothing of the fee-rate series with
//!   the current mempool reading appended. The spread of one-step-ahead
//!   residuals gives a 95 % interval and the confidence `1 / (1 + σ/forecast)`.
//! * `liquidity_pressure`: the block's net exchange flow as a z-score against
//!   past blocks. Net inflow to exchanges reads as sell-side pressure.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;

use super::exchange::net_exchange_flow_btc;
use super::score::{saturate, z_score};
use super::{ProcessingContext, ProcessorError, Signal, SignalProcessor, SignalType};
use crate::config::ProcessorConfig;
use crate::core::Block;
use crate::core::history::HistoricalData;
use crate::core::mempool::{MIN_SAMPLES, mean_std};
use crate::tags::EntityDirectory;

pub const SMOOTHING_ALPHA: f64 = 0.3;
pub const MIN_CONFIDENCE: f64 = 0.5;
const Z_95: f64 = 1.96;
/// Points needed before a forecast is attempted.
const MIN_FORECAST_POINTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct FeeForecast {
    pub forecast: f64,
    pub lower: f64,
    pub upper: f64,
    pub residual_std: f64,
    pub confidence: f64,
}

/// One-step-ahead forecast by exponential smoothing.
pub fn forecast_fee_rate(series: &[f64], alpha: f64) -> Option<FeeForecast> {
    if series.len() < MIN_FORECAST_POINTS {
        return None;
    }
    let mut level = series[0];
    let mut residuals = Vec::with_capacity(series.len() - 1);
    for &x in &series[1..] {
        residuals.push(x - level);
        level = alpha * x + (1.0 - alpha) * level;
    }
    let (_, residual_std) = mean_std(residuals)?;
    if level <= 0.0 {
        return None;
    }
    Some(FeeForecast {
        forecast: level,
        lower: (level - Z_95 * residual_std).max(0.0),
        upper: level + Z_95 * residual_std,
        residual_std,
        confidence: 1.0 / (1.0 + residual_std / level),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    Low,
    Medium,
    High,
}

impl PressureLevel {
    pub fn from_z(z: f64) -> Self {
        let z = z.abs();
        if z < 1.0 {
            PressureLevel::Low
        } else if z < 2.0 {
            PressureLevel::Medium
        } else {
            PressureLevel::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Low => "low",
            PressureLevel::Medium => "medium",
            PressureLevel::High => "high",
        }
    }
}

pub struct PredictiveProcessor {
    config: ProcessorConfig,
    window: Duration,
    directory: Arc<EntityDirectory>,
}

impl PredictiveProcessor {
    pub fn new(
        config: ProcessorConfig,
        realtime_window_hours: u64,
        directory: Arc<EntityDirectory>,
    ) -> Self {
        let window = config.window(realtime_window_hours);
        Self {
            config,
            window,
            directory,
        }
    }

    fn fee_forecast(&self, block: &Block, history: &HistoricalData) -> Option<Signal> {
        let mut series = history.fee_rates.clone();
        let current = history.mempool.as_ref().map(|m| m.avg_fee_rate);
        series.extend(current);
        let f = forecast_fee_rate(&series, SMOOTHING_ALPHA)?;
        if f.confidence < MIN_CONFIDENCE {
            return None;
        }
        Some(Signal::new(
            SignalType::FeeForecast,
            block.height,
            f.confidence,
            json!({
                "forecast_fee_rate": f.forecast,
                "lower_bound": f.lower,
                "upper_bound": f.upper,
                "residual_std": f.residual_std,
                "current_fee_rate": current,
                "alpha": SMOOTHING_ALPHA,
                "horizon_blocks": 1,
                "samples": series.len(),
            }),
        ))
    }

    fn liquidity_pressure(&self, block: &Block, history: &HistoricalData) -> Option<Signal> {
        if block.limited_detail {
            return None;
        }
        let snapshot = self.directory.snapshot();
        let net = net_exchange_flow_btc(block, &snapshot);
        let history = &history.exchange_net_flows;
        let z = z_score(net, history, MIN_SAMPLES)?;
        let confidence = saturate(z.abs(), 1.0);
        if confidence < MIN_CONFIDENCE {
            return None;
        }
        Some(Signal::new(
            SignalType::LiquidityPressure,
            block.height,
            confidence,
            json!({
                "net_flow_btc": net,
                "z_score": z,
                "pressure": PressureLevel::from_z(z).as_str(),
                "side": if net >= 0.0 { "sell" } else { "buy" },
                "samples": history.len(),
            }),
        ))
    }
}

#[async_trait]
impl SignalProcessor for PredictiveProcessor {
    fn name(&self) -> &'static str {
        "predictive"
    }

    fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    async fn process_block(
        &self,
        block: &Block,
        ctx: &ProcessingContext,
    ) -> Result<Vec<Signal>, ProcessorError> {
        let history = ctx.history.within(self.window, block.timestamp);
        Ok(self
            .fee_forecast(block, &history)
            .into_iter()
            .chain(self.liquidity_pressure(block, &history))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MempoolSnapshot;
    use crate::metrics::Metrics;
    use crate::signals::tests::{ctx, sample_block};
    use crate::tags::tests::sample_entities;
    use chrono::Utc;

    fn processor() -> PredictiveProcessor {
        let directory = Arc::new(EntityDirectory::new(Arc::new(Metrics::default())));
        directory.replace(sample_entities());
        PredictiveProcessor::new(ProcessorConfig::default(), 24, directory)
    }

    fn mempool(avg_fee_rate: f64) -> MempoolSnapshot {
        MempoolSnapshot {
            size: 1000,
            bytes: 250_000,
            total_fee: 0,
            avg_fee_rate,
            fee_percentiles: Default::default(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn flat_series_forecasts_itself() {
        let f = forecast_fee_rate(&[20.0; 10], SMOOTHING_ALPHA).unwrap();
        assert!((f.forecast - 20.0).abs() < 1e-12);
        assert_eq!(f.residual_std, 0.0);
        assert_eq!(f.confidence, 1.0);
        assert_eq!(f.lower, f.upper);
    }

    #[test]
    fn smoothing_follows_recurrence() {
        // level: 10 -> 0.3*20 + 0.7*10 = 13 -> 0.3*10 + 0.7*13 = 12.1
        let f = forecast_fee_rate(&[10.0, 20.0, 10.0], 0.3).unwrap();
        assert!((f.forecast - 12.1).abs() < 1e-12);
        // residuals 10 and -3: population sigma 6.5
        assert!((f.residual_std - 6.5).abs() < 1e-12);
        assert!(f.upper > f.forecast && f.lower < f.forecast);
        assert!(forecast_fee_rate(&[1.0, 2.0], 0.3).is_none());
    }

    #[test]
    fn pressure_buckets() {
        assert_eq!(PressureLevel::from_z(0.4), PressureLevel::Low);
        assert_eq!(PressureLevel::from_z(-1.5), PressureLevel::Medium);
        assert_eq!(PressureLevel::from_z(2.0), PressureLevel::High);
    }

    #[tokio::test]
    async fn stable_fees_yield_confident_forecast() {
        let history = HistoricalData {
            fee_rates: vec![20.0, 21.0, 20.0, 21.0, 20.0, 21.0],
            mempool: Some(mempool(20.5)),
            ..Default::default()
        };
        let signals = processor()
            .process_block(&sample_block(), &ctx(history))
            .await
            .unwrap();
        let forecast = signals
            .iter()
            .find(|s| s.signal_type == SignalType::FeeForecast)
            .unwrap();
        assert!(forecast.is_predictive);
        assert!(forecast.confidence >= MIN_CONFIDENCE);
        assert_eq!(forecast.metadata["current_fee_rate"], 20.5);
    }

    #[tokio::test]
    async fn volatile_fees_are_suppressed() {
        let history = HistoricalData {
            fee_rates: vec![1.0, 200.0, 1.0, 200.0, 1.0, 200.0],
            mempool: Some(mempool(1.0)),
            ..Default::default()
        };
        let signals = processor()
            .process_block(&sample_block(), &ctx(history))
            .await
            .unwrap();
        assert!(signals.iter().all(|s| s.signal_type != SignalType::FeeForecast));
    }

    #[tokio::test]
    async fn unusual_exchange_inflow_is_sell_pressure() {
        // history alternates -0.5/+0.5 BTC: mean 0, sigma 0.5; sample block nets +1 BTC
        let history = HistoricalData {
            exchange_net_flows: (0..20).map(|i| if i % 2 == 0 { -0.5 } else { 0.5 }).collect(),
            ..Default::default()
        };
        let signals = processor()
            .process_block(&sample_block(), &ctx(history))
            .await
            .unwrap();
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.signal_type, SignalType::LiquidityPressure);
        assert_eq!(s.metadata["pressure"], "high");
        assert_eq!(s.metadata["side"], "sell");
        // z = 2, saturate(2, 1)
        assert!((s.confidence - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn flows_outside_the_window_are_ignored() {
        let block = sample_block();
        let history = HistoricalData {
            exchange_net_flows: (0..20).map(|i| if i % 2 == 0 { -0.5 } else { 0.5 }).collect(),
            // all twenty blocks are two days old
            block_times: vec![block.timestamp - Duration::hours(48); 20],
            ..Default::default()
        };
        let signals = processor().process_block(&block, &ctx(history)).await.unwrap();
        assert!(signals.is_empty());
    }
}
