use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::Transaction;

/// Whirlpool pool denominations, in satoshis.
const WHIRLPOOL_DENOMINATIONS: &[u64] = &[100_000, 1_000_000, 5_000_000, 50_000_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinJoinPattern {
    Whirlpool,
    WasabiLike,
    EqualOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinJoinMatch {
    pub pattern: CoinJoinPattern,
    pub confidence: f64,
}

impl CoinJoinMatch {
    /// Multiplier applied to signals derived from this transaction.
    pub fn discount(&self) -> f64 {
        1.0 - 0.5 * self.confidence
    }
}

/// Equal-output heuristic. Prefers missing a mix over flagging an ordinary
/// batch payment.
pub fn detect_coinjoin(tx: &Transaction) -> Option<CoinJoinMatch> {
    let inputs = tx.input_count;
    let outputs = tx.outputs.len();
    if inputs < 3 || outputs < 3 {
        return None;
    }

    let mut by_value: HashMap<u64, usize> = HashMap::new();
    for output in &tx.outputs {
        *by_value.entry(output.value).or_default() += 1;
    }
    let (denomination, equal) = by_value
        .into_iter()
        .max_by_key(|(value, count)| (*count, *value))?;
    if equal < 3 {
        return None;
    }

    let share = equal as f64 / outputs as f64;
    if share <= 0.5 {
        return None;
    }
    let wide = inputs >= 5 && outputs >= 5;

    if wide && equal == 5 && WHIRLPOOL_DENOMINATIONS.contains(&denomination) {
        return Some(CoinJoinMatch {
            pattern: CoinJoinPattern::Whirlpool,
            confidence: 0.95,
        });
    }

    // multiples of 0.001 BTC
    let round = denomination > 0 && denomination % 100_000 == 0;
    if wide && equal >= 5 {
        return Some(CoinJoinMatch {
            pattern: if round && equal >= 10 {
                CoinJoinPattern::WasabiLike
            } else {
                CoinJoinPattern::EqualOutput
            },
            confidence: if round { 0.85 } else { 0.75 },
        });
    }

    (share > 0.7).then_some(CoinJoinMatch {
        pattern: CoinJoinPattern::EqualOutput,
        confidence: 0.5,
    })
}
