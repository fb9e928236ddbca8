use crate::core::mempool::mean_std;

/// Map a non-negative magnitude onto `[0, 1)`, reaching 0.5 at `midpoint`.
pub fn saturate(x: f64, midpoint: f64) -> f64 {
    if !x.is_finite() || x <= 0.0 || midpoint <= 0.0 {
        return 0.0;
    }
    1.0 - 1.0 / (1.0 + x / midpoint)
}

/// Weighted mean of `(value, weight)` parts, clamped to `[0, 1]`.
pub fn blend(parts: &[(f64, f64)]) -> f64 {
    let total_weighted: f64 = parts.iter().map(|(v, w)| v * w).sum();
    let max_possible: f64 = parts.iter().map(|(_, w)| w.abs()).sum();

    if max_possible == 0.0 {
        return 0.0;
    }

    (total_weighted / max_possible).clamp(0.0, 1.0)
}

/// Standard score of `value` against `history`. `None` with fewer than
/// `min_samples` points or a flat history.
pub fn z_score(value: f64, history: &[f64], min_samples: usize) -> Option<f64> {
    if history.len() < min_samples.max(2) {
        return None;
    }
    let (mean, std_dev) = mean_std(history.iter().copied())?;
    if std_dev <= f64::EPSILON {
        return None;
    }
    Some((value - mean) / std_dev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturate_midpoint_and_bounds() {
        assert!((saturate(2.0, 2.0) - 0.5).abs() < 1e-12);
        assert_eq!(saturate(0.0, 2.0), 0.0);
        assert_eq!(saturate(-3.0, 2.0), 0.0);
        assert_eq!(saturate(1.0, 0.0), 0.0);
        assert!(saturate(1e9, 1.0) < 1.0);
        assert!(saturate(4.0, 2.0) > saturate(3.0, 2.0));
    }

    #[test]
    fn empty_blend() {
        assert_eq!(blend(&[]), 0.0);
    }

    #[test]
    fn weighted_blend() {
        // 0.6*1.0 + 0.4*0.5 over total weight 1.0
        assert!((blend(&[(1.0, 0.6), (0.5, 0.4)]) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn negative_weight_reduces_blend() {
        // (1.0 - 0.6) / 1.6
        assert!((blend(&[(1.0, 1.0), (1.0, -0.6)]) - 0.25).abs() < 1e-12);
        assert_eq!(blend(&[(0.0, 1.0), (1.0, -0.6)]), 0.0);
    }

    #[test]
    fn z_score_needs_history_and_spread() {
        assert!(z_score(5.0, &[1.0], 2).is_none());
        assert!(z_score(5.0, &[3.0, 3.0, 3.0], 2).is_none());
        let z = z_score(13.0, &[10.0, 12.0, 10.0, 12.0], 2).unwrap();
        assert!((z - 2.0).abs() < 1e-12);
        assert!(z_score(13.0, &[10.0, 12.0, 10.0, 12.0], 10).is_none());
    }
}
