//! Reductions over dense hourly windows
//!
//! Every function takes one event's window as `Option<f64>` samples, one per
//! hour, and treats `None` as a gap. An empty or all-gap window reduces to
//! `None`, never to zero.

use crate::generic::Extremum;

fn present(values: &[Option<f64>]) -> impl Iterator<Item = (usize, f64)> + '_ {
    values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.filter(|x| x.is_finite()).map(|x| (i, x)))
}

/// Index of the extremum, first occurrence on ties
pub fn extremum_index(values: &[Option<f64>], extremum: Extremum) -> Option<usize> {
    let key = |x: f64| match extremum {
        Extremum::Min | Extremum::Max => x,
        Extremum::AbsMin | Extremum::AbsMax => x.abs(),
    };
    let wants_max = matches!(extremum, Extremum::Max | Extremum::AbsMax);

    let mut best: Option<(usize, f64)> = None;
    for (i, x) in present(values) {
        let k = key(x);
        let better = match best {
            None => true,
            Some((_, b)) if wants_max => k > b,
            Some((_, b)) => k < b,
        };
        if better {
            best = Some((i, k));
        }
    }
    best.map(|(i, _)| i)
}

/// Value of the extremum; absolute variants return the magnitude.
pub fn extremum_value(values: &[Option<f64>], extremum: Extremum) -> Option<f64> {
    let i = extremum_index(values, extremum)?;
    let v = values[i]?;
    match extremum {
        Extremum::Min | Extremum::Max => Some(v),
        Extremum::AbsMin | Extremum::AbsMax => Some(v.abs()),
    }
}

/// `max - min`, each found independently
pub fn range(values: &[Option<f64>]) -> Option<f64> {
    let max = extremum_value(values, Extremum::Max)?;
    let min = extremum_value(values, Extremum::Min)?;
    Some(max - min)
}

pub fn mean(values: &[Option<f64>]) -> Option<f64> {
    let (sum, n) = present(values).fold((0.0, 0usize), |(s, n), (_, x)| (s + x, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

pub fn median(values: &[Option<f64>]) -> Option<f64> {
    let mut sorted: Vec<f64> = present(values).map(|(_, x)| x).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Percent of hours carrying data
pub fn coverage(values: &[Option<f64>]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = present(values).count();
    Some(100.0 * n as f64 / values.len() as f64)
}

/// Mean that gives up when more than `len / divisor` hours are gaps
pub fn tolerant_mean(values: &[Option<f64>], divisor: usize) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let missing = values.len() - present(values).count();
    if missing > values.len() / divisor.max(1) {
        return None;
    }
    mean(values)
}

/// Remove a rising linear trend from a window.
///
/// The least-squares slope over the present samples is subtracted, anchored
/// at the first sample, only when the slope is positive. Falling or flat
/// windows pass through untouched.
pub fn detrend(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let points: Vec<(f64, f64)> = present(values).map(|(i, x)| (i as f64, x)).collect();
    if points.len() < 2 {
        return values.to_vec();
    }

    let n = points.len() as f64;
    let mean_t = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let (num, den) = points.iter().fold((0.0, 0.0), |(num, den), &(t, y)| {
        (num + (t - mean_t) * (y - mean_y), den + (t - mean_t).powi(2))
    });
    if den == 0.0 {
        return values.to_vec();
    }
    let slope = num / den;
    if slope <= 0.0 {
        return values.to_vec();
    }

    let t0 = points[0].0;
    values
        .iter()
        .enumerate()
        .map(|(i, v)| v.map(|x| x - slope * (i as f64 - t0)))
        .collect()
}

/// Round for storage; non-finite values become missing
pub fn round_to(value: Option<f64>, decimals: i32) -> Option<f64> {
    let v = value.filter(|v| v.is_finite())?;
    let scale = 10f64.powi(decimals);
    Some((v * scale).round() / scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().map(|&v| if v.is_nan() { None } else { Some(v) }).collect()
    }

    const NAN: f64 = f64::NAN;

    // ==========================================================================
    // EXTREMA
    // ==========================================================================

    #[test]
    fn test_extremum_first_occurrence() {
        let values = w(&[3.0, 9.0, 1.0, 9.0, 1.0]);
        assert_eq!(extremum_index(&values, Extremum::Max), Some(1));
        assert_eq!(extremum_index(&values, Extremum::Min), Some(2));
    }

    #[test]
    fn test_abs_extremum() {
        let values = w(&[-7.0, 3.0, 6.5, -0.5]);
        assert_eq!(extremum_index(&values, Extremum::AbsMax), Some(0));
        assert_eq!(extremum_value(&values, Extremum::AbsMax), Some(7.0));
        assert_eq!(extremum_value(&values, Extremum::AbsMin), Some(0.5));
    }

    #[test]
    fn test_extremum_skips_gaps() {
        let values = w(&[NAN, 2.0, NAN, -4.0]);
        assert_eq!(extremum_index(&values, Extremum::Min), Some(3));
        assert_eq!(extremum_value(&values, Extremum::Max), Some(2.0));
    }

    #[test]
    fn test_range_is_independent() {
        let values = w(&[5.0, -2.0, 8.0, NAN]);
        assert_eq!(range(&values), Some(10.0));
    }

    // ==========================================================================
    // EMPTY WINDOWS
    // ==========================================================================
    //
    // No valid sample in a window must give a missing value for every
    // reduction, not zero and not a panic.
    // ==========================================================================

    #[test]
    fn test_empty_windows_are_missing() {
        let empty: Vec<Option<f64>> = vec![];
        let gaps = w(&[NAN, NAN, NAN]);
        for window in [&empty, &gaps] {
            assert_eq!(extremum_value(window, Extremum::Min), None);
            assert_eq!(extremum_value(window, Extremum::Max), None);
            assert_eq!(range(window), None);
            assert_eq!(mean(window), None);
            assert_eq!(median(window), None);
        }
        assert_eq!(coverage(&empty), None);
        assert_eq!(coverage(&gaps), Some(0.0));
    }

    // ==========================================================================
    // MEAN / MEDIAN / COVERAGE
    // ==========================================================================

    #[test]
    fn test_mean_ignores_gaps() {
        assert_eq!(mean(&w(&[1.0, NAN, 3.0])), Some(2.0));
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&w(&[5.0, 1.0, 3.0])), Some(3.0));
        assert_eq!(median(&w(&[4.0, 1.0, NAN, 3.0, 2.0])), Some(2.5));
    }

    #[test]
    fn test_coverage_bounds() {
        assert_eq!(coverage(&w(&[1.0, NAN, 3.0, NAN])), Some(50.0));
        assert_eq!(coverage(&w(&[1.0, 2.0])), Some(100.0));
        for n in 1..10 {
            let values: Vec<Option<f64>> = (0..n).map(|i| if i % 3 == 0 { None } else { Some(1.0) }).collect();
            let c = coverage(&values).unwrap();
            assert!((0.0..=100.0).contains(&c));
        }
    }

    // ==========================================================================
    // AVERAGED VALUE TOLERANCE
    // ==========================================================================
    //
    // With n hours, up to floor(n/2) gaps are tolerated.
    // ==========================================================================

    #[test]
    fn test_tolerant_mean_threshold() {
        // 4 hours: 2 gaps allowed
        assert_eq!(tolerant_mean(&w(&[1.0, NAN, NAN, 3.0]), 2), Some(2.0));
        assert_eq!(tolerant_mean(&w(&[1.0, NAN, NAN, NAN]), 2), None);
        // 3 hours: floor(3/2) = 1 gap allowed
        assert_eq!(tolerant_mean(&w(&[2.0, NAN, 4.0]), 2), Some(3.0));
        assert_eq!(tolerant_mean(&w(&[2.0, NAN, NAN]), 2), None);
        // single hour must be present
        assert_eq!(tolerant_mean(&w(&[NAN]), 2), None);
        assert_eq!(tolerant_mean(&w(&[6.0]), 2), Some(6.0));
    }

    // ==========================================================================
    // DE-TRENDING
    // ==========================================================================

    #[test]
    fn test_detrend_rising_window() {
        let values = w(&[1.0, 2.0, 3.0, 4.0]);
        let out = detrend(&values);
        for v in out {
            assert!((v.unwrap() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_detrend_leaves_falling_window() {
        let values = w(&[4.0, 3.0, 1.0, 0.5]);
        assert_eq!(detrend(&values), values);
    }

    #[test]
    fn test_detrend_keeps_gaps() {
        let values = w(&[0.0, NAN, 2.0, 3.0]);
        let out = detrend(&values);
        assert_eq!(out[1], None);
        assert_eq!(out[0], Some(0.0));
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(Some(1.23456), 2), Some(1.23));
        assert_eq!(round_to(Some(-12.36), 1), Some(-12.4));
        assert_eq!(round_to(Some(f64::INFINITY), 2), None);
        assert_eq!(round_to(None, 2), None);
    }
}
