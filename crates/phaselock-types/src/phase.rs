//! Phase canonicalization and circular statistics.
//!
//! Every phase stored in the lattice lives in `(-pi, pi]`. Arithmetic on
//! phases (differences, velocities, deviations from the mean) is always
//! re-wrapped so a jump across the branch cut never reads as a jump of
//! almost `2 pi`.

use crate::numeric::NumericValue;

/// Wrap an angle into the canonical range `(-pi, pi]`.
///
/// Values already in range are returned unchanged. Non-finite input maps
/// to zero.
#[allow(clippy::arithmetic_side_effects)]
pub fn wrap_phase<N: NumericValue>(theta: N) -> N {
    if !theta.is_finite() {
        return N::zero();
    }
    let pi = N::pi();
    if theta > -pi && theta <= pi {
        return theta;
    }

    let two_pi = N::two_pi();
    let turns = ((theta - pi) / two_pi).ceil();
    let mut wrapped = theta - two_pi * turns;

    // Rounding in the subtraction can land a hair outside the range.
    if wrapped <= -pi {
        wrapped = wrapped + two_pi;
    } else if wrapped > pi {
        wrapped = wrapped - two_pi;
    }
    wrapped
}

/// Circular mean and dispersion of a set of phases.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhaseStats {
    /// Circular mean `atan2(sum sin, sum cos)` in `(-pi, pi]`.
    pub mean: f64,
    /// Mean squared wrapped deviation from [`mean`](Self::mean). Always
    /// non-negative.
    pub variance: f64,
    /// Number of phases summarized.
    pub count: usize,
}

/// Compute the circular mean and variance of `phases`.
///
/// The deviation of each phase from the circular mean is wrapped before
/// squaring, so phases straddling the branch cut contribute their true
/// angular distance. An empty input yields zero mean and variance.
#[allow(clippy::arithmetic_side_effects, clippy::cast_precision_loss)]
pub fn circular_stats<I>(phases: I) -> PhaseStats
where
    I: IntoIterator<Item = f64>,
    I::IntoIter: Clone,
{
    let iter = phases.into_iter();

    let mut sum_sin = 0.0_f64;
    let mut sum_cos = 0.0_f64;
    let mut count = 0_usize;
    for phase in iter.clone() {
        sum_sin += phase.sin();
        sum_cos += phase.cos();
        count = count.saturating_add(1);
    }
    if count == 0 {
        return PhaseStats::default();
    }

    let mean = wrap_phase(sum_sin.atan2(sum_cos));
    let mut sum_sq = 0.0_f64;
    for phase in iter {
        let deviation = wrap_phase(phase - mean);
        sum_sq += deviation * deviation;
    }
    let variance = (sum_sq / count as f64).max(0.0);

    PhaseStats {
        mean,
        variance,
        count,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use core::f64::consts::PI;

    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use super::*;

    #[test]
    fn in_range_values_are_untouched() {
        for value in [0.0, 1.0, -1.0, PI, -PI + 1e-12, 3.0] {
            assert_eq!(wrap_phase(value), value);
        }
    }

    #[test]
    fn minus_pi_maps_to_plus_pi() {
        assert!((wrap_phase(-PI) - PI).abs() < 1e-12);
    }

    #[test]
    fn multiples_of_pi() {
        assert!((wrap_phase(3.0 * PI) - PI).abs() < 1e-9);
        assert!((wrap_phase(-3.0 * PI) - PI).abs() < 1e-9);
        assert!(wrap_phase(2.0 * PI).abs() < 1e-12);
    }

    #[test]
    fn non_finite_maps_to_zero() {
        assert_eq!(wrap_phase(f64::NAN), 0.0);
        assert_eq!(wrap_phase(f64::INFINITY), 0.0);
    }

    #[test]
    fn wraps_decimals() {
        let wrapped = wrap_phase(Decimal::from(7_u32));
        let expected = 7.0 - 2.0 * PI;
        assert!((NumericValue::to_f64(wrapped) - expected).abs() < 1e-12);
    }

    #[test]
    fn stats_of_identical_phases() {
        let stats = circular_stats(vec![0.5; 8]);
        assert!((stats.mean - 0.5).abs() < 1e-12);
        assert!(stats.variance < 1e-20);
        assert_eq!(stats.count, 8);
    }

    #[test]
    fn stats_across_branch_cut() {
        // Two phases just either side of pi are 0.2 rad apart, not 2 pi - 0.2.
        let stats = circular_stats([PI - 0.1, -PI + 0.1]);
        assert!((stats.mean.abs() - PI).abs() < 1e-9);
        assert!((stats.variance - 0.01).abs() < 1e-9);
    }

    #[test]
    fn stats_of_empty_input() {
        let stats = circular_stats(Vec::<f64>::new());
        assert_eq!(stats, PhaseStats::default());
    }

    proptest! {
        #[test]
        fn wrapped_phase_is_canonical(theta in -1.0e6_f64..1.0e6_f64) {
            let wrapped = wrap_phase(theta);
            prop_assert!(wrapped > -PI && wrapped <= PI);
            let turns = (theta - wrapped) / (2.0 * PI);
            prop_assert!((turns - turns.round()).abs() < 1e-6);
        }

        #[test]
        fn wrapping_is_idempotent(theta in -1.0e4_f64..1.0e4_f64) {
            let once = wrap_phase(theta);
            prop_assert_eq!(wrap_phase(once), once);
        }

        #[test]
        fn variance_is_non_negative(phases in proptest::collection::vec(-PI..PI, 1..64)) {
            let stats = circular_stats(phases);
            prop_assert!(stats.variance >= 0.0);
            prop_assert!(stats.variance <= PI * PI);
        }
    }
}
