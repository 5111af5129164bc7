//! Loss distribution statistics.
//!
//! Summary percentiles use linear interpolation between order statistics.
//! Tail measures (VaR, CVaR, return-period losses) use nearest rank so that
//! they are exact sample values and reproduce bit-for-bit.

use serde::Serialize;

use crate::scenario::LossYear;
use crate::types::Money;

/// Shape of a loss sample: moments, range and interpolated percentiles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossDistribution {
    pub n: usize,
    pub mean: Money,
    /// Sample standard deviation (n − 1 denominator); zero for a single year.
    pub std_dev: Money,
    pub min: Money,
    pub p5: Money,
    pub p25: Money,
    pub p50: Money,
    pub p75: Money,
    pub p95: Money,
    pub p99: Money,
    pub max: Money,
}

impl LossDistribution {
    /// `None` for an empty sample.
    pub fn from_losses(losses: &[Money]) -> Option<Self> {
        if losses.is_empty() {
            return None;
        }
        let mut sorted = losses.to_vec();
        sorted.sort_by(f64::total_cmp);
        let q = |p| interpolated_quantile(&sorted, p);

        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let sum_sq: f64 = sorted.iter().map(|x| (x - mean) * (x - mean)).sum();
        let std_dev = if n > 1 { (sum_sq / (n - 1) as f64).sqrt() } else { 0.0 };

        Some(LossDistribution {
            n,
            mean,
            std_dev,
            min: sorted[0],
            p5: q(0.05),
            p25: q(0.25),
            p50: q(0.50),
            p75: q(0.75),
            p95: q(0.95),
            p99: q(0.99),
            max: sorted[n - 1],
        })
    }
}

/// Quantile `p` of an ascending sample, interpolating linearly between the
/// two order statistics either side of rank `p · (n − 1)`. Zero when empty.
pub fn interpolated_quantile(sorted: &[f64], p: f64) -> f64 {
    let Some(last) = sorted.len().checked_sub(1) else {
        return 0.0;
    };
    let rank = p.clamp(0.0, 1.0) * last as f64;
    let below = rank.floor() as usize;
    let above = (below + 1).min(last);
    let weight = rank - below as f64;
    sorted[below] + (sorted[above] - sorted[below]) * weight
}

/// Number of worst outcomes in the `1 − level` tail of `n` samples (at least one).
fn tail_count(n: usize, level: f64) -> usize {
    // 1 − 0.99 is 0.010000000000000009 in f64; the slack keeps 1000 × that at 10.
    let k = (n as f64 * (1.0 - level) - 1e-9).ceil() as usize;
    k.clamp(1, n)
}

fn sorted_descending(losses: &[f64]) -> Vec<f64> {
    let mut v = losses.to_vec();
    v.sort_by(|a, b| b.total_cmp(a));
    v
}

/// Value at risk at `level` by nearest rank: the smallest loss among the
/// worst `ceil(n · (1 − level))` outcomes. Zero for an empty sample.
pub fn var(losses: &[f64], level: f64) -> f64 {
    if losses.is_empty() {
        return 0.0;
    }
    let k = tail_count(losses.len(), level);
    sorted_descending(losses)[k - 1]
}

/// Conditional value at risk at `level` by nearest rank: the mean of the worst
/// `ceil(n · (1 − level))` outcomes. Zero for an empty sample.
///
/// Raising `level` shrinks the tail to a subset of the largest values, so the
/// result never decreases as the threshold tightens.
pub fn cvar(losses: &[f64], level: f64) -> f64 {
    if losses.is_empty() {
        return 0.0;
    }
    let k = tail_count(losses.len(), level);
    let sorted = sorted_descending(losses);
    sorted[..k].iter().sum::<f64>() / k as f64
}

/// Loss exceeded on average once every `period` years.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReturnPeriodLoss {
    pub period: u32,
    pub loss: Money,
}

/// Standard reporting return periods (1-in-N years).
pub const RETURN_PERIODS: [u32; 4] = [10, 50, 100, 250];

pub fn return_period_losses(losses: &[f64], periods: &[u32]) -> Vec<ReturnPeriodLoss> {
    periods
        .iter()
        .filter(|&&p| p > 0)
        .map(|&period| ReturnPeriodLoss { period, loss: var(losses, 1.0 - 1.0 / period as f64) })
        .collect()
}

/// Gross loss distribution of a batch, for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossSummary {
    pub distribution: LossDistribution,
    pub return_periods: Vec<ReturnPeriodLoss>,
    pub cvar99: Money,
    pub clustered_years: usize,
    pub mean_event_count: f64,
}

pub fn summarise_losses(years: &[LossYear]) -> Option<LossSummary> {
    let gross: Vec<f64> = years.iter().map(|y| y.gross_loss).collect();
    let distribution = LossDistribution::from_losses(&gross)?;
    let return_periods = return_period_losses(&gross, &RETURN_PERIODS);
    let cvar99 = cvar(&gross, 0.99);
    let events: u64 = years.iter().map(|y| y.event_count as u64).sum();
    Some(LossSummary {
        distribution,
        return_periods,
        cvar99,
        clustered_years: years.iter().filter(|y| y.clustered).count(),
        mean_event_count: events as f64 / years.len() as f64,
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::types::Year;

    #[test]
    fn loss_distribution_known_values() {
        // Shuffled so the constructor has to sort.
        let values: Vec<f64> = [7, 1, 11, 4, 9, 2, 6, 10, 3, 8, 5].iter().map(|&x| x as f64).collect();
        let s = LossDistribution::from_losses(&values).unwrap();
        assert_eq!(s.n, 11);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 11.0);
        assert!((s.p50 - 6.0).abs() < 1e-12);
        assert!((s.p25 - 3.5).abs() < 1e-12);
        assert!((s.mean - 6.0).abs() < 1e-12);
    }

    #[test]
    fn loss_distribution_of_empty_sample_is_none() {
        assert!(LossDistribution::from_losses(&[]).is_none());
    }

    #[test]
    fn single_year_has_zero_spread() {
        let s = LossDistribution::from_losses(&[42.0]).unwrap();
        assert_eq!((s.min, s.p5, s.p99, s.max), (42.0, 42.0, 42.0, 42.0));
        assert_eq!(s.std_dev, 0.0);
    }

    #[test]
    fn interpolated_quantile_sits_between_ranks() {
        let sorted = [0.0, 10.0, 20.0, 40.0];
        assert_eq!(interpolated_quantile(&sorted, 0.0), 0.0);
        assert_eq!(interpolated_quantile(&sorted, 1.0), 40.0);
        // Rank 0.5 · 3 = 1.5, halfway between 10 and 20.
        assert_eq!(interpolated_quantile(&sorted, 0.5), 15.0);
        assert_eq!(interpolated_quantile(&[], 0.5), 0.0);
    }

    #[test]
    fn cvar_of_hundred_samples_is_the_worst_one() {
        let losses: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert_eq!(cvar(&losses, 0.99), 100.0);
        assert_eq!(var(&losses, 0.99), 100.0);
        // 1000 samples → worst 10 averaged.
        let losses: Vec<f64> = (1..=1000).map(|x| x as f64).collect();
        assert_eq!(cvar(&losses, 0.99), (991..=1000).sum::<i32>() as f64 / 10.0);
        assert_eq!(var(&losses, 0.99), 991.0);
    }

    #[test]
    fn cvar_of_small_sample_uses_at_least_one_value() {
        assert_eq!(cvar(&[3.0, 1.0, 2.0], 0.99), 3.0);
        assert_eq!(cvar(&[], 0.99), 0.0);
    }

    #[test]
    fn cvar_is_order_independent() {
        let a = [5.0, 1.0, 9.0, 3.0, 7.0];
        let b = [9.0, 7.0, 5.0, 3.0, 1.0];
        assert_eq!(cvar(&a, 0.6), cvar(&b, 0.6));
    }

    #[test]
    fn return_periods_increase_with_period() {
        let losses: Vec<f64> = (1..=1000).map(|x| x as f64).collect();
        let rp = return_period_losses(&losses, &RETURN_PERIODS);
        assert_eq!(rp.len(), 4);
        assert!(rp.windows(2).all(|w| w[0].loss <= w[1].loss));
        assert_eq!(rp[2].period, 100);
        assert_eq!(rp[2].loss, 991.0);
    }

    #[test]
    fn summarise_counts_clustered_years() {
        let years: Vec<LossYear> = (0..4)
            .map(|i| LossYear {
                year: Year(i),
                gross_loss: i as f64,
                segment_losses: vec![i as f64],
                event_count: 2,
                clustered: i % 2 == 0,
            })
            .collect();
        let s = summarise_losses(&years).unwrap();
        assert_eq!(s.clustered_years, 2);
        assert_eq!(s.mean_event_count, 2.0);
        assert_eq!(s.distribution.max, 3.0);
        assert!(summarise_losses(&[]).is_none());
    }

    proptest! {
        #[test]
        fn cvar_non_decreasing_as_threshold_tightens(
            losses in prop::collection::vec(0.0f64..1_000.0, 1..400),
        ) {
            let c99 = cvar(&losses, 0.99);
            let c995 = cvar(&losses, 0.995);
            let c95 = cvar(&losses, 0.95);
            prop_assert!(c995 >= c99);
            prop_assert!(c99 >= c95);
        }

        #[test]
        fn cvar_bounded_by_var_and_max(
            losses in prop::collection::vec(0.0f64..1_000.0, 1..400),
        ) {
            let max = losses.iter().cloned().fold(f64::MIN, f64::max);
            let c = cvar(&losses, 0.99);
            prop_assert!(c >= var(&losses, 0.99) - 1e-9);
            prop_assert!(c <= max + 1e-9);
        }

        #[test]
        fn loss_distribution_percentiles_are_ordered(
            losses in prop::collection::vec(0.0f64..1_000.0, 1..400),
        ) {
            let d = LossDistribution::from_losses(&losses).unwrap();
            let ladder = [d.min, d.p5, d.p25, d.p50, d.p75, d.p95, d.p99, d.max];
            prop_assert!(ladder.windows(2).all(|w| w[0] <= w[1] + 1e-9));
            prop_assert!(d.mean >= d.min - 1e-9 && d.mean <= d.max + 1e-9);
        }
    }
}
