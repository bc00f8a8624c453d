//! Kolmogorov-Smirnov statistics (spec §4.5), grounded on
//! `scipy.stats.ks_2samp`/`kstest` call sites in
//! `original_source/launcher/repeater.py` (`KSRepeater.__call__`,
//! `DecisionRepeater._is_uniform`/`_is_gaussian`/`_is_lognormal`).

use statrs::distribution::ContinuousCDF;

/// Two-sample KS statistic: the maximum absolute gap between the two
/// samples' empirical CDFs (`ks_2samp`'s `statistic`, `KSRepeater`).
pub fn two_sample_statistic(a: &[f64], b: &[f64]) -> f64 {
    let mut pooled: Vec<f64> = a.iter().chain(b.iter()).cloned().collect();
    pooled.sort_by(|x, y| x.partial_cmp(y).unwrap());
    pooled.dedup_by(|x, y| x == y);

    let mut sorted_a = a.to_vec();
    let mut sorted_b = b.to_vec();
    sorted_a.sort_by(|x, y| x.partial_cmp(y).unwrap());
    sorted_b.sort_by(|x, y| x.partial_cmp(y).unwrap());

    pooled
        .into_iter()
        .map(|x| {
            let cdf_a = empirical_cdf(&sorted_a, x);
            let cdf_b = empirical_cdf(&sorted_b, x);
            (cdf_a - cdf_b).abs()
        })
        .fold(0.0, f64::max)
}

/// One-sample KS statistic against a fitted continuous distribution
/// (`scipy.stats.kstest(data, dist_name, params)`).
pub fn one_sample_statistic(data: &[f64], dist: &impl ContinuousCDF<f64, f64>) -> f64 {
    let mut sorted = data.to_vec();
    sorted.sort_by(|x, y| x.partial_cmp(y).unwrap());
    let n = sorted.len() as f64;

    sorted
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let theoretical = dist.cdf(x);
            let empirical_upper = (i as f64 + 1.0) / n;
            let empirical_lower = i as f64 / n;
            (theoretical - empirical_upper).abs().max((theoretical - empirical_lower).abs())
        })
        .fold(0.0, f64::max)
}

fn empirical_cdf(sorted: &[f64], x: f64) -> f64 {
    let count = sorted.iter().filter(|&&v| v <= x).count();
    count as f64 / sorted.len() as f64
}

/// Asymptotic two-sample KS p-value (`scipy.stats.ks_2samp`'s `pvalue`),
/// using the standard Kolmogorov distribution approximation.
pub fn two_sample_p_value(statistic: f64, n1: usize, n2: usize) -> f64 {
    let en = ((n1 * n2) as f64 / (n1 + n2) as f64).sqrt();
    kolmogorov_survival((en + 0.12 + 0.11 / en) * statistic)
}

/// Asymptotic one-sample KS p-value, same Kolmogorov approximation as
/// [`two_sample_p_value`] with the single-sample correction factor
/// (`scipy.stats.kstest`'s asymptotic mode).
pub fn one_sample_p_value(statistic: f64, n: usize) -> f64 {
    let sqrt_n = (n as f64).sqrt();
    kolmogorov_survival((sqrt_n + 0.12 + 0.11 / sqrt_n) * statistic)
}

fn kolmogorov_survival(lambda: f64) -> f64 {
    if lambda < 0.2 {
        return 1.0;
    }
    let mut sum = 0.0;
    for k in 1..=100 {
        let term = if k % 2 == 1 { 1.0 } else { -1.0 } * (-2.0 * (k as f64).powi(2) * lambda * lambda).exp();
        sum += term;
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use statrs::distribution::Normal;

    #[test]
    fn identical_samples_have_zero_statistic() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let stat = two_sample_statistic(&a, &a);
        assert_eq!(stat, 0.0);
    }

    #[test]
    fn clearly_shifted_samples_have_large_statistic() {
        let a: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let b: Vec<f64> = (100..120).map(|i| i as f64).collect();
        let stat = two_sample_statistic(&a, &b);
        assert_eq!(stat, 1.0);
    }

    #[test]
    fn normal_sample_fits_normal_distribution_well() {
        let data = vec![-1.0, -0.5, 0.0, 0.0, 0.5, 1.0];
        let dist = Normal::new(0.0, 0.7).unwrap();
        let stat = one_sample_statistic(&data, &dist);
        assert!(stat < 0.5);
    }

    #[test]
    fn p_value_is_high_for_tiny_statistic() {
        let p = two_sample_p_value(0.01, 50, 50);
        assert!(p > 0.9);
    }
}
