//! Small sample statistics shared by the repeater family (spec §4.5),
//! grounded on the `scipy.stats.tstd`/`t.ppf`/autocorrelation call sites in
//! `original_source/launcher/repeater.py`.

use statrs::distribution::{ContinuousCDF, StudentsT};

pub fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

/// Sample standard deviation (Bessel-corrected), matching `scipy.stats.tstd`.
pub fn sample_stdev(data: &[f64]) -> f64 {
    let n = data.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(data);
    let sum_sq: f64 = data.iter().map(|x| (x - m).powi(2)).sum();
    (sum_sq / (n as f64 - 1.0)).sqrt()
}

/// Standard error of the mean.
pub fn standard_error(data: &[f64]) -> f64 {
    sample_stdev(data) / (data.len() as f64).sqrt()
}

/// One-sided Student's-t quantile at `confidence` with `df` degrees of
/// freedom, matching `scipy.stats.t.ppf(confidence, df=df)`.
pub fn t_quantile(confidence: f64, df: f64) -> f64 {
    if df <= 0.0 {
        return 0.0;
    }
    StudentsT::new(0.0, 1.0, df)
        .map(|dist| dist.inverse_cdf(confidence))
        .unwrap_or(0.0)
}

/// Normalized sample autocorrelation at every lag, matching the
/// `numpy.correlate(ndata, ndata, "full")[len-1:] / var / len` pattern in
/// `BBRepeater._autocor`/`_is_autocorrelated`. Index 0 is always 1.0.
pub fn autocorrelation(data: &[f64]) -> Vec<f64> {
    let n = data.len();
    if n == 0 {
        return Vec::new();
    }
    let m = mean(data);
    let centered: Vec<f64> = data.iter().map(|x| x - m).collect();
    let variance = centered.iter().map(|x| x * x).sum::<f64>() / n as f64;
    if variance == 0.0 {
        return vec![0.0; n];
    }

    (0..n)
        .map(|lag| {
            let cov: f64 = (0..n - lag).map(|i| centered[i] * centered[i + lag]).sum::<f64>() / n as f64;
            cov / variance
        })
        .collect()
}

/// First lag `i >= 1` whose autocorrelation magnitude drops below
/// `epsilon`, or `None` if it never decays (`BBRepeater._block_size`).
pub fn first_decay_below(acf: &[f64], epsilon: f64) -> Option<usize> {
    acf.iter().skip(1).position(|v| v.abs() < epsilon).map(|i| i + 1)
}

/// Highest-density interval covering `prob` of the sample: the narrowest
/// contiguous window of sorted values containing that fraction of points
/// (`arviz.hdi`, used by `HDIRepeater`).
pub fn hdi(data: &[f64], prob: f64) -> (f64, f64) {
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    let window = ((prob * n as f64).ceil() as usize).clamp(1, n);

    let mut best = (sorted[0], sorted[window - 1]);
    let mut best_width = best.1 - best.0;
    for start in 1..=(n - window) {
        let lo = sorted[start];
        let hi = sorted[start + window - 1];
        if hi - lo < best_width {
            best_width = hi - lo;
            best = (lo, hi);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_stdev_of_known_sample() {
        let data = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&data) - 5.0).abs() < 1e-9);
        assert!((sample_stdev(&data) - 2.138_089_935_299_395).abs() < 1e-6);
    }

    #[test]
    fn t_quantile_approaches_normal_for_large_df() {
        let q = t_quantile(0.95, 1000.0);
        assert!((q - 1.645).abs() < 0.01);
    }

    #[test]
    fn constant_series_has_zero_autocorrelation() {
        let data = vec![3.0; 10];
        let acf = autocorrelation(&data);
        assert!(acf.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn decay_index_found_when_present() {
        let acf = vec![1.0, 0.5, 0.2, 0.001, 0.3];
        assert_eq!(first_decay_below(&acf, 0.01), Some(3));
    }

    #[test]
    fn decay_index_none_when_never_decays() {
        let acf = vec![1.0, 0.9, 0.8, 0.7];
        assert_eq!(first_decay_below(&acf, 0.01), None);
    }
}
