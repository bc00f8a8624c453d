//! One-dimensional Gaussian-mixture fitting via EM, scored by BIC, grounded
//! on the `sklearn.mixture.GaussianMixture`/grid-search-by-BIC call sites in
//! `original_source/launcher/repeater.py` (`GaussianMixtureRepeater.__call__`,
//! `DecisionRepeater._is_multimodal`'s shared `gmm_bic_score` helper).
//!
//! `sklearn` additionally grid-searches over four covariance-tying schemes
//! (spherical/tied/diag/full); in one dimension all four collapse to the
//! same per-component variance model, so only the component count is
//! searched here.

const EM_ITERATIONS: usize = 100;
const EM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct Component {
    pub weight: f64,
    pub mean: f64,
    pub variance: f64,
}

#[derive(Debug, Clone)]
pub struct GaussianMixture {
    pub components: Vec<Component>,
}

impl GaussianMixture {
    /// Log-likelihood of `data` under this mixture, matching
    /// `GaussianMixture.score(data)` (mean log-likelihood per sample,
    /// *not* summed — `score`, not `score_samples().sum()`).
    pub fn mean_log_likelihood(&self, data: &[f64]) -> f64 {
        let total: f64 = data.iter().map(|&x| self.log_density(x)).sum();
        total / data.len() as f64
    }

    fn log_density(&self, x: f64) -> f64 {
        let density: f64 = self
            .components
            .iter()
            .map(|c| c.weight * gaussian_pdf(x, c.mean, c.variance))
            .sum();
        density.max(f64::MIN_POSITIVE).ln()
    }

    /// Number of free parameters: per-component (weight, mean, variance)
    /// minus one redundant weight (weights sum to 1).
    fn free_parameters(&self) -> usize {
        self.components.len() * 3 - 1
    }

    /// Bayesian information criterion: `-2 * log_likelihood + k * ln(n)`.
    pub fn bic(&self, data: &[f64]) -> f64 {
        let n = data.len() as f64;
        let log_likelihood = self.mean_log_likelihood(data) * n;
        -2.0 * log_likelihood + self.free_parameters() as f64 * n.ln()
    }
}

fn gaussian_pdf(x: f64, mean: f64, variance: f64) -> f64 {
    let variance = variance.max(1e-12);
    let coeff = 1.0 / (2.0 * std::f64::consts::PI * variance).sqrt();
    coeff * (-((x - mean).powi(2)) / (2.0 * variance)).exp()
}

/// Fits a `k`-component 1-D Gaussian mixture to `data` via EM, seeded with
/// evenly-spaced means across the sample's range.
pub fn fit(data: &[f64], k: usize) -> GaussianMixture {
    assert!(k >= 1, "a mixture needs at least one component");

    let lo = data.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let overall_variance = {
        let m = data.iter().sum::<f64>() / data.len() as f64;
        data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / data.len() as f64
    }
    .max(1e-6);

    let mut components: Vec<Component> = (0..k)
        .map(|i| {
            let frac = if k == 1 { 0.5 } else { i as f64 / (k as f64 - 1.0) };
            Component {
                weight: 1.0 / k as f64,
                mean: lo + frac * (hi - lo),
                variance: overall_variance / k as f64,
            }
        })
        .collect();

    let mut prev_ll = f64::NEG_INFINITY;
    for _ in 0..EM_ITERATIONS {
        let responsibilities = e_step(data, &components);
        components = m_step(data, &responsibilities);

        let mixture = GaussianMixture { components: components.clone() };
        let ll = mixture.mean_log_likelihood(data);
        if (ll - prev_ll).abs() < EM_TOLERANCE {
            break;
        }
        prev_ll = ll;
    }

    GaussianMixture { components }
}

fn e_step(data: &[f64], components: &[Component]) -> Vec<Vec<f64>> {
    data.iter()
        .map(|&x| {
            let weighted: Vec<f64> = components
                .iter()
                .map(|c| c.weight * gaussian_pdf(x, c.mean, c.variance))
                .collect();
            let total: f64 = weighted.iter().sum::<f64>().max(1e-300);
            weighted.into_iter().map(|w| w / total).collect()
        })
        .collect()
}

fn m_step(data: &[f64], responsibilities: &[Vec<f64>]) -> Vec<Component> {
    let k = responsibilities[0].len();
    let n = data.len() as f64;

    (0..k)
        .map(|j| {
            let nk: f64 = responsibilities.iter().map(|r| r[j]).sum();
            let nk = nk.max(1e-12);
            let mean = data
                .iter()
                .zip(responsibilities.iter())
                .map(|(&x, r)| r[j] * x)
                .sum::<f64>()
                / nk;
            let variance = data
                .iter()
                .zip(responsibilities.iter())
                .map(|(&x, r)| r[j] * (x - mean).powi(2))
                .sum::<f64>()
                / nk;
            Component {
                weight: nk / n,
                mean,
                variance: variance.max(1e-6),
            }
        })
        .collect()
}

/// Grid-searches `1..=max_components`, returning the mixture with the
/// lowest BIC alongside its component count (`GaussianMixtureRepeater`'s
/// `gmm_bic_score` grid search, covariance dimension collapsed away since
/// it's redundant in one dimension).
pub fn best_by_bic(data: &[f64], max_components: usize) -> (usize, GaussianMixture) {
    (1..=max_components.max(1))
        .map(|k| (k, fit(data, k)))
        .min_by(|(_, a), (_, b)| a.bic(data).partial_cmp(&b.bic(data)).unwrap())
        .expect("max_components is at least 1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_cluster_data_prefers_one_component() {
        let data: Vec<f64> = (0..50).map(|i| 10.0 + (i as f64 % 7.0) * 0.1).collect();
        let (k, _) = best_by_bic(&data, 4);
        assert_eq!(k, 1);
    }

    #[test]
    fn clearly_bimodal_data_prefers_two_components() {
        let mut data = Vec::new();
        for i in 0..30 {
            data.push(0.0 + (i % 3) as f64 * 0.05);
            data.push(100.0 + (i % 3) as f64 * 0.05);
        }
        let (k, _) = best_by_bic(&data, 4);
        assert_eq!(k, 2);
    }

    #[test]
    fn bic_penalizes_extra_parameters() {
        let data = vec![5.0, 5.0, 5.0, 5.0, 5.0];
        let one = fit(&data, 1);
        let two = fit(&data, 2);
        assert!(one.bic(&data) <= two.bic(&data));
    }
}
