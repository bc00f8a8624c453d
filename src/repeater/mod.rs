//! Adaptive stopping rules invoked after every repetition (spec §4.5),
//! grounded field-for-field on `original_source/launcher/repeater.py`'s
//! eight rules. Each variant decides *continue* (`true`) or *stop*
//! (`false`) from the accumulated history of one chosen metric.

pub mod gmm;
pub mod ks;
pub mod stats;

use serde_json::Value;

use crate::options::{Options, RepeaterOptions};
use crate::rundata::RunData;
use crate::error::LauncherError;

/// `sklearn.mixture.GaussianMixture`'s four covariance-tying schemes,
/// preserved only to keep the original warmup-length arithmetic intact —
/// in one dimension they all collapse to the same per-component variance
/// model, so [`gmm`] only grid-searches component count.
const GMM_COVARIANCE_SCHEMES: u64 = 4;

fn option_group(repeater_options: &RepeaterOptions, key: &str) -> Value {
    match repeater_options.get(key) {
        Some(v) if v.is_object() => v.clone(),
        _ => Value::Object(repeater_options.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    }
}

fn num(group: &Value, key: &str, default: f64) -> f64 {
    group.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn count_opt(group: &Value, key: &str, default: u64) -> u64 {
    group.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn string_opt(group: &Value, key: &str, default: &str) -> String {
    group.get(key).and_then(Value::as_str).unwrap_or(default).to_string()
}

/// Running history of one metric's samples across repetitions, shared by
/// every rule that needs more than a bare count.
#[derive(Default)]
struct Accumulator {
    count: u64,
    samples: Vec<f64>,
}

impl Accumulator {
    fn record(&mut self, pdata: &RunData, metric: &str) {
        self.count += 1;
        for v in pdata.get_metric(metric) {
            if let Some(f) = v.as_f64() {
                self.samples.push(f);
            }
        }
    }
}

pub struct CountRepeater {
    limit: u64,
    metric: String,
    acc: Accumulator,
}

impl CountRepeater {
    fn from_options(ro: &RepeaterOptions) -> Self {
        let group = option_group(ro, "CR");
        CountRepeater {
            limit: count_opt(&group, "max", 1),
            metric: string_opt(&group, "metric", "outer_time"),
            acc: Accumulator::default(),
        }
    }

    fn with_limit(limit: u64, ro: &RepeaterOptions) -> Self {
        let group = option_group(ro, "CR");
        CountRepeater {
            limit,
            metric: string_opt(&group, "metric", "outer_time"),
            acc: Accumulator::default(),
        }
    }

    fn call(&mut self, pdata: &RunData) -> bool {
        self.acc.record(pdata, &self.metric);
        self.acc.count < self.limit
    }
}

pub struct SeRepeater {
    thresh: f64,
    min: u64,
    max: u64,
    metric: String,
    acc: Accumulator,
    last: bool,
}

impl SeRepeater {
    fn from_options(ro: &RepeaterOptions) -> Self {
        let group = option_group(ro, "SE");
        let min = count_opt(&group, "min", 5);
        let max = count_opt(&group, "max", 100);
        assert!(max >= min, "SE repeater max must be >= min");
        SeRepeater {
            thresh: num(&group, "error_threshold", 0.05),
            min,
            max,
            metric: string_opt(&group, "metric", "outer_time"),
            acc: Accumulator::default(),
            last: true,
        }
    }

    /// `count <= min` uses `<=`, matching `SERepeater.__call__` exactly
    /// (unlike [`CiRepeater`], which uses strict `<` for the same check).
    fn call(&mut self, pdata: &RunData) -> bool {
        self.acc.record(pdata, &self.metric);
        if self.acc.count >= self.max {
            self.last = false;
            return false;
        }
        if self.acc.count > 1 {
            let se = stats::standard_error(&self.acc.samples);
            let mean = stats::mean(&self.acc.samples);
            let rel_se = if mean == 0.0 { se } else { se / mean };
            self.last = self.acc.count <= self.min || rel_se > self.thresh;
            return self.last;
        }
        self.last = true;
        true
    }
}

pub struct CiRepeater {
    ci_limit: f64,
    thresh: f64,
    min: u64,
    max: u64,
    metric: String,
    acc: Accumulator,
    last: bool,
}

impl CiRepeater {
    fn from_options(ro: &RepeaterOptions) -> Self {
        let group = option_group(ro, "CI");
        let min = count_opt(&group, "min", 5);
        let max = count_opt(&group, "max", 100);
        assert!(max >= min, "CI repeater max must be >= min");
        CiRepeater {
            ci_limit: num(&group, "ci_limit", 0.95),
            thresh: num(&group, "error_threshold", 0.05),
            min,
            max,
            metric: string_opt(&group, "metric", "outer_time"),
            acc: Accumulator::default(),
            last: true,
        }
    }

    /// `count < min` uses strict `<`, matching `CIRepeater.__call__`
    /// exactly (the original is inconsistent with [`SeRepeater`]/
    /// [`HdiRepeater`] here; this is not a bug to fix).
    fn call(&mut self, pdata: &RunData) -> bool {
        self.acc.record(pdata, &self.metric);
        if self.acc.count >= self.max {
            self.last = false;
            return false;
        }
        if self.acc.count > 1 {
            let n = self.acc.samples.len() as f64;
            let t = stats::t_quantile(self.ci_limit, n - 1.0);
            let ci = t * stats::sample_stdev(&self.acc.samples) / n.sqrt();
            let mean = stats::mean(&self.acc.samples);
            let rel_ci = if mean == 0.0 { ci } else { ci / mean };
            self.last = self.acc.count < self.min || rel_ci > self.thresh;
            return self.last;
        }
        self.last = true;
        true
    }
}

pub struct HdiRepeater {
    hdi_limit: f64,
    thresh: f64,
    min: u64,
    max: u64,
    metric: String,
    acc: Accumulator,
    last: bool,
}

impl HdiRepeater {
    fn from_options(ro: &RepeaterOptions) -> Self {
        let group = option_group(ro, "HDI");
        let min = count_opt(&group, "min", 5);
        let max = count_opt(&group, "max", 200);
        HdiRepeater {
            hdi_limit: num(&group, "hdi_limit", 0.89),
            thresh: num(&group, "error_threshold", 0.1),
            min,
            max,
            metric: string_opt(&group, "metric", "outer_time"),
            acc: Accumulator::default(),
            last: true,
        }
    }

    fn call(&mut self, pdata: &RunData) -> bool {
        self.acc.record(pdata, &self.metric);
        if self.acc.count >= self.max {
            self.last = false;
            return false;
        }
        if self.acc.count > 1 {
            let (lo, hi) = stats::hdi(&self.acc.samples, self.hdi_limit);
            let mean = stats::mean(&self.acc.samples);
            let rel_hdi = if mean == 0.0 { 0.0 } else { (hi - lo) / mean };
            self.last = self.acc.count <= self.min || rel_hdi > self.thresh;
            return self.last;
        }
        self.last = true;
        true
    }
}

pub struct BbRepeater {
    epsilon: f64,
    num_samples: usize,
    cl: f64,
    thresh: f64,
    min: u64,
    max: u64,
    metric: String,
    acc: Accumulator,
    prev_means: Option<Vec<f64>>,
    last: bool,
}

impl BbRepeater {
    fn from_options(ro: &RepeaterOptions) -> Self {
        let group = option_group(ro, "BB");
        let min = count_opt(&group, "min", 10);
        assert!(min > 1, "BB repeater min must be greater than 1");
        BbRepeater {
            epsilon: num(&group, "epsilon", 0.01),
            num_samples: count_opt(&group, "num_samples", 1000) as usize,
            cl: num(&group, "cl_limit", 0.95),
            thresh: num(&group, "error_threshold", 0.03),
            min,
            max: count_opt(&group, "max", 200),
            metric: string_opt(&group, "metric", "outer_time"),
            acc: Accumulator::default(),
            prev_means: None,
            last: true,
        }
    }

    /// When the autocorrelation function never decays below `epsilon`,
    /// keeps sampling up to `max` rather than declaring the run
    /// inconclusive (resolves spec.md's Open Question on this point).
    fn call(&mut self, pdata: &RunData) -> bool {
        self.acc.record(pdata, &self.metric);
        let n = self.acc.count;
        if n >= self.max {
            self.last = false;
            return false;
        }
        if n < self.min {
            self.last = true;
            return true;
        }

        let acf = stats::autocorrelation(&self.acc.samples);
        let keep_sampling = match stats::first_decay_below(&acf, self.epsilon) {
            None => true,
            Some(block_size) => {
                let means = self.bootstrap_means(block_size);
                let close_enough = self.means_close_enough(&means);
                self.prev_means = Some(means);
                !close_enough
            }
        };
        self.last = keep_sampling;
        keep_sampling
    }

    fn bootstrap_means(&self, block_size: usize) -> Vec<f64> {
        use rand::Rng;
        let data = &self.acc.samples;
        let target_len = data.len();
        let mut rng = rand::thread_rng();
        let mut means = Vec::with_capacity(self.num_samples);
        for _ in 0..self.num_samples {
            let mut sample = Vec::with_capacity(target_len);
            while sample.len() < target_len {
                let start = rng.gen_range(0..data.len());
                for k in 0..block_size {
                    sample.push(data[(start + k) % data.len()]);
                    if sample.len() >= target_len {
                        break;
                    }
                }
            }
            means.push(stats::mean(&sample));
        }
        means
    }

    fn means_close_enough(&self, means: &[f64]) -> bool {
        let Some(prev) = &self.prev_means else {
            return false;
        };
        if prev.len() != means.len() {
            return false;
        }
        let mut rel_diffs: Vec<f64> = means
            .iter()
            .zip(prev.iter())
            .map(|(m, p)| if *p == 0.0 { 0.0 } else { (m - p) / p })
            .collect();
        rel_diffs.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let n = rel_diffs.len();
        let lo_idx = (((1.0 - self.cl) / 2.0) * n as f64).floor() as usize;
        let hi_idx = (((1.0 + self.cl) / 2.0) * n as f64).floor().min(n as f64 - 1.0) as usize;
        let lo = rel_diffs[lo_idx.min(n - 1)];
        let hi = rel_diffs[hi_idx.min(n - 1)];
        lo > -self.thresh && hi < self.thresh
    }
}

pub struct GmmRepeater {
    max: u64,
    goodness_threshold: f64,
    max_components: usize,
    metric: String,
    acc: Accumulator,
    last: bool,
}

impl GmmRepeater {
    fn from_options(ro: &RepeaterOptions) -> Self {
        let group = option_group(ro, "GMM");
        GmmRepeater {
            max: count_opt(&group, "max", 100),
            goodness_threshold: num(&group, "goodness_threshold", 2.0),
            max_components: count_opt(&group, "max_gaussian_components", 8) as usize,
            metric: string_opt(&group, "metric", "outer_time"),
            acc: Accumulator::default(),
            last: true,
        }
    }

    fn call(&mut self, pdata: &RunData) -> bool {
        self.acc.record(pdata, &self.metric);
        let warmup = (self.max.saturating_sub(1)).min(self.max_components as u64 * GMM_COVARIANCE_SCHEMES);
        if self.acc.count <= warmup {
            self.last = true;
            return true;
        }
        if self.acc.count >= self.max {
            self.last = false;
            return false;
        }
        let (_, mixture) = gmm::best_by_bic(&self.acc.samples, self.max_components);
        let score = mixture.mean_log_likelihood(&self.acc.samples);
        self.last = score.abs() <= self.goodness_threshold;
        self.last
    }
}

pub struct KsRepeater {
    min: u64,
    max: u64,
    threshold: f64,
    metric: String,
    acc: Accumulator,
    last: bool,
}

impl KsRepeater {
    fn from_options(ro: &RepeaterOptions) -> Self {
        let group = option_group(ro, "KS");
        KsRepeater {
            min: count_opt(&group, "min", 5),
            max: count_opt(&group, "max", 1000),
            threshold: num(&group, "threshold", 0.1),
            metric: string_opt(&group, "metric", "outer_time"),
            acc: Accumulator::default(),
            last: true,
        }
    }

    fn call(&mut self, pdata: &RunData) -> bool {
        self.acc.count += 1;
        if self.acc.count < self.min {
            self.last = true;
            return true;
        }
        if self.acc.count >= self.max {
            self.last = false;
            return false;
        }
        for v in pdata.get_metric(&self.metric) {
            if let Some(f) = v.as_f64() {
                self.acc.samples.push(f);
            }
        }
        let mid = self.acc.samples.len() / 2;
        let (first, second) = self.acc.samples.split_at(mid);
        let stat = ks::two_sample_statistic(first, second);
        self.last = stat > self.threshold;
        self.last
    }
}

/// Meta-rule that dispatches to a sub-repeater chosen by the accumulated
/// sample's apparent distribution shape (spec §4.5 "Decision").
pub struct DecisionRepeater {
    max: u64,
    starting_sample: u64,
    test_after: u64,
    p_threshold: f64,
    lognormal_threshold: f64,
    gaussian_threshold: f64,
    uniform_threshold: f64,
    mean_threshold: f64,
    autocor_threshold: f64,
    gmm_max_components: usize,
    gmm_goodness_threshold: f64,
    metric: String,
    acc: Accumulator,
    se: SeRepeater,
    ci: CiRepeater,
    hdi: HdiRepeater,
    bb: BbRepeater,
    gmm: GmmRepeater,
}

impl DecisionRepeater {
    fn from_options(ro: &RepeaterOptions) -> Self {
        let group = option_group(ro, "DC");
        let max = count_opt(&group, "max", 400);
        DecisionRepeater {
            max,
            starting_sample: count_opt(&group, "starting_sample", 20).min(max),
            test_after: {
                let t = count_opt(&group, "test_after", 10);
                assert!(t > 0, "DC repeater test_after must be nonzero");
                t
            },
            p_threshold: num(&group, "p_threshold", 0.1),
            lognormal_threshold: num(&group, "lognormal_threshold", 0.2),
            gaussian_threshold: num(&group, "gaussian_threshold", 0.2),
            uniform_threshold: num(&group, "uniform_threshold", 0.2),
            mean_threshold: num(&group, "mean_threshold", 0.1),
            autocor_threshold: num(&group, "autocor_threshold", 0.8),
            gmm_max_components: count_opt(&group, "max_gaussian_components", 6) as usize,
            gmm_goodness_threshold: num(&group, "goodness_threshold", 2.0),
            metric: string_opt(&group, "metric", "outer_time"),
            acc: Accumulator::default(),
            se: SeRepeater::from_options(ro),
            ci: CiRepeater::from_options(ro),
            hdi: HdiRepeater::from_options(ro),
            bb: BbRepeater::from_options(ro),
            gmm: GmmRepeater::from_options(ro),
        }
    }

    fn call(&mut self, pdata: &RunData) -> bool {
        self.acc.record(pdata, &self.metric);

        // Every sub-repeater is re-invoked each round purely to keep its
        // internal history current, regardless of which test ends up
        // deciding this round's outcome.
        self.se.call(pdata);
        self.ci.call(pdata);
        self.hdi.call(pdata);
        self.bb.call(pdata);
        self.gmm.call(pdata);

        if self.acc.count < self.starting_sample
            || (self.acc.count - self.starting_sample) % self.test_after != 0
        {
            return true;
        }

        let data = &self.acc.samples;
        if is_constant(data, self.mean_threshold) {
            return false;
        }
        if is_monotonic(data) {
            return false;
        }
        if is_autocorrelated(data, self.autocor_threshold) {
            return self.bb.last;
        }
        if is_gaussian(data, self.p_threshold) {
            return self.ci.last;
        }
        if is_lognormal(data, self.p_threshold) {
            return self.hdi.last;
        }
        if is_multimodal(data, self.gmm_max_components, self.gmm_goodness_threshold) {
            return self.gmm.last;
        }
        if is_uniform(data, self.p_threshold) {
            return false;
        }
        if self.acc.count >= self.max {
            return false;
        }
        true
    }
}

fn is_constant(data: &[f64], mean_threshold: f64) -> bool {
    let mean = stats::mean(data);
    let lo = data.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    (hi - lo) <= mean_threshold * mean
}

fn is_monotonic(data: &[f64]) -> bool {
    let nondecreasing = data.windows(2).all(|w| w[1] >= w[0]);
    let nonincreasing = data.windows(2).all(|w| w[1] <= w[0]);
    nondecreasing || nonincreasing
}

fn is_autocorrelated(data: &[f64], threshold: f64) -> bool {
    let acf = stats::autocorrelation(data);
    acf.iter().skip(1).map(|v| v.abs()).fold(0.0, f64::max) >= threshold
}

/// "Fits" iff the KS p-value is *above* `threshold` — a low p-value rejects
/// the null hypothesis that the data came from this distribution, so a
/// high p-value is the signal that the fit is good (`scipy.stats.kstest`'s
/// convention, preserved as-is).
fn is_gaussian(data: &[f64], threshold: f64) -> bool {
    use statrs::distribution::Normal;
    let mean = stats::mean(data);
    let std = stats::sample_stdev(data).max(1e-9);
    let Ok(dist) = Normal::new(mean, std) else {
        return false;
    };
    let stat = ks::one_sample_statistic(data, &dist);
    let p = ks::one_sample_p_value(stat, data.len());
    p > threshold
}

fn is_lognormal(data: &[f64], threshold: f64) -> bool {
    use statrs::distribution::LogNormal;
    if data.iter().any(|&x| x <= 0.0) {
        return false;
    }
    let ln_data: Vec<f64> = data.iter().map(|x| x.ln()).collect();
    let mu = stats::mean(&ln_data);
    let sigma = stats::sample_stdev(&ln_data).max(1e-9);
    let Ok(dist) = LogNormal::new(mu, sigma) else {
        return false;
    };
    let stat = ks::one_sample_statistic(data, &dist);
    let p = ks::one_sample_p_value(stat, data.len());
    p > threshold
}

fn is_uniform(data: &[f64], threshold: f64) -> bool {
    use statrs::distribution::Uniform;
    let lo = data.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if hi <= lo {
        return false;
    }
    let Ok(dist) = Uniform::new(lo, hi) else {
        return false;
    };
    let stat = ks::one_sample_statistic(data, &dist);
    let p = ks::one_sample_p_value(stat, data.len());
    p > threshold
}

/// Ported as-is from `_is_multimodal`: the `best_components >= 1` half of
/// the original condition is always true once a mixture exists, so this
/// effectively reduces to the goodness-of-fit check alone.
fn is_multimodal(data: &[f64], max_components: usize, goodness_threshold: f64) -> bool {
    let (components, mixture) = gmm::best_by_bic(data, max_components);
    let score = mixture.mean_log_likelihood(data);
    components >= 1 && score.abs() >= goodness_threshold
}

/// An adaptive stopping-rule policy, constructed once per experiment from
/// `options.repeats`/`options.repeater_options` and invoked after every
/// repetition (spec §4.5).
pub enum Repeater {
    Count(CountRepeater),
    Se(SeRepeater),
    Ci(CiRepeater),
    Hdi(HdiRepeater),
    Bb(BbRepeater),
    Gmm(GmmRepeater),
    Ks(KsRepeater),
    Decision(DecisionRepeater),
}

impl Repeater {
    /// Dispatches on `options.repeats`: an integer or digit-string is a
    /// fixed repeat count, `"MAX"` is the same as `CountRepeater`'s
    /// default, and each named code selects its matching rule
    /// (`repeater_factory` in `original_source/launcher/repeater.py`).
    pub fn from_options(options: &Options) -> Result<Self, LauncherError> {
        let ro = &options.repeater_options;

        if let Some(n) = options.repeats.as_u64() {
            return Ok(Repeater::Count(CountRepeater::with_limit(n, ro)));
        }

        let code = options
            .repeats
            .as_str()
            .ok_or_else(|| LauncherError::Config("repeats must be a number or string".to_string()))?;

        if let Ok(n) = code.parse::<u64>() {
            return Ok(Repeater::Count(CountRepeater::with_limit(n, ro)));
        }

        match code {
            "MAX" => Ok(Repeater::Count(CountRepeater::from_options(ro))),
            "SE" => Ok(Repeater::Se(SeRepeater::from_options(ro))),
            "CI" => Ok(Repeater::Ci(CiRepeater::from_options(ro))),
            "HDI" => Ok(Repeater::Hdi(HdiRepeater::from_options(ro))),
            "BB" => Ok(Repeater::Bb(BbRepeater::from_options(ro))),
            "GMM" => Ok(Repeater::Gmm(GmmRepeater::from_options(ro))),
            "KS" => Ok(Repeater::Ks(KsRepeater::from_options(ro))),
            "DC" => Ok(Repeater::Decision(DecisionRepeater::from_options(ro))),
            other => Err(LauncherError::UnknownRepeater(other.to_string())),
        }
    }

    pub fn should_continue(&mut self, pdata: &RunData) -> bool {
        match self {
            Repeater::Count(r) => r.call(pdata),
            Repeater::Se(r) => r.call(pdata),
            Repeater::Ci(r) => r.call(pdata),
            Repeater::Hdi(r) => r.call(pdata),
            Repeater::Bb(r) => r.call(pdata),
            Repeater::Gmm(r) => r.call(pdata),
            Repeater::Ks(r) => r.call(pdata),
            Repeater::Decision(r) => r.call(pdata),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            Repeater::Count(r) => r.acc.count,
            Repeater::Se(r) => r.acc.count,
            Repeater::Ci(r) => r.acc.count,
            Repeater::Hdi(r) => r.acc.count,
            Repeater::Bb(r) => r.acc.count,
            Repeater::Gmm(r) => r.acc.count,
            Repeater::Ks(r) => r.acc.count,
            Repeater::Decision(r) => r.acc.count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pdata_with(value: f64) -> RunData {
        let mut data = RunData::new(1);
        let mut row = BTreeMap::new();
        row.insert("outer_time".to_string(), value.to_string());
        data.add_run(&row);
        data
    }

    #[test]
    fn count_repeater_stops_at_limit() {
        let ro = RepeaterOptions::new();
        let mut r = CountRepeater::with_limit(3, &ro);
        assert!(r.call(&pdata_with(1.0)));
        assert!(r.call(&pdata_with(1.0)));
        assert!(!r.call(&pdata_with(1.0)));
    }

    #[test]
    fn se_repeater_continues_through_minimum() {
        let ro = RepeaterOptions::new();
        let mut r = SeRepeater::from_options(&ro);
        for _ in 0..5 {
            assert!(r.call(&pdata_with(1.0)));
        }
    }

    #[test]
    fn se_repeater_stops_once_converged() {
        let ro = RepeaterOptions::new();
        let mut r = SeRepeater::from_options(&ro);
        for _ in 0..30 {
            if !r.call(&pdata_with(10.0)) {
                return;
            }
        }
        panic!("SE repeater never converged on a constant series");
    }

    #[test]
    fn unrecognized_repeats_code_errors() {
        let mut options_json = serde_json::json!({
            "function": "sleep",
            "task": "sleep",
            "repeats": "NOPE",
        });
        options_json["backends"] = serde_json::json!(["local"]);
        options_json["backend_options"] = serde_json::json!({"local": {"run": "$CMD $ARGS"}});
        let options: Options = serde_json::from_value(options_json).unwrap();
        let err = Repeater::from_options(&options).unwrap_err();
        assert!(matches!(err, LauncherError::UnknownRepeater(_)));
    }

    #[test]
    fn is_constant_detects_flat_series() {
        let data = vec![10.0; 20];
        assert!(is_constant(&data, 0.1));
    }

    #[test]
    fn is_monotonic_detects_increasing_series() {
        let data: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert!(is_monotonic(&data));
    }
}
