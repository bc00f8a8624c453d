//! Typed accumulator for a single repetition's performance data (spec §3, §4.4).

use std::collections::BTreeMap;
use std::time::Instant;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    /// Matches a signed decimal literal with a fractional part, e.g. "1.5" or
    /// "-0.003". An integer literal like "42" intentionally does *not* match:
    /// this mirrors `rundata.py`'s coercion regex exactly, including its quirk
    /// of leaving bare integers as text.
    static ref DECIMAL: Regex = Regex::new(r"^-?\d+(?:\.\d+)$").unwrap();
}

/// A single metric value, coerced to a number when it looks like a decimal
/// literal and left as text otherwise (spec §4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn from_raw(raw: &str) -> Self {
        if DECIMAL.is_match(raw) {
            if let Ok(n) = raw.parse::<f64>() {
                return MetricValue::Number(n);
            }
        }
        MetricValue::Text(raw.to_string())
    }

    /// Best-effort numeric view, used by repeaters that need `f64` samples.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Text(s) => s.parse().ok(),
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            MetricValue::Number(n) => n.to_string(),
            MetricValue::Text(s) => s.clone(),
        }
    }
}

/// One row extracted from a single copy's output (spec §4.4).
pub type MetricRow = BTreeMap<String, String>;

/// Accumulator for one repetition, possibly spanning several concurrent
/// copies/ranks (spec §3).
///
/// Starts an internal wall-clock timer at construction; each call to
/// [`RunData::add_run`] records the elapsed time since construction as
/// `outer_time` for that copy, mirroring `rundata.py`'s behaviour of timing
/// the repetition externally rather than per-spawn.
pub struct RunData {
    perf: BTreeMap<String, Vec<MetricValue>>,
    start: Instant,
    ncopies: usize,
}

impl RunData {
    pub fn new(ncopies: usize) -> Self {
        let mut perf = BTreeMap::new();
        perf.insert("outer_time".to_string(), Vec::new());
        RunData {
            perf,
            start: Instant::now(),
            ncopies,
        }
    }

    /// Names of every metric besides the built-in `outer_time`.
    pub fn user_metrics(&self) -> Vec<String> {
        self.perf
            .keys()
            .filter(|k| k.as_str() != "outer_time")
            .cloned()
            .collect()
    }

    /// Append one copy's row, coercing each value and stamping `outer_time`.
    pub fn add_run(&mut self, metrics: &MetricRow) {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.perf
            .get_mut("outer_time")
            .expect("outer_time always present")
            .push(MetricValue::Number(elapsed));

        for (metric, raw) in metrics {
            self.perf
                .entry(metric.clone())
                .or_insert_with(Vec::new)
                .push(MetricValue::from_raw(raw));
        }
    }

    /// Guards against reading a [`RunData`] before any copy has reported in.
    ///
    /// Does *not* require all `ncopies` copies to have succeeded: a copy
    /// that exits non-zero is discarded by the Runner (spec §4.3) without
    /// aborting the repetition, so a fully "consumed" RunData can
    /// legitimately hold fewer rows than `ncopies`.
    fn assert_complete(&self) {
        assert!(
            !self.perf["outer_time"].is_empty(),
            "attempted to access run data before any of its {} copies completed",
            self.ncopies
        );
    }

    pub fn get_outer(&self) -> &[MetricValue] {
        self.assert_complete();
        &self.perf["outer_time"]
    }

    pub fn get_metric(&self, metric: &str) -> &[MetricValue] {
        self.assert_complete();
        &self.perf[metric]
    }

    pub fn rows_completed(&self) -> usize {
        self.perf["outer_time"].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_coercion_matches_original_quirk() {
        assert_eq!(MetricValue::from_raw("1.5"), MetricValue::Number(1.5));
        assert_eq!(MetricValue::from_raw("-0.003"), MetricValue::Number(-0.003));
        // Bare integers are left as text, matching the ported regex exactly.
        assert_eq!(MetricValue::from_raw("42"), MetricValue::Text("42".into()));
        assert_eq!(MetricValue::from_raw("NA"), MetricValue::Text("NA".into()));
    }

    #[test]
    fn add_run_tracks_outer_time_and_metrics() {
        let mut data = RunData::new(1);
        let mut row = MetricRow::new();
        row.insert("throughput".to_string(), "12.5".to_string());
        data.add_run(&row);

        assert_eq!(data.rows_completed(), 1);
        assert_eq!(data.get_metric("throughput")[0], MetricValue::Number(12.5));
        assert_eq!(data.user_metrics(), vec!["throughput".to_string()]);
    }

    #[test]
    #[should_panic(expected = "before any of its 2 copies completed")]
    fn accessing_before_completion_panics() {
        let data = RunData::new(2);
        let _ = data.get_outer();
    }

    #[test]
    fn partial_failure_leaves_a_readable_rundata() {
        // A repetition where only one of two launched copies succeeded
        // (the other discarded per spec §4.3) must still be readable, not
        // stuck below its original `ncopies`.
        let mut data = RunData::new(2);
        data.add_run(&MetricRow::new());
        assert_eq!(data.get_outer().len(), 1);
    }
}
