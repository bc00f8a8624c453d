//! Turns a captured subprocess output file into typed metric rows (spec §4.4).

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use crate::error::LauncherError;
use crate::options::MetricConfig;
use crate::rundata::MetricRow;

/// Special metric name whose filter output is parsed as `name value` pairs
/// rather than a single column (spec §4.4).
const AUTO_METRIC: &str = "auto";

/// Runs every configured metric's extraction filter against a captured
/// scratch file and assembles one row per output line.
pub struct MetricExtractor;

impl MetricExtractor {
    /// Extract all configured metrics from `scratch_file`'s contents.
    ///
    /// Returns one row map per extracted sample index. If no metrics are
    /// configured, returns a single empty row (matching `_get_metrics`'s
    /// `if not mopts: return [{}]`).
    pub fn extract(
        scratch_file: &Path,
        metrics: &BTreeMap<String, MetricConfig>,
    ) -> Result<Vec<MetricRow>, LauncherError> {
        if metrics.is_empty() {
            return Ok(vec![MetricRow::new()]);
        }

        let mut columns: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (name, cfg) in metrics {
            let cmd = format!("cat {} | {}", scratch_file.display(), cfg.extract);
            let output = Command::new("sh").arg("-c").arg(&cmd).output();

            let values = match output {
                Ok(out) if out.status.success() && out.stderr.is_empty() && !out.stdout.is_empty() => {
                    let stdout = String::from_utf8_lossy(&out.stdout);
                    if name == AUTO_METRIC {
                        for (auto_name, auto_value) in parse_auto_metrics(&stdout) {
                            columns.entry(auto_name).or_insert_with(Vec::new).push(auto_value);
                        }
                        continue;
                    }
                    stdout.split_whitespace().map(str::to_string).collect()
                }
                _ => {
                    log::warn!(
                        "failed to extract metric '{name}': did you include the correct \
                         backend and output the metric from your program?"
                    );
                    vec!["NA".to_string()]
                }
            };
            columns.insert(name.clone(), values);
        }

        let lengths: std::collections::HashSet<usize> =
            columns.values().map(Vec::len).collect();
        if lengths.len() > 1 {
            return Err(LauncherError::ExtractionMismatch(format!(
                "metrics have differing row counts: {:?}",
                columns.iter().map(|(k, v)| (k.clone(), v.len())).collect::<Vec<_>>()
            )));
        }

        let nrows = lengths.into_iter().next().unwrap_or(0);
        let mut rows = Vec::with_capacity(nrows);
        for i in 0..nrows {
            let mut row = MetricRow::new();
            for (name, values) in &columns {
                row.insert(name.clone(), values[i].clone());
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Parses `name value` pair lines emitted by an `auto` metric filter into a
/// map from metric name to the ordered list of its values (spec §4.4).
fn parse_auto_metrics(output: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in output.lines() {
        let mut cols = line.split_whitespace();
        if let (Some(name), Some(value)) = (cols.next(), cols.next()) {
            pairs.push((name.to_string(), value.to_string()));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn metric(extract: &str) -> MetricConfig {
        MetricConfig {
            extract: extract.to_string(),
            type_: "numeric".to_string(),
            units: String::new(),
            description: String::new(),
            lower_is_better: true,
        }
    }

    #[test]
    fn empty_metrics_yields_single_empty_row() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let rows = MetricExtractor::extract(tmp.path(), &BTreeMap::new()).unwrap();
        assert_eq!(rows, vec![MetricRow::new()]);
    }

    #[test]
    fn extracts_a_single_metric_per_line() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "time: 1.0\ntime: 2.0").unwrap();

        let mut metrics = BTreeMap::new();
        metrics.insert("time".to_string(), metric("grep -oE '[0-9.]+$'"));

        let rows = MetricExtractor::extract(tmp.path(), &metrics).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["time"], "1.0");
        assert_eq!(rows[1]["time"], "2.0");
    }

    #[test]
    fn auto_metric_parses_name_value_pairs() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "cycles 100\ninstructions 200").unwrap();

        let mut metrics = BTreeMap::new();
        metrics.insert("auto".to_string(), metric("cat"));

        let rows = MetricExtractor::extract(tmp.path(), &metrics).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["cycles"], "100");
        assert_eq!(rows[0]["instructions"], "200");
    }

    #[test]
    fn failed_extraction_falls_back_to_na() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut metrics = BTreeMap::new();
        metrics.insert("missing".to_string(), metric("grep nonexistent"));

        let rows = MetricExtractor::extract(tmp.path(), &metrics).unwrap();
        assert_eq!(rows[0]["missing"], "NA");
    }

    #[test]
    fn mismatched_row_counts_is_fatal() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "line").unwrap();

        let mut metrics = BTreeMap::new();
        metrics.insert("a".to_string(), metric("echo 1"));
        metrics.insert("b".to_string(), metric("printf '1\\n2\\n'"));

        let err = MetricExtractor::extract(tmp.path(), &metrics).unwrap_err();
        assert!(matches!(err, LauncherError::ExtractionMismatch(_)));
    }
}
