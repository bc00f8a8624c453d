//! Configuration merge pipeline (spec §4.6, §6).
//!
//! Sources are merged low-to-high priority: a previous experiment's markdown
//! report, an embedded sys-spec defaults file, zero or more user config
//! files (YAML or JSON by extension), an inline JSON fragment, and finally
//! command-line flags. After all explicit sources are merged, any backend
//! in the effective `backends` list still missing a `backend_options` entry
//! has its config auto-loaded from `backends/<name>.{yaml,json}`.

mod merge;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cli::Cli;
use crate::error::LauncherError;

pub use merge::merge_json;

/// Default embedded sys-spec probe commands, always merged in before any
/// user-supplied config (spec §4.6: "an always-loaded default sys-spec
/// file"). Grounded on `launcher/sys_spec.yaml` being loaded unconditionally
/// in `original_source/launcher/options.py::process_json_options`.
const DEFAULT_SYS_SPEC: &str = include_str!("default_sys_spec.yaml");

fn default_directory() -> String {
    "runlogs".to_string()
}
fn default_experiment() -> String {
    "misc".to_string()
}
fn default_timeout() -> u64 {
    3600
}
fn default_copies() -> u32 {
    1
}
fn default_repeats() -> Value {
    Value::String("1".to_string())
}
fn default_mode() -> Mode {
    Mode::Write
}
fn default_start() -> StartMode {
    StartMode::Normal
}
fn default_backends() -> Vec<String> {
    vec!["local".to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    Cold,
    Warm,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "w")]
    Write,
    #[serde(rename = "a")]
    Append,
}

/// One backend's template configuration (spec §3 table, §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    pub run: String,
    #[serde(default)]
    pub reset: Option<String>,
    #[serde(default = "default_spec_command")]
    pub run_sys_spec: String,
    #[serde(default)]
    pub hosts: Option<String>,
    #[serde(default)]
    pub hostfile: Option<String>,
    #[serde(default)]
    pub mpiflags: String,
    #[serde(default)]
    pub tmp_path: Option<String>,
}

fn default_spec_command() -> String {
    "$SPEC_COMMAND".to_string()
}

/// Per-metric descriptor (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub extract: String,
    #[serde(rename = "type", default = "default_metric_type")]
    pub type_: String,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub lower_is_better: bool,
}

fn default_metric_type() -> String {
    "numeric".to_string()
}

/// Nested sys-spec command groups: group -> key -> shell command (spec §3).
pub type SysSpecCommands = BTreeMap<String, BTreeMap<String, String>>;

/// Repeater-specific option block, kept as a raw JSON value since its shape
/// depends on which repeater rule is selected (spec §4.5).
pub type RepeaterOptions = BTreeMap<String, Value>;

/// The fully merged, effective option set (spec §3 "Options" row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub function: String,
    #[serde(default)]
    pub arguments: String,
    pub task: String,
    #[serde(default = "default_experiment")]
    pub experiment: String,
    #[serde(default = "default_directory")]
    pub directory: String,
    #[serde(default = "default_copies")]
    pub copies: u32,
    #[serde(default = "default_repeats")]
    pub repeats: Value,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_start")]
    pub start: StartMode,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub datafile: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Overrides the function-search step of the executable resolution
    /// order (spec §4.2 step 1): when set, `$FN` always resolves to
    /// `{fn_path}/{func}.py` instead of searching `fns/` or falling back to
    /// `func` verbatim. Mirrors the original's `options.get("fn_path", "")`.
    #[serde(default)]
    pub fn_path: Option<String>,
    #[serde(default = "default_backends")]
    pub backends: Vec<String>,
    #[serde(default)]
    pub backend_options: BTreeMap<String, BackendConfig>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricConfig>,
    #[serde(default)]
    pub sys_spec_commands: SysSpecCommands,
    #[serde(default)]
    pub repeater_options: RepeaterOptions,
}

/// Locates and parses configuration sources, merges them in priority order,
/// and applies the sanity checks from spec §4.6.
pub struct OptionsPipeline {
    backends_dir: PathBuf,
}

impl OptionsPipeline {
    pub fn new(backends_dir: impl Into<PathBuf>) -> Self {
        OptionsPipeline {
            backends_dir: backends_dir.into(),
        }
    }

    /// Builds the effective [`Options`] from a parsed [`Cli`].
    pub fn build(&self, cli: &Cli) -> Result<Options, LauncherError> {
        let mut cfg = Value::Object(Default::default());

        if let Some(repro) = &cli.repro {
            let prev = load_previous_markdown(repro)?;
            merge_json(&mut cfg, prev);
        }

        let sys_spec: Value = serde_yaml::from_str(DEFAULT_SYS_SPEC)
            .map_err(|e| LauncherError::Config(format!("embedded sys spec: {e}")))?;
        merge_json(&mut cfg, sys_spec);

        for path in &cli.config {
            let loaded = load_config_file(path)?;
            merge_json(&mut cfg, loaded);
        }

        if let Some(json_str) = &cli.json {
            let inline: Value = serde_json::from_str(json_str)
                .map_err(|e| LauncherError::Config(format!("--json: {e}")))?;
            merge_json(&mut cfg, inline);
        }

        self.apply_cli(&mut cfg, cli);

        let mut options: Options = serde_json::from_value(cfg)
            .map_err(|e| LauncherError::Config(format!("invalid configuration: {e}")))?;

        for name in options.backends.clone() {
            if !options.backend_options.contains_key(&name) {
                if let Some(loaded) = self.auto_load_backend(&name)? {
                    let mut as_value = serde_json::to_value(&options)
                        .map_err(|e| LauncherError::Config(e.to_string()))?;
                    merge_json(&mut as_value, loaded);
                    options = serde_json::from_value(as_value)
                        .map_err(|e| LauncherError::Config(e.to_string()))?;
                }
            }
        }

        self.sanity_check(&options)?;
        Ok(options)
    }

    /// Overlays command-line flags, the highest-priority source (spec §4.6).
    fn apply_cli(&self, cfg: &mut Value, cli: &Cli) {
        let obj = cfg.as_object_mut().expect("cfg is always an object");

        if !cli.func.is_empty() {
            obj.insert("function".into(), Value::String(cli.func[0].clone()));
            obj.insert(
                "arguments".into(),
                Value::String(cli.func[1..].join(" ")),
            );
        }

        if let Some(mpl) = cli.mpl {
            obj.insert("copies".into(), Value::from(mpl));
        } else if !obj.contains_key("copies") {
            obj.insert("copies".into(), Value::from(1));
        }

        if let Some(repeats) = &cli.repeats {
            obj.insert("repeats".into(), Value::String(repeats.clone()));
        } else if !obj.contains_key("repeats") {
            obj.insert("repeats".into(), Value::String("1".into()));
        }

        if let Some(experiment) = &cli.experiment {
            obj.insert("experiment".into(), Value::String(experiment.clone()));
        }
        if let Some(dir) = &cli.directory {
            obj.insert("directory".into(), Value::String(dir.clone()));
        }
        if let Some(timeout) = cli.timeout {
            obj.insert("timeout".into(), Value::from(timeout));
        }

        let task = cli.task.clone().unwrap_or_else(|| {
            obj.get("task")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    obj.get("function")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                })
        });
        obj.insert("task".into(), Value::String(task));

        obj.insert(
            "mode".into(),
            Value::String(if cli.append { "a".into() } else { "w".into() }),
        );

        let start = if cli.cold {
            "cold"
        } else if cli.warm {
            "warm"
        } else {
            obj.get("start").and_then(Value::as_str).unwrap_or("normal")
        };
        obj.insert("start".into(), Value::String(start.to_string()));

        // Backends appends across command-line flags on top of file/JSON values.
        let mut backends: Vec<Value> = obj
            .get("backends")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for b in &cli.backend {
            backends.push(Value::String(b.clone()));
        }
        if backends.is_empty() {
            backends.push(Value::String("local".into()));
        }
        obj.insert("backends".into(), Value::Array(backends));

        obj.insert("verbose".into(), Value::Bool(cli.verbose));
        if let Some(desc) = &cli.description {
            obj.insert("description".into(), Value::String(desc.clone()));
        }
        if let Some(input) = &cli.input {
            obj.insert("datafile".into(), Value::String(input.clone()));
        }
    }

    fn auto_load_backend(&self, name: &str) -> Result<Option<Value>, LauncherError> {
        for ext in ["yaml", "json"] {
            let candidate = self.backends_dir.join(format!("{name}.{ext}"));
            if candidate.exists() {
                return Ok(Some(load_config_file(candidate.to_str().unwrap())?));
            }
        }
        Ok(None)
    }

    fn sanity_check(&self, options: &Options) -> Result<(), LauncherError> {
        if options.function.is_empty() {
            return Err(LauncherError::Config(
                "missing required argument: function or program to run".to_string(),
            ));
        }
        if !options.arguments.is_empty() && options.datafile.is_some() {
            log::warn!(
                "command-line arguments to function may conflict with input data file"
            );
        }
        Ok(())
    }
}

fn load_config_file(path: &str) -> Result<Value, LauncherError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| LauncherError::Config(format!("reading {path}: {e}")))?;
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".yaml") || lower.ends_with(".yml") {
        serde_yaml::from_str(&content)
            .map_err(|e| LauncherError::Config(format!("parsing {path}: {e}")))
    } else if lower.ends_with(".json") {
        serde_json::from_str(&content)
            .map_err(|e| LauncherError::Config(format!("parsing {path}: {e}")))
    } else {
        Err(LauncherError::Config(format!(
            "unrecognized config file format: {path}"
        )))
    }
}

/// Parses the `## Runtime options` JSON block out of a previous run's
/// markdown report, for `--repro` (spec §6, §8 "Markdown reproducibility").
fn load_previous_markdown(path: &str) -> Result<Value, LauncherError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| LauncherError::Config(format!("reading {path}: {e}")))?;

    let mut capturing = false;
    let mut json_text = String::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed == "## Runtime options" {
            capturing = true;
        } else if trimmed == "## Field description" {
            break;
        } else if capturing {
            if trimmed == "```json" || trimmed == "```" {
                continue;
            }
            json_text.push_str(line);
            json_text.push('\n');
        }
    }

    serde_json::from_str(&json_text)
        .map_err(|e| LauncherError::Config(format!("parsing --repro markdown: {e}")))
}

pub fn resolve_backend_config<'a>(
    options: &'a Options,
    backend: &str,
) -> Result<&'a BackendConfig, LauncherError> {
    options
        .backend_options
        .get(backend)
        .ok_or_else(|| LauncherError::UnknownBackend(backend.to_string()))
}

pub fn options_without_sys_spec(options: &Options) -> Value {
    let mut v = serde_json::to_value(options).expect("Options always serializes");
    if let Some(obj) = v.as_object_mut() {
        obj.remove("sys_spec_commands");
    }
    v
}

/// Default path to search for auto-loaded backend config files.
pub fn default_backends_dir(base: impl AsRef<Path>) -> PathBuf {
    base.as_ref().join("backends")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["launch"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn backends_append_across_cli_flags() {
        let pipeline = OptionsPipeline::new("backends");
        let cli = parse(&["nope", "-b", "local", "-b", "local"]);
        let options = pipeline.build(&cli).unwrap();
        assert_eq!(options.backends, vec!["local", "local"]);
    }

    #[test]
    fn missing_function_is_a_config_error() {
        let pipeline = OptionsPipeline::new("backends");
        let cli = parse(&[]);
        let err = pipeline.build(&cli).unwrap_err();
        assert!(matches!(err, LauncherError::Config(_)));
    }

    #[test]
    fn later_file_wins_for_scalar_task() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        std::fs::write(&a, r#"{"task": "t3"}"#).unwrap();
        std::fs::write(&b, r#"{"task": "t4"}"#).unwrap();

        let pipeline = OptionsPipeline::new("backends");
        let cli = parse(&[
            "nope",
            "-f",
            a.to_str().unwrap(),
            "-f",
            b.to_str().unwrap(),
        ]);
        let options = pipeline.build(&cli).unwrap();
        assert_eq!(options.task, "t4");
    }
}
