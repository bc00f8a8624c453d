//! Append-only CSV + Markdown sink (spec §4.8, grounded on
//! `original_source/launcher/logger.py`). Spec.md §1 calls this "a thin
//! external collaborator… an append-only sink", out of scope for redesign,
//! but it is the only persistence mechanism the Orchestrator has, so its
//! shape is ported field-for-field.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;

use crate::error::LauncherError;
use crate::options::{Mode, Options, SysSpecCommands};

/// One field's recorded type/description, written once to the `.md` file's
/// "Field description" section the first time that field is seen
/// (`add_column`/`add_row_data` in the original).
struct FieldMeta {
    type_: String,
    desc: String,
}

/// Holds column-scoped fields (repeated on every row of a repetition) and
/// row-scoped fields (one set per copy), plus the metadata needed to render
/// the markdown report (spec §6 "Persisted state").
pub struct Logger {
    basefn: PathBuf,
    columns: BTreeMap<String, String>,
    rows: Vec<BTreeMap<String, String>>,
    metadata: BTreeMap<String, FieldMeta>,
    preamble: String,
    start: Instant,
}

impl Logger {
    /// Creates the experiment subdirectory if needed and renders the
    /// preamble (hostname, UTC timestamp, git short hash if available,
    /// effective options minus `sys_spec_commands`) the way
    /// `Logger.__init__` does.
    pub fn new(topdir: &str, task: &str, options: &Options) -> Result<Self, LauncherError> {
        let dir = PathBuf::from(topdir).join(&options.experiment);
        std::fs::create_dir_all(&dir)
            .map_err(|e| LauncherError::Config(format!("creating log directory {}: {e}", dir.display())))?;

        let basename = task.rsplit('/').next().unwrap_or(task);
        let basefn = dir.join(basename);

        if options.verbose {
            println!("Logging runs to: {}", basefn.display());
        }

        let hostname = Command::new("hostname")
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_else(|| "unknown-host".to_string());

        let now = Utc::now();
        let mut preamble = format!(
            "This file describes the fields in the file {task}.csv. \
             The measurements were run on {hostname}, starting at {now} (UTC).\n"
        );

        if let Some(hash) = git_short_hash() {
            preamble.push_str(&format!("The source code version used was from git hash: {hash}\n"));
        }

        preamble.push_str("\n## Runtime options\n\n```json\n");
        preamble.push_str(&serde_json::to_string_pretty(&crate::options::options_without_sys_spec(options))
            .map_err(|e| LauncherError::Config(e.to_string()))?);
        preamble.push_str("\n```");

        Ok(Logger {
            basefn,
            columns: BTreeMap::new(),
            rows: Vec::new(),
            metadata: BTreeMap::new(),
            preamble,
            start: Instant::now(),
        })
    }

    /// Records a field shared across every row of the current repetition.
    pub fn add_column(&mut self, field: &str, value: impl Into<String>, type_: &str, desc: &str) {
        self.metadata
            .entry(field.to_string())
            .or_insert_with(|| FieldMeta { type_: type_.to_string(), desc: desc.to_string() });
        self.columns.insert(field.to_string(), value.into());
    }

    /// Records one copy's field, starting a new row whenever the field
    /// already exists in the current (last) row — mirroring
    /// `add_row_data`'s "new row once this key repeats" heuristic.
    pub fn add_row_data(&mut self, field: &str, value: impl Into<String>, type_: &str, desc: &str) {
        self.metadata
            .entry(field.to_string())
            .or_insert_with(|| FieldMeta { type_: type_.to_string(), desc: desc.to_string() });

        let needs_new_row = self.rows.last().map_or(true, |r| r.contains_key(field));
        if needs_new_row {
            self.rows.push(BTreeMap::new());
        }
        self.rows.last_mut().unwrap().insert(field.to_string(), value.into());
    }

    pub fn clear_rows(&mut self) {
        self.rows.clear();
    }

    /// Writes the union of columns+rows as CSV. The header is written only
    /// on a truncating write or when the target file doesn't yet exist
    /// (`save_csv`'s `mode == "w" or os.path.getsize(fn) == 0` check).
    pub fn save_csv(&self, mode: Mode) -> Result<(), LauncherError> {
        assert!(!self.rows.is_empty(), "there's no row data to save");

        let path = self.basefn.with_extension("csv");
        let write_header = mode == Mode::Write || !path.exists() || path.metadata().map(|m| m.len() == 0).unwrap_or(true);

        let mut fieldnames: Vec<String> = self.columns.keys().cloned().collect();
        for key in self.rows[0].keys() {
            if !fieldnames.contains(key) {
                fieldnames.push(key.clone());
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(mode == Mode::Append)
            .truncate(mode == Mode::Write)
            .open(&path)
            .map_err(|e| LauncherError::Config(format!("opening {}: {e}", path.display())))?;

        let mut writer = csv::WriterBuilder::new().from_writer(file);
        if write_header {
            writer
                .write_record(&fieldnames)
                .map_err(|e| LauncherError::Config(e.to_string()))?;
        }
        for row in &self.rows {
            let record: Vec<String> = fieldnames
                .iter()
                .map(|f| self.columns.get(f).cloned().unwrap_or_else(|| row.get(f).cloned().unwrap_or_default()))
                .collect();
            writer
                .write_record(&record)
                .map_err(|e| LauncherError::Config(e.to_string()))?;
        }
        writer.flush().map_err(|e| LauncherError::Config(e.to_string()))?;
        Ok(())
    }

    /// Writes the markdown report: preamble, `## Field description`, and,
    /// if any sys specs were collected, `## System configuration`. In
    /// append mode, a pre-existing `.md` file is left untouched, matching
    /// `save_md`'s early return.
    pub fn save_md(&self, mode: Mode, sys_specs: &SysSpecCommands) -> Result<(), LauncherError> {
        let path = self.basefn.with_extension("md");
        if mode == Mode::Append && path.exists() {
            return Ok(());
        }

        let mut body = String::new();
        let now = Utc::now();
        let elapsed = self.start.elapsed().as_secs();
        body.push_str(&format!("Experiment completed at {now} (total experiment time: {elapsed}s).\n\n"));
        body.push_str(&self.preamble);
        body.push_str("\n\n## Field description\n\n");

        for (field, meta) in &self.metadata {
            body.push_str(&format!("  * `{field}` ({}): {}.\n", meta.type_, meta.desc));
        }

        if !sys_specs.is_empty() {
            body.push_str("\n## System configuration\n\n```json\n");
            let value: Value = serde_json::to_value(sys_specs).map_err(|e| LauncherError::Config(e.to_string()))?;
            body.push_str(&serde_json::to_string_pretty(&value).map_err(|e| LauncherError::Config(e.to_string()))?);
            body.push_str("\n```\n");
        }

        std::fs::write(&path, body).map_err(|e| LauncherError::Config(format!("writing {}: {e}", path.display())))?;
        Ok(())
    }
}

fn git_short_hash() -> Option<String> {
    let out = Command::new("git").args(["rev-parse", "--short", "HEAD"]).output().ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Mode, StartMode};
    use std::collections::BTreeMap;

    fn sample_options(experiment: &str) -> Options {
        Options {
            function: "nope".into(),
            arguments: String::new(),
            task: "t".into(),
            experiment: experiment.into(),
            directory: "runlogs".into(),
            copies: 1,
            repeats: Value::String("1".into()),
            timeout: 60,
            start: StartMode::Normal,
            mode: Mode::Write,
            verbose: false,
            datafile: None,
            description: None,
            backends: vec!["local".into()],
            backend_options: BTreeMap::new(),
            metrics: BTreeMap::new(),
            sys_spec_commands: SysSpecCommands::new(),
            repeater_options: BTreeMap::new(),
        }
    }

    #[test]
    fn csv_round_trip_has_expected_header_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let options = sample_options("e1");
        let mut log = Logger::new(dir.path().to_str().unwrap(), "t1", &options).unwrap();

        log.add_column("task", "t1", "string", "Task name");
        log.add_column("repeat", "1", "int", "Batch number");
        log.add_row_data("rank", "0", "int", "Concurrent run number");
        log.add_row_data("outer_time", "1.23", "numeric", "External measured run time (s)");

        log.save_csv(Mode::Write).unwrap();

        let csv_path = dir.path().join("e1").join("t1.csv");
        let content = std::fs::read_to_string(csv_path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), "task,repeat,rank,outer_time");
        assert_eq!(lines.next().unwrap(), "t1,1,0,1.23");
    }

    #[test]
    fn md_skips_rewrite_when_appending_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let options = sample_options("e2");
        let mut log = Logger::new(dir.path().to_str().unwrap(), "t2", &options).unwrap();
        log.add_row_data("outer_time", "1.0", "numeric", "time");
        log.save_md(Mode::Write, &SysSpecCommands::new()).unwrap();

        let md_path = dir.path().join("e2").join("t2.md");
        let first = std::fs::read_to_string(&md_path).unwrap();

        log.save_md(Mode::Append, &SysSpecCommands::new()).unwrap();
        let second = std::fs::read_to_string(&md_path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn add_row_data_starts_new_row_on_repeated_field() {
        let dir = tempfile::tempdir().unwrap();
        let options = sample_options("e3");
        let mut log = Logger::new(dir.path().to_str().unwrap(), "t3", &options).unwrap();
        log.add_row_data("rank", "0", "int", "rank");
        log.add_row_data("rank", "1", "int", "rank");
        assert_eq!(log.rows.len(), 2);
    }
}
