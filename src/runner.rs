//! Launches, supervises, and harvests a repetition's subprocesses (spec §4.3,
//! §5). Concurrency is realized with a small Tokio task group rather than a
//! manual poll loop, using the teacher's already-declared `tokio`
//! (`rt-multi-thread`, `process`, `time`) dependency.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::LauncherError;
use crate::extractor::MetricExtractor;
use crate::options::MetricConfig;
use crate::rundata::RunData;

use std::collections::BTreeMap;

pub struct Runner;

impl Runner {
    /// Runs `cmds` (one per copy) under a shared deadline, extracting
    /// metrics for every copy that exits cleanly.
    ///
    /// Returns `Ok(None)` when the deadline elapses before every copy
    /// finishes (spec §5 "Cancellation": the whole repetition is reported
    /// as failed, not retried). Returns `Err` immediately on a `127` exit
    /// status (shell "command not found"), since that is a configuration
    /// fault rather than a flaky benchmark. When `verbose` is set, each
    /// successful copy's captured output is printed to stdout, mirroring
    /// `_wait_for_run`'s behaviour of seeking back through the scratch file.
    pub async fn run(
        cmds: &[String],
        timeout_secs: u64,
        input: Option<&str>,
        metrics: &BTreeMap<String, MetricConfig>,
        verbose: bool,
    ) -> Result<Option<RunData>, LauncherError> {
        let deadline = Duration::from_secs(timeout_secs);
        let mut data = RunData::new(cmds.len());

        let mut children = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            let scratch = NamedTempFile::new()
                .map_err(|e| LauncherError::Config(format!("creating scratch file: {e}")))?;

            let stdin = match input {
                Some(path) => Stdio::from(
                    std::fs::File::open(path)
                        .map_err(|e| LauncherError::Config(format!("opening input {path}: {e}")))?,
                ),
                None => Stdio::null(),
            };

            let scratch_path: PathBuf = scratch.path().to_path_buf();
            // Spec §4.3 step 2: stdout *and* stderr both go to the scratch
            // file (the original's `stderr=subprocess.STDOUT`) — extractor
            // filters for instrumentation wrappers like `perf`/`strace`
            // read their metrics off stderr, so merging is required, not
            // cosmetic.
            let stdout = Stdio::from(
                scratch
                    .reopen()
                    .map_err(|e| LauncherError::Config(format!("reopening scratch file: {e}")))?,
            );
            let stderr = Stdio::from(
                scratch
                    .reopen()
                    .map_err(|e| LauncherError::Config(format!("reopening scratch file: {e}")))?,
            );

            let child = Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .stdin(stdin)
                .stdout(stdout)
                .stderr(stderr)
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| LauncherError::Config(format!("spawning command: {e}")))?;

            children.push((child, scratch, scratch_path));
        }

        let waits = children
            .into_iter()
            .map(|(mut child, scratch, path)| async move {
                let status = child.wait().await;
                (status, scratch, path)
            });

        let joined = timeout(deadline, futures::future::join_all(waits)).await;

        let results = match joined {
            Ok(results) => results,
            Err(_) => {
                log::warn!(
                    "repetition exceeded its {}s timeout; remaining copies were killed",
                    timeout_secs
                );
                return Ok(None);
            }
        };

        for (status, _scratch, path) in results {
            let status = status
                .map_err(|e| LauncherError::Config(format!("waiting for child: {e}")))?;

            match status.code() {
                Some(127) => {
                    return Err(LauncherError::ShellNotFound(path.display().to_string()));
                }
                Some(0) => {
                    if verbose {
                        if let Ok(captured) = std::fs::read_to_string(&path) {
                            print!("{captured}");
                        }
                    }
                    let rows = MetricExtractor::extract(&path, metrics)?;
                    for row in rows {
                        data.add_run(&row);
                    }
                }
                other => {
                    log::warn!(
                        "copy exited with status {:?}; its metrics are discarded",
                        other
                    );
                }
            }
        }

        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_copies_contribute_rows() {
        let cmds = vec!["echo ok".to_string(), "echo ok".to_string()];
        let metrics = BTreeMap::new();
        let result = Runner::run(&cmds, 5, None, &metrics, false).await.unwrap();
        assert!(result.is_some());
        assert_eq!(result.unwrap().rows_completed(), 2);
    }

    #[tokio::test]
    async fn not_found_exit_code_is_fatal() {
        let cmds = vec!["exit 127".to_string()];
        let metrics = BTreeMap::new();
        let err = Runner::run(&cmds, 5, None, &metrics, false).await.unwrap_err();
        assert!(matches!(err, LauncherError::ShellNotFound(_)));
    }

    #[tokio::test]
    async fn timeout_yields_no_rundata() {
        let cmds = vec!["sleep 5".to_string()];
        let metrics = BTreeMap::new();
        let result = Runner::run(&cmds, 1, None, &metrics, false).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_is_discarded_not_fatal() {
        let cmds = vec!["exit 1".to_string(), "echo ok".to_string()];
        let metrics = BTreeMap::new();
        let result = Runner::run(&cmds, 5, None, &metrics, false).await.unwrap();
        assert_eq!(result.unwrap().rows_completed(), 1);
    }

    #[tokio::test]
    async fn stderr_is_merged_into_the_scratch_file() {
        let cmds = vec!["echo out; echo err 1>&2".to_string()];
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "err_line".to_string(),
            MetricConfig {
                extract: "grep -o err".to_string(),
                type_: "string".to_string(),
                units: String::new(),
                description: String::new(),
                lower_is_better: false,
            },
        );
        let result = Runner::run(&cmds, 5, None, &metrics, false).await.unwrap().unwrap();
        assert_eq!(result.get_metric("err_line")[0].to_display_string(), "err");
    }
}
