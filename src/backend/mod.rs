//! A single backend: its template configuration, resolved host list, and the
//! macro-substitution logic that turns a function call into a shell command
//! (spec §4.2, grounded on `original_source/launcher/launcher.py`).

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::LauncherError;
use crate::options::BackendConfig;

/// Tokens recognized by a backend's `mpirun`/`mpiexec`/`srun` template.
const MPI_TOKENS: [&str; 3] = ["mpirun", "mpiexec", "srun"];

/// A configured backend, ready to expand macros and emit commands.
pub struct Backend {
    pub name: String,
    config: BackendConfig,
    hosts: Vec<String>,
    tmp_path: Option<PathBuf>,
    fn_dir: Option<PathBuf>,
}

impl Backend {
    /// Builds a backend from its name and config, resolving its host list
    /// and (if `tmp_path` is configured) creating a unique scratch directory.
    /// `fn_path`, when set, overrides the function-search step of executable
    /// resolution (spec §4.2 step 1 / `Options::fn_path`).
    pub fn new(
        name: impl Into<String>,
        config: BackendConfig,
        fn_path: Option<&str>,
    ) -> Result<Self, LauncherError> {
        let hosts = resolve_hosts(&config)?;
        let tmp_path = match &config.tmp_path {
            Some(base) => Some(create_unique_tmp_dir(base)?),
            None => None,
        };
        Ok(Backend {
            name: name.into(),
            config,
            hosts,
            tmp_path,
            fn_dir: fn_path.map(PathBuf::from),
        })
    }

    /// A backend is mpi-style iff its `run` template names both `$MPL` and
    /// one of the known MPI launcher tokens (spec §4.2).
    pub fn is_mpi_style(&self) -> bool {
        let lower = self.config.run.to_ascii_lowercase();
        lower.contains("$mpl") && MPI_TOKENS.iter().any(|tok| lower.contains(tok))
    }

    /// Alias kept for readability at call sites that only care about
    /// whether a single emitted command already covers all copies.
    pub fn handles_concurrency_internally(&self) -> bool {
        self.is_mpi_style()
    }

    /// Builds the base command for this backend, honoring `nested` (spec
    /// §4.2 step 2): when a nested command is supplied it replaces `$CMD`
    /// and any `$ARGS` occurrence is stripped rather than expanded, since
    /// the nested command already carries its own arguments.
    fn build_base_command(&self, copies: u32, resolved_exec: &str, args: &str, nested: Option<&str>) -> String {
        let mut cmd = self.config.run.clone();
        if let Some(inner) = nested {
            cmd = cmd.replace("$CMD", inner);
            if self.is_mpi_style() {
                cmd = cmd.replace("$MPL", &copies.to_string());
            }
            cmd = strip_args_token(&cmd);
        } else {
            cmd = cmd.replace("$CMD", resolved_exec);
            cmd = cmd.replace("$MPL", &copies.to_string());
            if cmd.contains("$ARGS") {
                cmd = cmd.replace("$ARGS", args);
            } else if !args.is_empty() {
                cmd.push(' ');
                cmd.push_str(args);
            }
        }
        cmd
    }

    /// Expands every remaining macro for a single emitted copy (spec §4.2
    /// step 3).
    fn expand_macros(&self, src: &str, task: &str, func: &str, args: &str, copy_index: usize) -> String {
        let mut out = src
            .replace("$TASK", task)
            .replace("$FN", func)
            .replace("$ARGS", args)
            .replace("$MPIFLAGS", &self.config.mpiflags);

        if out.contains("$TMP_PATH") {
            let tmp = self.tmp_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
            out = out.replace("$TMP_PATH", &tmp);
        }

        if !self.hosts.is_empty() {
            let host = &self.hosts[copy_index % self.hosts.len()];
            out = out.replace("$HOST", host);
        }
        for (i, host) in self.hosts.iter().enumerate() {
            out = out.replace(&format!("$HOST{i}"), host);
        }
        out
    }

    /// Resolves the executable path for a function name (spec §4.2
    /// "Executable resolution order").
    pub fn resolve_exec(&self, func: &str, fn_dir: Option<&Path>) -> String {
        if let Some(dir) = fn_dir {
            let candidate = dir.join(format!("{func}.py"));
            return candidate.display().to_string();
        }
        let as_path = Path::new(func);
        if as_path.is_absolute() && as_path.exists() {
            return func.to_string();
        }
        if let Some(found) = find_in_fns_dir(func) {
            return found;
        }
        func.to_string()
    }

    /// Produces the commands to run for one repetition: one command per
    /// copy for ordinary backends, or a single already-parallel command for
    /// mpi-style ones (spec §4.2 step 4).
    pub fn run_commands(
        &self,
        copies: u32,
        task: &str,
        func: &str,
        args: &str,
        nested: Option<&str>,
    ) -> Vec<String> {
        let resolved = self.resolve_exec(func, self.fn_dir.as_deref());
        let base = self.build_base_command(copies, &resolved, args, nested);

        if self.is_mpi_style() {
            vec![self.expand_macros(&base, task, func, args, 0)]
        } else {
            (0..copies as usize)
                .map(|i| self.expand_macros(&base, task, func, args, i))
                .collect()
        }
    }

    /// Wraps each configured sys-spec command in this backend's
    /// `run_sys_spec` template, expanding macros with copy index 0 (spec
    /// §4.2 `SysSpecCommands`).
    pub fn sys_spec_command(&self, probe: &str, task: &str, func: &str, args: &str) -> String {
        let templated = self.config.run_sys_spec.replace("$SPEC_COMMAND", probe);
        self.expand_macros(&templated, task, func, args, 0)
    }

    /// Runs the configured reset command once, if any (spec §4.2 `Reset`).
    /// A non-zero status is fatal for the `local` backend and a warning for
    /// any other.
    pub fn reset(&self) -> Result<(), LauncherError> {
        let Some(reset_cmd) = &self.config.reset else {
            return Ok(());
        };
        let status = Command::new("sh")
            .arg("-c")
            .arg(reset_cmd)
            .status()
            .map_err(|e| LauncherError::ResetFailure(e.to_string()))?;

        if !status.success() {
            if self.name == "local" {
                return Err(LauncherError::ResetFailure(format!(
                    "reset command failed on local backend (status {status}); \
                     try flushing caches manually before retrying"
                )));
            }
            log::warn!("reset command failed on backend '{}' (status {status})", self.name);
        }
        Ok(())
    }
}

fn strip_args_token(cmd: &str) -> String {
    cmd.replace(" $ARGS", "").replace("$ARGS", "")
}

fn resolve_hosts(config: &BackendConfig) -> Result<Vec<String>, LauncherError> {
    if let Some(csv) = &config.hosts {
        return Ok(csv.split(',').map(str::trim).map(str::to_string).collect());
    }
    if let Some(path) = &config.hostfile {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LauncherError::Config(format!("reading hostfile {path}: {e}")))?;
        let hosts: Vec<String> = content.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();
        if !hosts.is_empty() {
            return Ok(hosts);
        }
        log::warn!("hostfile {path} is empty; defaulting to the local node");
        return Ok(vec![local_node_name()]);
    }
    log::warn!("no hosts or hostfile configured; defaulting to the local node");
    Ok(vec![local_node_name()])
}

fn local_node_name() -> String {
    hostname_fallback()
}

fn hostname_fallback() -> String {
    Command::new("hostname")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "localhost".to_string())
}

fn create_unique_tmp_dir(base: &str) -> Result<PathBuf, LauncherError> {
    let dir = tempfile::Builder::new()
        .prefix("launcher-")
        .tempdir_in(base)
        .map_err(|e| LauncherError::Config(format!("creating tmp_path under {base}: {e}")))?;
    Ok(dir.into_path())
}

fn find_in_fns_dir(func: &str) -> Option<String> {
    let base = Path::new("fns").join(func);
    let glob_prefix = base.join(func);
    let parent = glob_prefix.parent()?;
    let stem = glob_prefix.file_name()?.to_str()?;
    let entries = std::fs::read_dir(parent).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.starts_with(stem) && path.is_file() && is_executable(&path) {
                return Some(path.display().to_string());
            }
        }
    }
    None
}

/// Mirrors `os.access(fn, os.X_OK)`: a candidate with no executable bit set
/// for anyone is skipped, since `sh -c` would otherwise fail on it at
/// launch time rather than at resolution time (spec §4.2 step 1).
#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(run: &str) -> BackendConfig {
        BackendConfig {
            run: run.to_string(),
            reset: None,
            run_sys_spec: "$SPEC_COMMAND".to_string(),
            hosts: Some("node1".to_string()),
            hostfile: None,
            mpiflags: String::new(),
            tmp_path: None,
        }
    }

    #[test]
    fn detects_mpi_style_backend() {
        let b = Backend::new("mpi", cfg("mpirun -np $MPL $CMD $ARGS"), None).unwrap();
        assert!(b.is_mpi_style());
    }

    #[test]
    fn local_backend_is_not_mpi_style() {
        let b = Backend::new("local", cfg("$CMD $ARGS"), None).unwrap();
        assert!(!b.is_mpi_style());
    }

    #[test]
    fn local_backend_emits_one_command_per_copy() {
        let b = Backend::new("local", cfg("$CMD $ARGS"), None).unwrap();
        let cmds = b.run_commands(3, "t", "sleep", "1", None);
        assert_eq!(cmds.len(), 3);
        assert!(cmds[0].contains("sleep"));
        assert!(cmds[0].contains("1"));
    }

    #[test]
    fn mpi_backend_emits_a_single_command() {
        let b = Backend::new("mpi", cfg("mpirun -np $MPL $CMD $ARGS"), None).unwrap();
        let cmds = b.run_commands(2, "t", "sleep", "1", None);
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].contains("-np 2"));
    }

    #[test]
    fn nested_command_strips_args_token() {
        let b = Backend::new("ssh", cfg("ssh $HOST $CMD"), None).unwrap();
        let cmds = b.run_commands(1, "t", "sleep", "1", Some("inner --cmd"));
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].contains("inner --cmd"));
        assert!(!cmds[0].contains("$ARGS"));
    }

    #[test]
    fn host_round_robins_across_copies() {
        let mut config = cfg("$CMD $HOST");
        config.hosts = Some("a,b".to_string());
        let b = Backend::new("local", config, None).unwrap();
        let cmds = b.run_commands(2, "t", "sleep", "", None);
        assert!(cmds[0].ends_with('a'));
        assert!(cmds[1].ends_with('b'));
    }

    #[test]
    fn fn_path_override_takes_priority_over_fns_dir_search() {
        let b = Backend::new("local", cfg("$CMD"), Some("/opt/funcs")).unwrap();
        let cmds = b.run_commands(1, "t", "myfunc", "", None);
        assert!(cmds[0].contains("/opt/funcs/myfunc.py"));
    }

    #[cfg(unix)]
    #[test]
    fn fns_dir_search_skips_non_executable_candidates() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fn_subdir = dir.path().join("probe");
        std::fs::create_dir_all(&fn_subdir).unwrap();
        let candidate = fn_subdir.join("probe.sh");
        std::fs::write(&candidate, "#!/bin/sh\necho hi\n").unwrap();
        std::fs::set_permissions(&candidate, std::fs::Permissions::from_mode(0o644)).unwrap();

        assert!(!is_executable(&candidate));
        std::fs::set_permissions(&candidate, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable(&candidate));
    }
}
