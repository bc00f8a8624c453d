//! Composes an ordered list of backends into the command(s) actually
//! executed for one repetition (spec §4.2 "BackendChain", grounded on
//! `original_source/launcher/launch.py`'s `chain_of_commands`/`get_sys_specs`).

use std::process::Command;

use crate::backend::Backend;
use crate::options::SysSpecCommands;

/// An ordered composition of backends, outermost first.
pub struct BackendChain {
    backends: Vec<Backend>,
}

impl BackendChain {
    pub fn new(backends: Vec<Backend>) -> Self {
        BackendChain { backends }
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Builds the command(s) to execute for one repetition.
    ///
    /// A single backend just emits its own commands. With more than one,
    /// any backend further down the chain that already fans out internally
    /// (mpi-style) must only be asked for `copies` once — every other
    /// backend in the chain collapses to a single wrapper command. This
    /// mirrors `chain_of_commands`'s `has_internal_concurrency` handling
    /// exactly: whichever single backend handles concurrency gets `copies`,
    /// every other backend gets `1`.
    pub fn commands(&self, copies: u32, task: &str, func: &str, args: &str) -> Vec<String> {
        if self.backends.is_empty() {
            return Vec::new();
        }
        if self.backends.len() == 1 {
            return self.backends[0].run_commands(copies, task, func, args, None);
        }

        let has_internal_concurrency = self.backends.iter().any(Backend::handles_concurrency_internally);

        let last_index = self.backends.len() - 1;
        let last = &self.backends[last_index];
        let last_copies = if last.handles_concurrency_internally() { copies } else { 1 };
        let mut cmd = last
            .run_commands(last_copies, task, func, args, None)
            .into_iter()
            .next()
            .unwrap_or_default();

        for backend in self.backends[1..last_index].iter().rev() {
            let this_copies = if backend.handles_concurrency_internally() { copies } else { 1 };
            cmd = backend
                .run_commands(this_copies, task, func, args, Some(&cmd))
                .into_iter()
                .next()
                .unwrap_or_default();
        }

        let outer = &self.backends[0];
        let outer_copies = if outer.handles_concurrency_internally() {
            copies
        } else if has_internal_concurrency {
            1
        } else {
            copies
        };

        outer.run_commands(outer_copies, task, func, args, Some(&cmd))
    }

    /// Runs every sys-spec probe defined on the last backend in the chain,
    /// wrapping each in the full chain's composition (so an SSH+local chain
    /// probes the remote host, not the launching machine). Any probe that
    /// fails to execute is recorded as an inline `"Error: ..."` string
    /// rather than aborting the whole sys-spec collection.
    pub fn sys_specs(&self, sys_spec_commands: &SysSpecCommands, task: &str, func: &str, args: &str) -> SysSpecCommands {
        let mut out = SysSpecCommands::new();
        let Some(last) = self.backends.last() else {
            return out;
        };

        for (group, entries) in sys_spec_commands {
            let mut resolved = std::collections::BTreeMap::new();
            for (key, probe) in entries {
                let wrapped = last.sys_spec_command(probe, task, func, args);
                let full_cmd = self.wrap_with_outer_backends(&wrapped);
                resolved.insert(key.clone(), run_probe(&full_cmd));
            }
            out.insert(group.clone(), resolved);
        }
        out
    }

    fn wrap_with_outer_backends(&self, innermost: &str) -> String {
        let mut cmd = innermost.to_string();
        for backend in self.backends[..self.backends.len().saturating_sub(1)].iter().rev() {
            cmd = backend
                .run_commands(1, "", "", "", Some(&cmd))
                .into_iter()
                .next()
                .unwrap_or(cmd);
        }
        cmd
    }
}

fn run_probe(cmd: &str) -> String {
    let normalized = cmd.replace('\n', ";");
    match Command::new("sh").arg("-c").arg(&normalized).output() {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_string(),
        Ok(out) => format!(
            "Error: command exited with status {}",
            out.status.code().unwrap_or(-1)
        ),
        Err(e) => format!("Error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BackendConfig;

    fn backend(name: &str, run: &str) -> Backend {
        Backend::new(
            name,
            BackendConfig {
                run: run.to_string(),
                reset: None,
                run_sys_spec: "$SPEC_COMMAND".to_string(),
                hosts: Some("localhost".to_string()),
                hostfile: None,
                mpiflags: String::new(),
                tmp_path: None,
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn single_backend_passes_through() {
        let chain = BackendChain::new(vec![backend("local", "$CMD $ARGS")]);
        let cmds = chain.commands(2, "t", "sleep", "1");
        assert_eq!(cmds.len(), 2);
    }

    #[test]
    fn ssh_over_mpi_collapses_outer_to_one_copy() {
        let chain = BackendChain::new(vec![
            backend("ssh", "ssh $HOST $CMD"),
            backend("mpi", "mpirun -np $MPL $CMD $ARGS"),
        ]);
        let cmds = chain.commands(4, "t", "sleep", "1");
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].contains("ssh"));
        assert!(cmds[0].contains("-np 4"));
    }

    #[test]
    fn two_non_concurrent_backends_each_run_once_per_copy() {
        let chain = BackendChain::new(vec![backend("outer", "$CMD"), backend("inner", "$CMD $ARGS")]);
        let cmds = chain.commands(3, "t", "sleep", "1");
        assert_eq!(cmds.len(), 3);
    }
}
