//! Error taxonomy for the launcher core (spec §7).

use thiserror::Error;

/// Fatal and non-fatal error kinds surfaced by the experiment engine.
///
/// Non-fatal cases (`RunFailure`, `ExtractionFailure` per metric,
/// `SysSpecFailure`, `ResetFailure` on non-local backends) are logged as
/// warnings via `log::warn!` at the call site rather than constructed as
/// this type; this enum covers the cases that should terminate the process.
#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown backend referenced in chain: {0}")]
    UnknownBackend(String),

    #[error("could not resolve command template for backend {backend}: {reason}")]
    Resolution { backend: String, reason: String },

    #[error("command exited with status 127 (not found): {0}")]
    ShellNotFound(String),

    #[error("every copy of the repetition failed or timed out")]
    RunFailure,

    #[error("timeout of {0}s exceeded while waiting for repetition")]
    TimeoutExceeded(u64),

    #[error("metrics have mismatched row counts, data would be incoherent: {0}")]
    ExtractionMismatch(String),

    #[error("reset command failed for local backend: {0}")]
    ResetFailure(String),

    #[error("unrecognized repeater rule: {0}")]
    UnknownRepeater(String),
}
