//! Command-line surface (spec §6), merged last and with highest priority by
//! [`crate::options::OptionsPipeline`].

use clap::Parser;

/// Compose backends, launch a function across them, and adaptively repeat
/// until the configured statistic stabilizes.
#[derive(Debug, Parser)]
#[command(name = "launch", version, about)]
pub struct Cli {
    /// Function/program to run, followed by its arguments.
    #[arg(trailing_var_arg = true)]
    pub func: Vec<String>,

    /// Load a YAML or JSON config file; repeatable, later files win.
    #[arg(short = 'f', long = "config")]
    pub config: Vec<String>,

    /// Inline JSON fragment, merged after all `--config` files.
    #[arg(short = 'j', long = "json")]
    pub json: Option<String>,

    /// Reproduce the options recorded in a previous run's markdown report.
    #[arg(long = "repro")]
    pub repro: Option<String>,

    /// Backend name to append to the chain; repeatable.
    #[arg(short = 'b', long = "backend")]
    pub backend: Vec<String>,

    /// Multiprogramming level (number of copies).
    #[arg(long = "mpl")]
    pub mpl: Option<u32>,

    /// Repeat rule: an integer count, "MAX", or a rule code (SE/CI/HDI/BB/GMM/KS/DC).
    #[arg(short = 'r', long = "repeats")]
    pub repeats: Option<String>,

    /// Experiment label, used to group runlog output.
    #[arg(short = 'e', long = "experiment")]
    pub experiment: Option<String>,

    /// Free-text description recorded in the markdown report.
    #[arg(long = "description")]
    pub description: Option<String>,

    /// Task label; defaults to the function name.
    #[arg(short = 't', long = "task")]
    pub task: Option<String>,

    /// Root directory for runlogs.
    #[arg(short = 'd', long = "directory")]
    pub directory: Option<String>,

    /// Input data file, fed to the launched function's stdin.
    #[arg(short = 'i', long = "input")]
    pub input: Option<String>,

    /// Per-repetition timeout in seconds.
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    /// Append to existing CSV/markdown output instead of overwriting.
    #[arg(short = 'a', long = "append")]
    pub append: bool,

    /// Print subprocess output as it runs.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Run a reset command before each repetition and treat failure as fatal.
    #[arg(short = 'c', long = "cold", conflicts_with = "warm")]
    pub cold: bool,

    /// Run one untimed warm-up repetition before measuring.
    #[arg(short = 'w', long = "warm", conflicts_with = "cold")]
    pub warm: bool,
}
