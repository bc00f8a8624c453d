//! Main entry point (spec §6), mirroring the top-level structure of the
//! teacher's `rustc-perf-collector/main.rs`: `env_logger::init()`, a
//! `clap::Parser::parse()` CLI, and `anyhow::Context`/`bail!` used to
//! surface `LauncherError` as a human-readable exit.

use anyhow::Context;
use clap::Parser;

use launcher::cli::Cli;
use launcher::options::{default_backends_dir, OptionsPipeline};
use launcher::orchestrator::run_experiment;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let pipeline = OptionsPipeline::new(default_backends_dir("."));
    let options = pipeline.build(&cli).context("failed to assemble experiment options")?;
    let task = options.task.clone();

    run_experiment(options, &task)
        .await
        .context("experiment failed")?;

    Ok(())
}
