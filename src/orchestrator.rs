//! Top-level control loop (spec §4.7), ported verbatim from `run_task`/
//! `log_run` in `original_source/launcher/launch.py`.

use crate::backend::Backend;
use crate::chain::BackendChain;
use crate::error::LauncherError;
use crate::logger::Logger;
use crate::options::{resolve_backend_config, Mode, Options, StartMode};
use crate::repeater::Repeater;
use crate::runner::Runner;
use crate::rundata::RunData;

/// Builds every configured backend and the chain that composes them.
pub fn build_chain(options: &Options) -> Result<BackendChain, LauncherError> {
    let mut backends = Vec::with_capacity(options.backends.len());
    for name in &options.backends {
        let config = resolve_backend_config(options, name)?.clone();
        backends.push(Backend::new(name.clone(), config, options.fn_path.as_deref())?);
    }
    Ok(BackendChain::new(backends))
}

/// Logs one repetition's results: the column fields shared by every copy
/// (`repeat`, `concurrency`) and each copy's row fields (`rank`,
/// `outer_time`, every user metric), then flushes the CSV and flips the
/// logger's mode to append so later repetitions never rewrite the header
/// (`log_run`'s `options["mode"] = "a"`).
fn log_run(
    pdata: &RunData,
    log: &mut Logger,
    repeater: &Repeater,
    options: &mut Options,
) -> Result<(), LauncherError> {
    log.add_column("repeat", (repeater.count() + 1).to_string(), "int", "Batch number (iteration) when a task is repeated");
    log.add_column("concurrency", options.copies.to_string(), "int", "No. of concurrent runs");

    let outer = pdata.get_outer();
    for (i, value) in outer.iter().enumerate() {
        log.add_row_data("rank", i.to_string(), "int", "Concurrent run number");
        log.add_row_data(
            "outer_time",
            format!("{:.5}", value.as_f64().unwrap_or_default()),
            "numeric",
            "External measured run time (s); lower is better",
        );

        for metric in pdata.user_metrics() {
            let properties = options
                .metrics
                .get(&metric)
                .or_else(|| options.metrics.get("auto"))
                .ok_or_else(|| LauncherError::Config(format!("couldn't find properties for metric {metric}")))?;

            let direction = if properties.lower_is_better { "lower" } else { "higher" };
            let desc = format!("{} ({}); {direction} is better", properties.description, properties.units);
            log.add_row_data(&metric, pdata.get_metric(&metric)[i].to_display_string(), &properties.type_, &desc);
        }
    }

    log.save_csv(options.mode)?;
    log.clear_rows();
    options.mode = Mode::Append;
    Ok(())
}

/// Runs `task` to completion per spec §4.7's pseudocode: build the command
/// chain once, optionally do one discarded warm-up run, then loop cold-reset
/// (if configured) → run → log → ask the repeater whether to continue.
pub async fn run_experiment(mut options: Options, task: &str) -> Result<(), LauncherError> {
    let chain = build_chain(&options)?;
    let mut repeater = Repeater::from_options(&options)?;
    let cmds = chain.commands(options.copies, &options.task, &options.function, &options.arguments);

    let saved_mode = options.mode;

    if options.start == StartMode::Warm {
        let _ = Runner::run(
            &cmds,
            options.timeout,
            options.datafile.as_deref(),
            &options.metrics,
            options.verbose,
        )
        .await?;
    }

    let mut log = Logger::new(&options.directory, task, &options)?;
    log.add_column("task", task, "string", "Task name");
    log.add_column("start", format!("{:?}", options.start).to_lowercase(), "string", "Warm, cold, or normal start");

    loop {
        if options.start == StartMode::Cold {
            for backend in chain.backends() {
                backend.reset()?;
            }
        }

        let pdata = Runner::run(
            &cmds,
            options.timeout,
            options.datafile.as_deref(),
            &options.metrics,
            options.verbose,
        )
        .await?;

        if options.verbose {
            println!(
                "Completed run {} for experiment {} and task {}",
                repeater.count() + 1,
                options.experiment,
                options.task
            );
        }

        let Some(pdata) = pdata else {
            return Err(LauncherError::RunFailure);
        };

        log_run(&pdata, &mut log, &repeater, &mut options)?;

        if !repeater.should_continue(&pdata) {
            break;
        }
    }

    let sys_specs = chain.sys_specs(&options.sys_spec_commands, &options.task, &options.function, &options.arguments);
    log.save_md(saved_mode, &sys_specs)?;
    Ok(())
}
