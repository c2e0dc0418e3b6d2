//! Command-line entry point: load runbooks, generate instances, schedule,
//! execute, and report.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use batchrun::config::Runbook;
use batchrun::engine::{KeepTemps, ParallelEngine, RunOptions, SerialEngine};
use batchrun::scheduler::Scheduler;
use batchrun::template::{compose_all, generate, TempSpec, Template};

#[derive(Parser, Debug)]
#[command(
    name = "batchrun",
    version,
    about = "Generate and execute parameterized shell script batches"
)]
struct Cli {
    /// Runbook files to load, in order; later files win on conflict
    #[arg(required = true)]
    runbooks: Vec<PathBuf>,

    /// Select templates whose name contains this string (repeatable)
    #[arg(short = 't', long = "template", value_name = "NAME")]
    templates: Vec<String>,

    /// Generate and schedule but skip execution
    #[arg(long)]
    dry_run: bool,

    /// Temporary-file retention policy: fail, never or always
    #[arg(long, default_value = "fail", value_name = "POLICY")]
    keep_temps: KeepTemps,

    /// Worker pool size; defaults to the number of CPUs
    #[arg(short = 'j', long, value_name = "N")]
    jobs: Option<usize>,

    /// Run instances strictly one at a time instead of on the worker pool
    #[arg(long)]
    serial: bool,

    /// Seed the slot assignment for a reproducible schedule
    #[arg(long, value_name = "N")]
    seed: Option<u64>,

    /// Override a variable; the value is parsed as YAML (repeatable)
    #[arg(short = 'D', long = "set", value_name = "NAME=VALUE")]
    set: Vec<String>,

    /// Suppress captured output of successful instances
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut runbook = Runbook::load_all(&cli.runbooks).context("loading runbooks")?;
    for spec in &cli.set {
        runbook.apply_override(spec)?;
    }

    let composed = compose_all(&runbook.templates).context("template composition failed")?;
    let selected: Vec<&Template> = composed
        .values()
        .filter(|t| !t.is_fragment)
        .filter(|t| {
            cli.templates.is_empty()
                || cli.templates.iter().any(|f| t.name.contains(f.as_str()))
        })
        .collect();
    if selected.is_empty() {
        warn!("no templates selected");
        return Ok(true);
    }

    // Generation errors are scoped to their template: the offending
    // template contributes no instances, everything else still runs.
    let temp_spec = TempSpec::default();
    let mut instances = Vec::new();
    let mut failed_templates = 0usize;
    for template in &selected {
        let filters = runbook.filters_for(&template.name);
        let before = instances.len();
        let outcome = generate(template, &runbook.variables, filters, &temp_spec)
            .and_then(|iter| {
                for item in iter {
                    instances.push(item?);
                }
                Ok(())
            });
        if let Err(err) = outcome {
            error!(template = %template.name, error = %err, "generation failed");
            // drop the template's partial instances along with their temp files
            for dropped in instances.drain(before..) {
                for path in dropped.assignment.temp_files.values() {
                    let _ = std::fs::remove_file(path);
                }
            }
            failed_templates += 1;
        }
    }
    info!(
        instances = instances.len(),
        templates = selected.len(),
        "generated instances"
    );

    let mut options = RunOptions::default()
        .with_dry_run(cli.dry_run)
        .with_keep_temps(cli.keep_temps)
        .with_quiet(cli.quiet);
    if let Some(jobs) = cli.jobs {
        options = options.with_workers(jobs);
    }

    let report = if cli.serial {
        SerialEngine::shell(options).run_all(instances).await
    } else {
        let mut scheduler = match cli.seed {
            Some(seed) => Scheduler::from_seed(seed),
            None => Scheduler::from_entropy(),
        };
        let schedule = scheduler.schedule(instances);
        ParallelEngine::shell(options).run(schedule).await?
    };

    info!(
        total = report.total(),
        succeeded = report.succeeded(),
        failed = report.failed(),
        skipped = report.skipped(),
        "run complete"
    );
    Ok(report.all_succeeded() && failed_templates == 0)
}
