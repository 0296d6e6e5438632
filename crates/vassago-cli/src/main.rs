//! Vassago online continual learning runner
//!
//! Streams a synthetic class-incremental dataset through the online trainer
//! and reports anytime accuracy, task accuracy and forgetting.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: 10 classes over 5 tasks, one worker
//! vassago
//!
//! # From a config file, two data-parallel workers
//! vassago --config run.toml --workers 2 --seed 1
//!
//! # Write task records and the summary as JSON
//! vassago --output results.json
//!
//! # Print the default configuration
//! vassago --dump-config > run.toml
//! ```

mod config;
mod synthetic;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use serde::Serialize;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use vassago_learning::{
    backbone_names, build_backbone, Collective, EvalSet, InputShape, LearningError,
    LocalCollective, OnlineTrainer, RunSummary, StreamEvent, TaskRecord, ThreadCollective,
    TrainingStats,
};

use crate::config::RunConfig;

#[derive(Parser, Debug)]
#[command(name = "vassago")]
#[command(version)]
#[command(about = "Online class-incremental learning with growable prompt pools", long_about = None)]
struct Args {
    /// Configuration file path (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Random seed for the trainer (overrides the config)
    #[arg(long)]
    seed: Option<u64>,

    /// Number of tasks (overrides the config)
    #[arg(long)]
    tasks: Option<usize>,

    /// Data-parallel workers in this process (overrides the config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Backbone name (overrides the config)
    #[arg(long)]
    backbone: Option<String>,

    /// Write task records and the summary as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    dump_config: bool,
}

/// What `--output` writes
#[derive(Debug, Serialize)]
struct RunOutput {
    summary: RunSummary,
    periodic_accuracy: Vec<f32>,
    records: Vec<TaskRecord>,
    stats: TrainingStats,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to set tracing subscriber: {}", e);
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.trainer.seed = Some(seed);
    }
    if let Some(tasks) = args.tasks {
        config.stream.n_tasks = tasks;
    }
    if let Some(workers) = args.workers {
        config.workers.world_size = workers;
        config.workers.rank = 0;
    }
    if let Some(backbone) = args.backbone {
        config.backbone.name = backbone;
    }

    if args.dump_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }
    config.validate()?;

    let data = synthetic::generate(&config.stream, config.trainer.stream_batch_size)?;
    let world_size = config.workers.world_size;

    info!("Vassago online continual learning");
    info!(
        "  Backbone:   {} (available: {})",
        config.backbone.name,
        backbone_names().collect::<Vec<_>>().join(", ")
    );
    info!("  Classes:    {} over {} tasks", config.stream.num_classes, data.tasks.len());
    info!(
        "  Pool:       {} slots, {} selected",
        config.trainer.pool.pool_size, config.trainer.pool.selection_size
    );
    info!("  Memory:     {} exemplars", config.trainer.memory.memory_size);
    info!("  Workers:    {} ({})", world_size, config.workers.rendezvous_addr);

    let output = if world_size == 1 {
        train_worker(&config, data.shape, Box::new(LocalCollective), data.events, &data.eval)?
    } else {
        run_workers(&config, data.shape, data.events, data.eval)?
    };

    let s = &output.summary;
    info!("Run finished");
    info!("  A_auc:  {:.4}", s.a_auc);
    info!("  A_avg:  {:.4}", s.a_avg);
    info!("  A_last: {:.4}", s.a_last);
    info!("  F_last: {:.4}", s.f_last);

    if let Some(path) = &args.output {
        write_output(path, &output)?;
        info!("Results written to {}", path.display());
    }
    Ok(())
}

fn train_worker<I>(
    config: &RunConfig,
    shape: InputShape,
    collective: Box<dyn Collective>,
    events: I,
    eval: &EvalSet,
) -> vassago_learning::Result<RunOutput>
where
    I: IntoIterator<Item = StreamEvent>,
{
    let backbone = build_backbone(&config.backbone, shape)?;
    let mut trainer = OnlineTrainer::new(config.trainer.clone(), backbone, shape, collective)?;
    let summary = trainer.run(events, eval)?;

    Ok(RunOutput {
        summary,
        periodic_accuracy: trainer.periodic_accuracies().to_vec(),
        records: trainer.task_records().to_vec(),
        stats: trainer.stats().clone(),
    })
}

/// One thread per rank; rank 0's results are returned
///
/// Every worker is joined before reporting, so a crash on any rank surfaces
/// as that rank's error rather than a hang.
fn run_workers(
    config: &RunConfig,
    shape: InputShape,
    events: Vec<StreamEvent>,
    eval: EvalSet,
) -> Result<RunOutput, Box<dyn std::error::Error>> {
    let events = Arc::new(events);
    let eval = Arc::new(eval);

    let group =
        ThreadCollective::group_with_timeout(config.workers.world_size, config.workers.timeout());
    let handles: Vec<_> = group
        .into_iter()
        .map(|collective| {
            let config = config.clone();
            let events = Arc::clone(&events);
            let eval = Arc::clone(&eval);
            thread::Builder::new()
                .name(format!("worker-{}", collective.rank()))
                .spawn(move || {
                    let events = events.iter().cloned();
                    train_worker(&config, shape, Box::new(collective), events, &eval)
                })
        })
        .collect::<Result<_, _>>()?;

    let outputs: Vec<_> = handles
        .into_iter()
        .enumerate()
        .map(|(rank, handle)| {
            handle.join().unwrap_or_else(|_| {
                Err(LearningError::DistributedDesync {
                    rank,
                    reason: "worker thread panicked".into(),
                })
            })
        })
        .collect();

    let mut leader = None;
    let mut first_error = None;
    for (rank, output) in outputs.into_iter().enumerate() {
        match output {
            Ok(output) if rank == 0 => leader = Some(output),
            Ok(_) => {}
            Err(e) => {
                error!(rank, "worker failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e.into());
    }
    leader.ok_or_else(|| LearningError::ConfigError("no workers ran".into()).into())
}

fn write_output(path: &Path, output: &RunOutput) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(output)?;
    std::fs::write(path, json).map_err(LearningError::from)?;
    Ok(())
}
