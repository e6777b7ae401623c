use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::sync::CancellationToken;

use loadbench::config::{BenchConfig, LogFormat, CONFIG_ENV};
use loadbench::events::{follow_stream, LogRollup, RollupMode, StreamParser};
use loadbench::journal::{progress_rows, ExecutionMode, JournalError, ResumeOverrides, RunJournal};
use loadbench::plugins::PluginRegistry;
use loadbench::runner::{RunSummary, Runner};

#[derive(Parser)]
#[command(
    name = "loadbench",
    about = "Resumable multi-host benchmark workload runner",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_parser = ["text", "json"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new run of every enabled workload on this machine
    Run {
        /// Run identifier (a random UUID when omitted)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Resume an interrupted run from its journal
    Resume {
        /// Run identifier to resume
        #[arg(long)]
        run_id: String,

        /// Execution mode, required when the journal does not record one
        #[arg(long)]
        execution_mode: Option<ExecutionMode>,

        /// Node count, required when the journal does not record one
        #[arg(long)]
        node_count: Option<u32>,
    },

    /// Show per (host, workload) progress of a run
    Status {
        /// Run identifier
        #[arg(long)]
        run_id: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Follow remote-execution output and track progress
    Follow {
        /// Update this run's journal from progress events
        #[arg(long)]
        run_id: Option<String>,

        /// Phase label for lines that carry none
        #[arg(long)]
        phase: Option<String>,

        /// Host label for lines that carry none
        #[arg(long)]
        host: Option<String>,

        /// One rolled-up line per polling task instead of a single summary
        #[arg(long)]
        verbose: bool,

        /// Print every parsed event as JSON while following
        #[arg(long)]
        events: bool,

        /// Read from this file instead of stdin
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// List available workload plugins
    Plugins {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config problems are reported before the configured subscriber exists.
    let config = tracing::subscriber::with_default(loadbench::logging::bootstrap_subscriber(), || {
        match &cli.config {
            Some(path) => BenchConfig::load(path),
            None => Ok(BenchConfig::load_or_default()),
        }
    })?;

    let level = cli.log_level.as_deref().unwrap_or(config.logging.level.as_str());
    let format = match cli.log_format.as_deref() {
        Some("json") => LogFormat::Json,
        Some(_) => LogFormat::Text,
        None => config.logging.format,
    };
    loadbench::logging::init(level, format)?;

    match cli.command {
        Commands::Run { run_id } => {
            let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let runner = Runner::new(config, PluginRegistry::builtin());
            let path = runner.journal_path(&run_id);
            if path.exists() {
                anyhow::bail!(
                    "run '{}' already has a journal at {}; use `loadbench resume`",
                    run_id,
                    path.display()
                );
            }

            tracing::info!(%run_id, "Starting benchmark run");
            let mut journal = runner.initialize(&run_id);
            let keys = runner.plan(&journal);
            let cancel = cancel_on_ctrl_c();
            let summary = runner.run(&mut journal, &keys, &cancel).await?;
            print_summary(&run_id, &summary);
            print_progress(&journal);
        }
        Commands::Resume {
            run_id,
            execution_mode,
            node_count,
        } => {
            let runner = Runner::new(config, PluginRegistry::builtin());
            let path = runner.journal_path(&run_id);
            let mut journal = RunJournal::load(&path)
                .with_context(|| format!("cannot resume run '{}'", run_id))?;
            let plan = journal
                .resume_plan(&ResumeOverrides {
                    execution_mode,
                    node_count,
                })
                .with_context(|| format!("cannot resume run '{}'", run_id))?;

            tracing::info!(
                %run_id,
                submit = plan.submit.len(),
                skip = plan.skip.len(),
                "Resuming benchmark run"
            );
            let keys = runner.plan_resume(&plan);
            let cancel = cancel_on_ctrl_c();
            let summary = runner.run(&mut journal, &keys, &cancel).await?;
            print_summary(&run_id, &summary);
            print_progress(&journal);
        }
        Commands::Status { run_id, json } => {
            let path = loadbench::journal::journal_path(&config.run.output_root, &run_id);
            let journal = RunJournal::load(&path)?;
            if json {
                let output = serde_json::json!({
                    "run_id": journal.run_id,
                    "metadata": journal.metadata,
                    "complete": journal.is_complete(),
                    "progress": progress_rows(&journal),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("\nRun {}", journal.run_id);
                if let Some(mode) = journal.execution_mode() {
                    println!("Execution mode: {}", mode);
                }
                if let Some(nodes) = journal.node_count() {
                    println!("Nodes:          {}", nodes);
                }
                print_progress(&journal);
            }
        }
        Commands::Follow {
            run_id,
            phase,
            host,
            verbose,
            events,
            input,
        } => {
            let mut parser = StreamParser::new();
            if let Some(phase) = phase {
                parser.set_phase(phase);
            }
            if let Some(host) = host {
                parser.set_host(host);
            }
            let mode = if verbose {
                RollupMode::Verbose
            } else {
                RollupMode::Summary
            };
            let mut rollup = LogRollup::new(mode);

            let journal_file = run_id
                .as_deref()
                .map(|id| loadbench::journal::journal_path(&config.run.output_root, id));
            let mut journal = match (&run_id, &journal_file) {
                (Some(id), Some(path)) => match RunJournal::load(path) {
                    Ok(journal) => journal,
                    Err(JournalError::Missing { .. }) => {
                        tracing::warn!(run_id = %id, "no journal yet, tracking progress in a new one");
                        RunJournal::new(id.clone())
                    }
                    Err(e) => return Err(e.into()),
                },
                _ => RunJournal::new(""),
            };

            let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &input {
                Some(path) => {
                    let file = tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("failed to open {}", path.display()))?;
                    Box::new(BufReader::new(file))
                }
                None => Box::new(BufReader::new(tokio::io::stdin())),
            };

            let cancel = cancel_on_ctrl_c();
            let stats = follow_stream(reader, &mut parser, &mut journal, &mut rollup, &cancel, |event| {
                if events {
                    match serde_json::to_string(event) {
                        Ok(json) => println!("{}", json),
                        Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
                    }
                }
            })
            .await?;

            if !events {
                for line in rollup.lines() {
                    println!("{}", line);
                }
            }
            if let Some(path) = &journal_file {
                journal.save(path)?;
            }
            if !journal.is_empty() {
                print_progress(&journal);
            }
            tracing::debug!(?stats, "follow finished");
        }
        Commands::Plugins { json } => {
            let plugins = PluginRegistry::builtin().list();
            if json {
                println!("{}", serde_json::to_string_pretty(&plugins)?);
            } else {
                println!("{:<12} | {:<10} | Description", "Plugin", "Requires");
                println!("{:-<12}-|-{:-<10}-|-{:-<40}", "", "", "");
                for meta in plugins {
                    println!(
                        "{:<12} | {:<10} | {}",
                        meta.name,
                        meta.requires.unwrap_or("-"),
                        meta.description
                    );
                }
            }
        }
    }

    Ok(())
}

/// A token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current repetition");
            token.cancel();
        }
    });
    cancel
}

fn print_summary(run_id: &str, summary: &RunSummary) {
    println!("\n=== Run {} ===", run_id);
    println!("Completed: {}", summary.completed);
    println!("Failed:    {}", summary.failed);
    if summary.remote > 0 {
        println!("Remote:    {} (left for the remote engine)", summary.remote);
    }
    if summary.cancelled {
        println!("Cancelled: {} task(s) not started", summary.remaining);
    }
}

fn print_progress(journal: &RunJournal) {
    let rows = progress_rows(journal);
    if rows.is_empty() {
        println!("No tasks recorded.");
        return;
    }
    println!("{:<20} | {:<20} | {:<8} | Progress", "Host", "Workload", "Status");
    println!("{:-<20}-|-{:-<20}-|-{:-<8}-|-{:-<8}", "", "", "", "");
    for row in rows {
        println!(
            "{:<20} | {:<20} | {:<8} | {}",
            row.host,
            row.workload,
            row.status.as_str(),
            row.progress
        );
    }
}
