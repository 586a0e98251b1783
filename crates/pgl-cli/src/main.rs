use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pgl_source::WindowedQueryBuilder;
use pgl_sync::{build_orchestrator, build_scheduler, resolve_window, write_report, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pgl", version)]
#[command(about = "Loads COEUS grants into PASS for a last-modified date window")]
struct Cli {
    /// Directory holding the source export, funders.yaml, the grant store and reports.
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, clap::Args, Default)]
struct WindowArgs {
    /// First last-modified date to pull, mm/dd/yyyy. Defaults to yesterday.
    #[arg(long)]
    start: Option<String>,
    /// Last last-modified date to pull, mm/dd/yyyy. Requires --start.
    #[arg(long)]
    end: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull the window from COEUS and reconcile it into the grant store.
    Sync {
        #[command(flatten)]
        window: WindowArgs,
        /// Reconcile and report without writing to the store.
        #[arg(long)]
        dry_run: bool,
        /// Skip writing the report files.
        #[arg(long)]
        no_report: bool,
    },
    /// Print the query that a sync for the window would run.
    Query {
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Run a sync of the previous day on the configured cron schedule until interrupted.
    Schedule,
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow::anyhow!("tracing already initialized: {err}"))
}

fn load_config(home: Option<PathBuf>) -> Result<SyncConfig> {
    SyncConfig::from_lookup(|key| match (key, &home) {
        ("PGL_HOME", Some(home)) => Some(home.display().to_string()),
        _ => std::env::var(key).ok(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs)?;
    let config = load_config(cli.home)?;

    match cli.command.unwrap_or(Commands::Sync {
        window: WindowArgs::default(),
        dry_run: false,
        no_report: false,
    }) {
        Commands::Sync {
            window,
            dry_run,
            no_report,
        } => {
            let window = resolve_window(window.start.as_deref(), window.end.as_deref())?;
            let orchestrator = build_orchestrator(&config, dry_run).await?;
            let report = match orchestrator.run(window).await {
                Ok(report) => report,
                Err(err) => {
                    if let (false, Some(partial)) = (no_report, &err.partial_report) {
                        let dir = write_report(&config.reports_dir, partial).await?;
                        info!(report = %dir.display(), "wrote partial sync report");
                    }
                    return Err(err.into());
                }
            };
            if !no_report {
                let dir = write_report(&config.reports_dir, &report).await?;
                info!(report = %dir.display(), "wrote sync report");
            }
            println!(
                "sync complete: run_id={} window={} created={} updated={} unchanged={} failed={}",
                report.run_id,
                report.window,
                report.created,
                report.updated,
                report.unchanged,
                report.failed
            );
        }
        Commands::Query { window } => {
            let window = resolve_window(window.start.as_deref(), window.end.as_deref())?;
            println!("{}", WindowedQueryBuilder::new().query_for(&window));
        }
        Commands::Schedule => {
            let orchestrator = Arc::new(build_orchestrator(&config, false).await?);
            let mut sched =
                build_scheduler(&config.sync_cron, orchestrator, config.reports_dir.clone())
                    .await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
