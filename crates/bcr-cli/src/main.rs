use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bcr_core::{ImportStatus, RunStatus};
use bcr_storage::{MissingUserFilter, PgRunStore, DEFAULT_PER_PAGE};
use bcr_sync::{AppConfig, ImportMode, ReconciliationService};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "bcr")]
#[command(about = "Reconcile a CRM contact export against billing aggregator customers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Register a CSV export as a new pending run.
    Submit {
        csv: PathBuf,
        #[arg(long)]
        name: Option<String>,
        /// Process the run right away.
        #[arg(long)]
        process: bool,
    },
    Process {
        run_id: Uuid,
    },
    Progress {
        run_id: Uuid,
    },
    Runs {
        #[arg(long)]
        status: Option<RunStatus>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List the missing users of a run.
    Missing {
        run_id: Uuid,
        #[arg(long)]
        status: Option<ImportStatus>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = DEFAULT_PER_PAGE)]
        per_page: usize,
    },
    Import {
        missing_user_id: Uuid,
        #[arg(long, default_value = "simple")]
        mode: ImportMode,
    },
    ImportPending {
        run_id: Uuid,
        #[arg(long, default_value = "simple")]
        mode: ImportMode,
    },
    /// Remove imported customers and subscriptions from the aggregator.
    DeleteImported {
        run_id: Uuid,
        #[arg(long)]
        yes: bool,
    },
    Migrate,
    Serve,
    /// Process pending runs: once, or on the configured cron schedule.
    Worker {
        #[arg(long)]
        once: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bcr=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let store = PgRunStore::connect(&config.database_url, 1).await?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let port = config.web_port;
            let service = ReconciliationService::connect(config).await?;
            bcr_web::serve(Arc::new(service), port).await?;
        }
        Commands::Worker { once } => {
            let service = Arc::new(ReconciliationService::connect(config).await?);
            if once {
                match service.process_next_pending().await? {
                    Some(run) => print_json(&run.progress_snapshot())?,
                    None => info!("no pending runs"),
                }
                return Ok(());
            }
            let Some(mut sched) = service.maybe_build_scheduler().await? else {
                bail!("worker scheduling is disabled; set BCR_SCHEDULER_ENABLED=true or use --once");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %service.config().worker_cron, "worker running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        command => {
            let service = ReconciliationService::connect(config).await?;
            run_command(&service, command).await?;
        }
    }

    Ok(())
}

async fn run_command(service: &ReconciliationService, command: Commands) -> Result<()> {
    match command {
        Commands::Submit { csv, name, process } => {
            let run = service.submit_run(&csv, name.as_deref()).await?;
            if process {
                let run = service.process_run(run.id).await?;
                print_json(&run.progress_snapshot())?;
            } else {
                print_json(&run)?;
            }
        }
        Commands::Process { run_id } => {
            let run = service.process_run(run_id).await?;
            print_json(&run.progress_snapshot())?;
        }
        Commands::Progress { run_id } => {
            let snapshot = service
                .get_progress(run_id)
                .await?
                .with_context(|| format!("run {run_id} not found"))?;
            print_json(&snapshot)?;
        }
        Commands::Runs { status, limit } => {
            for run in service.list_runs(status, limit).await? {
                println!(
                    "{}  {:<10}  {:>3}%  {}",
                    run.id,
                    run.status.as_str(),
                    run.progress_percentage,
                    run.name
                );
            }
        }
        Commands::Missing {
            run_id,
            status,
            search,
            page,
            per_page,
        } => {
            let filter = MissingUserFilter {
                status,
                search,
                page,
                per_page,
            };
            print_json(&service.list_missing_users(run_id, &filter).await?)?;
        }
        Commands::Import {
            missing_user_id,
            mode,
        } => {
            print_json(&service.import_user(missing_user_id, mode).await?)?;
        }
        Commands::ImportPending { run_id, mode } => {
            print_json(&service.import_all_pending(run_id, mode).await?)?;
        }
        Commands::DeleteImported { run_id, yes } => {
            if !yes {
                bail!("delete-imported removes remote customers and subscriptions; pass --yes to confirm");
            }
            print_json(&service.delete_imported_users(run_id).await?)?;
        }
        other => bail!("{other:?} is not a run command"),
    }
    Ok(())
}
