use std::process::ExitCode;

use actix_web::{web, App, HttpServer};
use actix_web_httpauth::middleware::HttpAuthentication;
use anyhow::Result;
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;

mod aggregation;
mod bounds;
mod cli;
mod config;
mod error;
mod geoip;
mod http;
mod inference;
mod model;
mod partition;
mod report_log;
mod store;

use aggregation::AggregationWorker;
use config::Config;
use inference::InferenceEngine;
use partition::PartitionManager;
use report_log::ReportLog;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API and run the background aggregation worker and
    /// partition manager in the same process.
    Serve,
    /// Run only the aggregation worker loop, no HTTP server.
    Worker,
    /// Partition maintenance, run once and exit.
    Partition {
        #[command(subcommand)]
        command: PartitionCommand,
    },
    /// Bulk-load the imported coarse cell dataset from a CSV on stdin.
    ImportCells,
    /// Archive / export tooling.
    Archive {
        #[command(subcommand)]
        command: cli::archive::ArchiveCommand,
    },
    /// Print an operational snapshot.
    Stats,
}

#[derive(Debug, Subcommand)]
enum PartitionCommand {
    /// Create daily partitions through the configured horizon.
    Ensure,
    /// Drop partitions past the retention window.
    Drop,
    /// Install hot-tail indexes on the current and future partitions.
    InstallIndexes,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.downcast_ref::<sqlx::Error>().is_some() => {
            eprintln!("storage unreachable: {err:#}");
            ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("fatal error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let cli = Cli::parse();
    let pool = PgPool::connect(&config.database_url).await?;
    sqlx::migrate!().run(&pool).await?;

    match cli.command {
        Command::Serve => serve(config, pool).await,
        Command::Worker => worker(config, pool).await,
        Command::Partition { command } => partition_cli(config, pool, command).await,
        Command::ImportCells => cli::import_cells::run(&pool).await,
        Command::Archive { command } => cli::archive::run(pool, command).await,
        Command::Stats => cli::stats::run(&pool, &config).await,
    }
}

async fn serve(config: Config, pool: PgPool) -> Result<()> {
    let bind_addr = config.bind_addr;
    let auth_token = config.auth_token.clone();
    let worker_batch = config.worker_batch;
    let worker_concurrency = config.worker_concurrency;
    let partition_horizon_days = config.partition_horizon_days;
    let gnss_max_accuracy_m = config.gnss_max_accuracy_m;

    let partitions = PartitionManager::new(pool.clone());
    partitions.ensure_forward(partition_horizon_days).await?;

    let partitions_bg = PartitionManager::new(pool.clone());
    tokio::spawn(async move {
        partitions_bg
            .run_periodic(partition_horizon_days, std::time::Duration::from_secs(3600))
            .await;
    });

    for _ in 0..worker_concurrency {
        let worker = AggregationWorker::new(pool.clone(), gnss_max_accuracy_m);
        tokio::spawn(async move {
            worker.run_forever(worker_batch, std::time::Duration::from_secs(1)).await;
        });
    }

    let report_log = web::Data::new(ReportLog::new(pool.clone()));
    let inference = web::Data::new(InferenceEngine::new(pool.clone(), config.ip_fallback));
    let auth_token_data = web::Data::new(auth_token);

    HttpServer::new(move || {
        let auth = HttpAuthentication::bearer(http::auth::validator);
        App::new()
            .wrap(TracingLogger::default())
            .app_data(report_log.clone())
            .app_data(inference.clone())
            .app_data(auth_token_data.clone())
            .service(web::scope("").wrap(auth.clone()).configure(http::authenticated_routes))
            .configure(http::public_routes)
    })
    .bind(bind_addr)?
    .run()
    .await?;

    Ok(())
}

async fn worker(config: Config, pool: PgPool) -> Result<()> {
    let worker = AggregationWorker::new(pool, config.gnss_max_accuracy_m);
    worker.run_forever(config.worker_batch, std::time::Duration::from_secs(1)).await;
    Ok(())
}

async fn partition_cli(config: Config, pool: PgPool, command: PartitionCommand) -> Result<()> {
    let manager = PartitionManager::new(pool);
    match command {
        PartitionCommand::Ensure => {
            manager.ensure_forward(config.partition_horizon_days).await?;
        }
        PartitionCommand::Drop => {
            let dropped = manager.drop_expired(config.retain_days, true).await?;
            println!("dropped {} partitions", dropped.len());
        }
        PartitionCommand::InstallIndexes => {
            // Only the current day's partition is guaranteed to already
            // exist; `ensure_forward` has created the rest.
            let today = chrono::Utc::now().format("report_%Y_%m_%d").to_string();
            manager.install_hot_indexes(&today).await?;
        }
    }
    Ok(())
}
