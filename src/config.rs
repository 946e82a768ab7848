//! Models and functionality to work with the service configuration.
//!
//! Configuration is environment-only (spec §6): there is no config file to
//! parse, unlike the teacher's `toml`-based `Config::load`. `.env` is read
//! first via `dotenvy` for local development convenience, then overridden by
//! whatever is actually set in the environment.

use std::net::SocketAddr;

use anyhow::{Context, Result};

/// Rust representation of the runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub auth_token: String,
    pub retain_days: i64,
    pub partition_horizon_days: i64,
    pub worker_batch: i64,
    pub worker_concurrency: usize,
    pub gnss_max_accuracy_m: f64,
    /// Supplemental fallback described in SPEC_FULL.md §B.1. Off by default
    /// so the documented spec §4.5 algorithm is exactly what runs unless an
    /// operator opts in.
    pub ip_fallback: bool,
    /// Count of reports already moved out of the live `report` table by a
    /// prior `archive export` + manual delete (SPEC_FULL.md §B.2), added to
    /// the live row count so `beacond stats`'s `total_reports` reflects
    /// reports ever ingested rather than just what's currently on disk.
    pub archived_reports: i64,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn load() -> Result<Config> {
        let _ = dotenvy::dotenv();

        let bind_addr = env_or("BIND_ADDR", "0.0.0.0:8080")
            .parse()
            .context("BIND_ADDR must be a socket address, e.g. 0.0.0.0:8080")?;

        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;

        let auth_token = std::env::var("AUTH_TOKEN").context("AUTH_TOKEN is required")?;

        let retain_days = env_or("RETAIN_DAYS", "120")
            .parse()
            .context("RETAIN_DAYS must be an integer")?;
        let partition_horizon_days = env_or("PARTITION_HORIZON_DAYS", "7")
            .parse()
            .context("PARTITION_HORIZON_DAYS must be an integer")?;
        let worker_batch = env_or("WORKER_BATCH", "256")
            .parse()
            .context("WORKER_BATCH must be an integer")?;
        let worker_concurrency: usize = env_or("WORKER_CONCURRENCY", "2")
            .parse()
            .context("WORKER_CONCURRENCY must be an integer")?;
        let gnss_max_accuracy_m = env_or("GNSS_MAX_ACCURACY_M", "200")
            .parse()
            .context("GNSS_MAX_ACCURACY_M must be a number")?;
        let ip_fallback = env_or("IP_FALLBACK", "false")
            .parse()
            .context("IP_FALLBACK must be true or false")?;
        let archived_reports = env_or("ARCHIVED_REPORTS", "0")
            .parse()
            .context("ARCHIVED_REPORTS must be an integer")?;

        Ok(Config {
            bind_addr,
            database_url,
            auth_token,
            retain_days,
            partition_horizon_days,
            worker_batch,
            worker_concurrency,
            gnss_max_accuracy_m,
            ip_fallback,
            archived_reports,
        })
    }
}
