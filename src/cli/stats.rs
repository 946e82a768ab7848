//! `beacond stats` (SPEC_FULL.md §B.2): row counts per emitter table plus
//! distinct-country count and total report count, written as JSON — mirrors
//! the teacher's `process::Stats`/`StatsConfig` output shape.

use anyhow::Result;
use serde::Serialize;
use sqlx::PgPool;

use crate::config::Config;

#[derive(Serialize)]
struct Stats {
    total_wifi: i64,
    total_bluetooth: i64,
    total_cell: i64,
    total_cell_priors: i64,
    total_countries: i64,
    total_reports: i64,
    pending_reports: i64,
    failed_reports: i64,
}

pub async fn run(pool: &PgPool, config: &Config) -> Result<()> {
    let total_wifi: i64 = sqlx::query_scalar("select count(*) from wifi").fetch_one(pool).await?;
    let total_bluetooth: i64 = sqlx::query_scalar("select count(*) from bluetooth").fetch_one(pool).await?;
    let total_cell: i64 = sqlx::query_scalar("select count(*) from cell").fetch_one(pool).await?;
    let total_cell_priors: i64 = sqlx::query_scalar("select count(*) from cell_prior").fetch_one(pool).await?;
    let total_countries: i64 = sqlx::query_scalar("select count(distinct country) from cell").fetch_one(pool).await?;
    let live_reports: i64 = sqlx::query_scalar("select count(*) from report").fetch_one(pool).await?;
    let pending_reports: i64 =
        sqlx::query_scalar("select count(*) from report where processed_at is null").fetch_one(pool).await?;
    let failed_reports: i64 = sqlx::query_scalar("select count(*) from report where processing_error is not null")
        .fetch_one(pool)
        .await?;

    let stats = Stats {
        total_wifi,
        total_bluetooth,
        total_cell,
        total_cell_priors,
        total_countries,
        total_reports: config.archived_reports + live_reports,
        pending_reports,
        failed_reports,
    };

    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
