//! `beacond archive export` (SPEC_FULL.md §B.2): streams every report row,
//! processed or not, out as newline-delimited JSON, so an operator can move
//! cold history to external storage before a partition is dropped.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

#[derive(Debug, Subcommand)]
pub enum ArchiveCommand {
    /// Export every report row as NDJSON on stdout.
    Export,
}

#[derive(Deserialize, Serialize)]
struct ArchivedReport {
    id: i64,
    submitted_at: DateTime<Utc>,
    user_agent: Option<String>,
    raw: Value,
}

pub async fn run(pool: PgPool, command: ArchiveCommand) -> Result<()> {
    match command {
        ArchiveCommand::Export => {
            let mut reports = sqlx::query_as::<_, (i64, DateTime<Utc>, Option<String>, Vec<u8>)>(
                "select id, submitted_at, user_agent, raw from report order by submitted_at",
            )
            .fetch(&pool);

            while let Some((id, submitted_at, user_agent, raw)) = reports.try_next().await? {
                let archived = ArchivedReport {
                    id,
                    submitted_at,
                    user_agent,
                    raw: serde_json::from_slice(&raw).unwrap_or(Value::Null),
                };
                println!("{}", serde_json::to_string(&archived)?);
            }
        }
    }

    Ok(())
}
