//! The Partition Manager (C2, spec §4.2): keeps the `report` table's daily
//! range partitions a fixed horizon ahead of `now()`, drops partitions past
//! the retention window, and maintains the indexes each partition needs.

use chrono::{Duration, NaiveDate, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

pub struct PartitionManager {
    pool: PgPool,
}

/// Advisory lock key so two instances racing to create the same day's
/// partition don't both attempt the DDL (spec §4.2: "partition creation is
/// idempotent and safe to run concurrently").
const ADVISORY_LOCK_KEY: i64 = 0x6265_6163_6f6e_6401;

impl PartitionManager {
    pub fn new(pool: PgPool) -> Self {
        PartitionManager { pool }
    }

    /// Ensures a daily partition exists for every day from today through
    /// `horizon_days` ahead (spec §4.2 `ensure_forward`).
    pub async fn ensure_forward(&self, horizon_days: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("select pg_advisory_xact_lock($1)")
            .bind(ADVISORY_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let today = Utc::now().date_naive();
        for offset in 0..=horizon_days {
            let day = today + Duration::days(offset);
            self.ensure_partition(&mut tx, day).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Creates the partition, if absent, and installs its hot-tail indexes
    /// in the same transaction (spec §4.2: "called once when a partition
    /// is first created").
    async fn ensure_partition(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        day: NaiveDate,
    ) -> Result<(), sqlx::Error> {
        let name = partition_name(day);
        let next = day + Duration::days(1);
        let sql = format!(
            "create table if not exists {name} partition of report
             for values from ('{day}') to ('{next}')"
        );
        sqlx::query(&sql).execute(&mut **tx).await?;

        let unprocessed_idx = format!("{name}_unprocessed_idx");
        sqlx::query(&format!(
            "create index if not exists {unprocessed_idx} on {name} (processed_at, submitted_at) where processed_at is null"
        ))
        .execute(&mut **tx)
        .await?;

        let range_idx = format!("{name}_submitted_at_idx");
        sqlx::query(&format!("create index if not exists {range_idx} on {name} (submitted_at)"))
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    /// Drops partitions whose upper bound is more than `retain_days` in the
    /// past (spec §4.2 `drop_expired`). `cascade` drops dependent objects
    /// (foreign keys, etc.) along with the partition; individual drop
    /// failures are logged and skipped rather than aborting the batch
    /// (spec §4.2: "never fatal to the batch"). Returns the names dropped.
    pub async fn drop_expired(&self, retain_days: i64, cascade: bool) -> Result<Vec<String>, sqlx::Error> {
        let cutoff = Utc::now().date_naive() - Duration::days(retain_days);

        let names: Vec<String> = sqlx::query_scalar(
            "select inhrelid::regclass::text
             from pg_inherits
             join pg_class parent on pg_inherits.inhparent = parent.oid
             where parent.relname = 'report'",
        )
        .fetch_all(&self.pool)
        .await?;

        let suffix = if cascade { " cascade" } else { "" };
        let mut dropped = Vec::new();
        for name in names {
            let Some(day) = partition_date(&name) else {
                continue;
            };
            if day < cutoff {
                let sql = format!("drop table if exists {name}{suffix}");
                match sqlx::query(&sql).execute(&self.pool).await {
                    Ok(_) => {
                        info!(partition = %name, %cutoff, "dropped expired partition");
                        dropped.push(name);
                    }
                    Err(err) => {
                        warn!(partition = %name, error = %err, "failed to drop expired partition, skipping");
                    }
                }
            }
        }
        if dropped.is_empty() {
            info!(%cutoff, "no partitions past retention window");
        }
        Ok(dropped)
    }

    /// Builds the indexes a partition needs once it stops being the "hot"
    /// (actively-written, mostly-unprocessed) tail: a partial index over
    /// unprocessed rows is replaced by a BRIN index over `submitted_at`,
    /// which is far cheaper to maintain on a table that is now
    /// append-only-by-history and scanned mostly in time order (spec §4.2,
    /// §5 "old partitions additionally get a BRIN range index").
    pub async fn install_hot_indexes(&self, partition: &str) -> Result<(), sqlx::Error> {
        let unprocessed_idx = format!("{partition}_unprocessed_idx");
        sqlx::query(&format!(
            "create index if not exists {unprocessed_idx} on {partition} (processed_at, submitted_at) where processed_at is null"
        ))
        .execute(&self.pool)
        .await?;

        let range_idx = format!("{partition}_submitted_at_idx");
        sqlx::query(&format!(
            "create index if not exists {range_idx} on {partition} (submitted_at)"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replaces a cooled-down partition's two hot-tail indexes with a
    /// single BRIN index over `submitted_at` (spec §5, §6: "old partitions
    /// additionally get a BRIN range index") — once every row in the
    /// partition is processed, the partial unprocessed-tail index indexes
    /// nothing and the btree range index costs more to maintain than a
    /// block-range index buys back on an append-only, time-ordered table.
    pub async fn install_brin_index(&self, partition: &str) -> Result<(), sqlx::Error> {
        let unprocessed_idx = format!("{partition}_unprocessed_idx");
        let range_idx = format!("{partition}_submitted_at_idx");
        let brin_idx = format!("{partition}_submitted_at_brin");
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("drop index if exists {unprocessed_idx}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("drop index if exists {range_idx}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "create index if not exists {brin_idx} on {partition} using brin (submitted_at)"
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Runs `ensure_forward`, then cools down yesterday's partition (spec
    /// §4.2, §5 "partition maintenance runs as a background task alongside
    /// the worker"), on a fixed interval for as long as the process lives.
    pub async fn run_periodic(&self, horizon_days: i64, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.ensure_forward(horizon_days).await {
                warn!(error = %err, "partition maintenance tick failed");
            }
            let yesterday = partition_name(Utc::now().date_naive() - Duration::days(1));
            if let Err(err) = self.install_brin_index(&yesterday).await {
                warn!(partition = %yesterday, error = %err, "failed to cool down partition indexes");
            }
        }
    }
}

fn partition_name(day: NaiveDate) -> String {
    format!("report_{}", day.format("%Y_%m_%d"))
}

fn partition_date(table_name: &str) -> Option<NaiveDate> {
    let digits = table_name.strip_prefix("report_")?;
    NaiveDate::parse_from_str(digits, "%Y_%m_%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_name_round_trips_through_partition_date() {
        let day = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let name = partition_name(day);
        assert_eq!(name, "report_2026_07_28");
        assert_eq!(partition_date(&name), Some(day));
    }

    #[test]
    fn partition_date_rejects_unrelated_names() {
        assert_eq!(partition_date("report_default"), None);
        assert_eq!(partition_date("wifi"), None);
    }

    #[sqlx::test]
    async fn ensure_forward_creates_todays_and_future_partitions(pool: PgPool) -> sqlx::Result<()> {
        let manager = PartitionManager::new(pool.clone());
        manager.ensure_forward(2).await?;

        let today = Utc::now().date_naive();
        for offset in 0..=2 {
            let name = partition_name(today + Duration::days(offset));
            let exists: bool = sqlx::query_scalar("select exists(select 1 from pg_class where relname = $1)")
                .bind(&name)
                .fetch_one(&pool)
                .await?;
            assert!(exists, "expected partition {name} to exist");
        }
        Ok(())
    }

    #[sqlx::test]
    async fn ensure_forward_is_idempotent(pool: PgPool) -> sqlx::Result<()> {
        let manager = PartitionManager::new(pool);
        manager.ensure_forward(1).await?;
        manager.ensure_forward(1).await?;
        Ok(())
    }

    #[sqlx::test]
    async fn drop_expired_removes_only_partitions_past_retention(pool: PgPool) -> sqlx::Result<()> {
        let manager = PartitionManager::new(pool.clone());
        manager.ensure_forward(1).await?;

        let mut tx = pool.begin().await?;
        let old_day = Utc::now().date_naive() - Duration::days(200);
        let old_name = partition_name(old_day);
        manager.ensure_partition(&mut tx, old_day).await?;
        tx.commit().await?;

        let dropped = manager.drop_expired(120, false).await?;
        assert!(dropped.contains(&old_name));

        let today_name = partition_name(Utc::now().date_naive());
        assert!(!dropped.contains(&today_name));
        Ok(())
    }

    #[sqlx::test]
    async fn install_brin_index_replaces_hot_tail_indexes(pool: PgPool) -> sqlx::Result<()> {
        let manager = PartitionManager::new(pool.clone());
        manager.ensure_forward(0).await?;
        let today = partition_name(Utc::now().date_naive());

        manager.install_brin_index(&today).await?;

        let brin_exists: bool = sqlx::query_scalar("select exists(select 1 from pg_class where relname = $1)")
            .bind(format!("{today}_submitted_at_brin"))
            .fetch_one(&pool)
            .await?;
        assert!(brin_exists);

        let partial_exists: bool = sqlx::query_scalar("select exists(select 1 from pg_class where relname = $1)")
            .bind(format!("{today}_unprocessed_idx"))
            .fetch_one(&pool)
            .await?;
        assert!(!partial_exists);
        Ok(())
    }
}
