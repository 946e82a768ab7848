//! The Report Log (C1, spec §4.1): an append-only durable store of raw
//! submissions with reservation-based dequeue for processing.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

#[derive(Debug, Clone)]
pub struct ReservedReport {
    pub id: i64,
    pub submitted_at: DateTime<Utc>,
    pub raw: Vec<u8>,
    pub user_agent: Option<String>,
}

pub struct ReportLog {
    pool: PgPool,
}

impl ReportLog {
    pub fn new(pool: PgPool) -> Self {
        ReportLog { pool }
    }

    /// Durable before return. Assigns `submitted_at = now()` and inserts
    /// into the partition covering that instant (spec §4.1).
    pub async fn append(
        &self,
        raw: &[u8],
        timestamp: DateTime<Utc>,
        truth_lat: f64,
        truth_lon: f64,
        user_agent: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        let id: i64 = sqlx::query_scalar(
            "insert into report (timestamp, latitude, longitude, user_agent, raw)
             values ($1, $2, $3, $4, $5)
             returning id",
        )
        .bind(timestamp)
        .bind(truth_lat)
        .bind(truth_lon)
        .bind(user_agent)
        .bind(raw)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Selects up to `batch_size` unprocessed rows, ordered by
    /// `submitted_at` ascending, under row-level locks that skip
    /// already-locked rows so concurrent workers don't collide (spec
    /// §4.1, §5). Valid for the duration of `tx`.
    pub async fn reserve(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch_size: i64,
    ) -> Result<Vec<ReservedReport>, sqlx::Error> {
        let rows: Vec<ReservedReport> = sqlx::query_as(
            "select id, submitted_at, raw, user_agent from report
             where processed_at is null
             order by submitted_at asc
             limit $1
             for update skip locked",
        )
        .bind(batch_size)
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows)
    }

    pub async fn mark_done(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        submitted_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("update report set processed_at = now() where id = $1 and submitted_at = $2")
            .bind(id)
            .bind(submitted_at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        submitted_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update report set processed_at = now(), processing_error = $3 where id = $1 and submitted_at = $2",
        )
        .bind(id)
        .bind(submitted_at)
        .bind(error)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ReservedReport {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(ReservedReport {
            id: row.try_get("id")?,
            submitted_at: row.try_get("submitted_at")?,
            raw: row.try_get("raw")?,
            user_agent: row.try_get("user_agent")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test]
    async fn reserve_skips_already_reserved_rows_until_marked(pool: PgPool) -> sqlx::Result<()> {
        let log = ReportLog::new(pool.clone());
        let id = log.append(b"{}", Utc::now(), 56.0, 37.0, None).await?;

        let mut tx = pool.begin().await?;
        let reserved = log.reserve(&mut tx, 10).await?;
        assert_eq!(reserved.len(), 1);
        assert_eq!(reserved[0].id, id);
        log.mark_done(&mut tx, reserved[0].id, reserved[0].submitted_at).await?;
        tx.commit().await?;

        let mut tx = pool.begin().await?;
        let reserved_again = log.reserve(&mut tx, 10).await?;
        assert!(reserved_again.is_empty());
        tx.commit().await?;
        Ok(())
    }

    #[sqlx::test]
    async fn mark_failed_leaves_processing_error_set(pool: PgPool) -> sqlx::Result<()> {
        let log = ReportLog::new(pool.clone());
        let id = log.append(b"{}", Utc::now(), 56.0, 37.0, None).await?;

        let mut tx = pool.begin().await?;
        let reserved = log.reserve(&mut tx, 10).await?;
        log.mark_failed(&mut tx, reserved[0].id, reserved[0].submitted_at, "bad timestamp").await?;
        tx.commit().await?;

        let (processed, error): (Option<DateTime<Utc>>, Option<String>) =
            sqlx::query_as("select processed_at, processing_error from report where id = $1")
                .bind(id)
                .fetch_one(&pool)
                .await?;
        assert!(processed.is_some());
        assert_eq!(error.as_deref(), Some("bad timestamp"));
        Ok(())
    }

    /// Simulates the crash scenario from spec §8: a batch is reserved and
    /// part of it acted on, but the transaction never commits. On restart
    /// (a fresh transaction) the whole batch is still unprocessed.
    #[sqlx::test]
    async fn uncommitted_reservation_leaves_rows_unprocessed(pool: PgPool) -> sqlx::Result<()> {
        let log = ReportLog::new(pool.clone());
        for _ in 0..3 {
            log.append(b"{}", Utc::now(), 56.0, 37.0, None).await?;
        }

        {
            let mut tx = pool.begin().await?;
            let reserved = log.reserve(&mut tx, 10).await?;
            assert_eq!(reserved.len(), 3);
            log.mark_done(&mut tx, reserved[0].id, reserved[0].submitted_at).await?;
            // tx dropped here without commit: simulates a crash mid-batch.
        }

        let mut tx = pool.begin().await?;
        let reserved_after_crash = log.reserve(&mut tx, 10).await?;
        assert_eq!(reserved_after_crash.len(), 3);
        tx.commit().await?;
        Ok(())
    }
}
