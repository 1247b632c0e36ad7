//! Storage sink for transformed records
//!
//! [`PgRecordSink`] writes a batch with a single multi-row `INSERT`, so a batch
//! is either fully stored or not at all.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;

use super::transform::StorageRecord;

/// Columns bound per record
const COLUMNS_PER_RECORD: usize = 10;

/// PostgreSQL caps a statement at 65535 bind parameters
pub const MAX_RECORDS_PER_STATEMENT: usize = 65_535 / COLUMNS_PER_RECORD;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Sink rejected batch: {0}")]
    Rejected(String),
}

/// Destination for batches of records
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    /// Store all of `records` atomically, returning the number stored
    async fn insert_batch(&self, records: &[StorageRecord]) -> Result<u64, SinkError>;
}

/// Writes records into the `records` table
#[derive(Debug, Clone)]
pub struct PgRecordSink {
    pool: PgPool,
}

impl PgRecordSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordSink for PgRecordSink {
    async fn insert_batch(&self, records: &[StorageRecord]) -> Result<u64, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }

        if records.len() <= MAX_RECORDS_PER_STATEMENT {
            let result = build_insert(records).build().execute(&self.pool).await?;
            return Ok(result.rows_affected());
        }

        // Oversized batches are split into statements sharing one transaction.
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for chunk in records.chunks(MAX_RECORDS_PER_STATEMENT) {
            let result = build_insert(chunk).build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        tracing::debug!(records = records.len(), "Inserted oversized batch in chunks");
        Ok(inserted)
    }
}

fn build_insert(records: &[StorageRecord]) -> QueryBuilder<'_, Postgres> {
    let mut query_builder = QueryBuilder::new(
        r#"
        INSERT INTO records (
            first_name, last_name, company, city, country,
            phone_1, phone_2, email, subscription_date, website
        )
        "#,
    );

    query_builder.push_values(records, |mut b, record| {
        let subscription_date = record
            .subscription_date
            .as_deref()
            .filter(|date| !date.trim().is_empty());

        b.push_bind(record.first_name.as_deref())
            .push_bind(record.last_name.as_deref())
            .push_bind(record.company.as_deref())
            .push_bind(record.city.as_deref())
            .push_bind(record.country.as_deref())
            .push_bind(record.phone_1.as_deref())
            .push_bind(record.phone_2.as_deref())
            .push_bind(record.email.as_deref())
            .push_bind(subscription_date)
            .push_unseparated("::date")
            .push_bind(record.website.as_deref());
    });

    query_builder
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, date: Option<&str>) -> StorageRecord {
        StorageRecord {
            first_name: Some(name.to_string()),
            subscription_date: date.map(str::to_string),
            ..StorageRecord::default()
        }
    }

    #[test]
    fn test_insert_statement_binds_ten_columns_per_record() {
        let records = vec![record("a", Some("2021-01-01")), record("b", None)];
        let builder = build_insert(&records);
        let sql = builder.sql();

        assert!(sql.contains("INSERT INTO records"));
        assert!(sql.contains("$9::date, $10)"));
        assert!(sql.contains("$19::date, $20)"));
        assert!(!sql.contains("$21"));
    }

    #[test]
    fn test_statement_limit_fits_default_batch() {
        assert!(MAX_RECORDS_PER_STATEMENT >= 1000);
        assert!(MAX_RECORDS_PER_STATEMENT * COLUMNS_PER_RECORD <= 65_535);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_database() {
        let pool = PgPool::connect_lazy("postgresql://localhost/unreachable").unwrap();
        let sink = PgRecordSink::new(pool);
        assert_eq!(sink.insert_batch(&[]).await.unwrap(), 0);
    }
}
