//! PostgreSQL store backend
//!
//! Amounts are stored as NUMERIC(78,0): written as text and cast with
//! `$n::NUMERIC`, read back with `amount::TEXT`. Identifiers and addresses are
//! lowercase 0x-hex strings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::WrapErr;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Row};
use std::collections::HashMap;
use tracing::error;

use super::DepositStore;
use crate::error::StoreError;
use crate::types::{ChainTag, DepositId, DepositRecord, EvmAddress, Status};

/// Row shape of the `deposits` table
#[derive(Debug, Clone, FromRow)]
struct DepositRow {
    deposit_id: String,
    sender: String,
    recipient: String,
    amount: String,
    dest_chain_tag: i64,
    observed_at: i64,
    status: Status,
    attempts: i32,
    last_error: Option<String>,
    fulfillment_tx: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DepositRow> for DepositRecord {
    type Error = StoreError;

    fn try_from(row: DepositRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, e: &dyn std::fmt::Display| {
            StoreError::Corrupt(format!("deposit {} field {}: {}", row.deposit_id, field, e))
        };
        Ok(DepositRecord {
            id: DepositId::from_hex(&row.deposit_id).map_err(|e| corrupt("deposit_id", &e))?,
            sender: EvmAddress::from_hex(&row.sender).map_err(|e| corrupt("sender", &e))?,
            recipient: EvmAddress::from_hex(&row.recipient).map_err(|e| corrupt("recipient", &e))?,
            amount: row.amount.parse().map_err(|e| corrupt("amount", &e))?,
            dest_chain_tag: ChainTag(row.dest_chain_tag as u64),
            observed_at: row.observed_at as u64,
            status: row.status,
            attempts: row.attempts as u32,
            last_error: row.last_error.clone(),
            fulfillment_tx: row.fulfillment_tx.clone(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"SELECT deposit_id, sender, recipient, amount::TEXT AS amount,
    dest_chain_tag, observed_at, status, attempts, last_error, fulfillment_tx,
    created_at, updated_at
    FROM deposits"#;

fn unavailable(context: &str, e: sqlx::Error) -> StoreError {
    error!("SQL error {}: {:?}", context, e);
    StoreError::Unavailable(format!("{}: {}", context, e))
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and apply pending migrations
    pub async fn connect(database_url: &str) -> eyre::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .wrap_err("Failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .wrap_err("Failed to run database migrations")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DepositStore for PgStore {
    async fn get(&self, id: &DepositId) -> Result<Option<DepositRecord>, StoreError> {
        let row = sqlx::query_as::<_, DepositRow>(&format!("{} WHERE deposit_id = $1", SELECT_COLUMNS))
            .bind(id.to_hex())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| unavailable("getting deposit", e))?;

        row.map(DepositRecord::try_from).transpose()
    }

    async fn upsert(&self, record: &DepositRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO deposits (deposit_id, sender, recipient, amount, dest_chain_tag,
                observed_at, status, attempts, last_error, fulfillment_tx, created_at, updated_at)
            VALUES ($1, $2, $3, $4::NUMERIC, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (deposit_id) DO UPDATE SET
                status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                last_error = EXCLUDED.last_error,
                fulfillment_tx = EXCLUDED.fulfillment_tx,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.id.to_hex())
        .bind(record.sender.to_hex())
        .bind(record.recipient.to_hex())
        .bind(record.amount.to_string())
        .bind(record.dest_chain_tag.0 as i64)
        .bind(record.observed_at as i64)
        .bind(record.status)
        .bind(record.attempts as i32)
        .bind(&record.last_error)
        .bind(&record.fulfillment_tx)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("upserting deposit", e))?;

        Ok(())
    }

    async fn list_unconfirmed(&self) -> Result<Vec<DepositRecord>, StoreError> {
        let rows = sqlx::query_as::<_, DepositRow>(&format!(
            "{} WHERE status IN ('observed', 'submitted') ORDER BY observed_at, deposit_id",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| unavailable("listing unconfirmed deposits", e))?;

        rows.into_iter().map(DepositRecord::try_from).collect()
    }

    async fn list_by_status(
        &self,
        status: Status,
        limit: usize,
    ) -> Result<Vec<DepositRecord>, StoreError> {
        let rows = sqlx::query_as::<_, DepositRow>(&format!(
            "{} WHERE status = $1 ORDER BY updated_at DESC LIMIT $2",
            SELECT_COLUMNS
        ))
        .bind(status)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| unavailable("listing deposits by status", e))?;

        rows.into_iter().map(DepositRecord::try_from).collect()
    }

    async fn status_counts(&self) -> Result<HashMap<Status, u64>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM deposits GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| unavailable("counting deposits", e))?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: Status = row
                .try_get("status")
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }

    async fn cursor(&self) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT position FROM relay_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| unavailable("reading cursor", e))?;

        row.map(|r| {
            r.try_get::<i64, _>("position")
                .map(|p| p as u64)
                .map_err(|e| StoreError::Corrupt(e.to_string()))
        })
        .transpose()
    }

    async fn set_cursor(&self, position: u64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO relay_cursor (id, position, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id) DO UPDATE SET position = EXCLUDED.position, updated_at = NOW()
            "#,
        )
        .bind(position as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("saving cursor", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> DepositRow {
        DepositRow {
            deposit_id: DepositId::from_label("dep1").to_hex(),
            sender: EvmAddress([1; 20]).to_hex(),
            recipient: EvmAddress([2; 20]).to_hex(),
            amount: "340282366920938463463374607431768211455".to_string(),
            dest_chain_tag: 1000,
            observed_at: 12,
            status: Status::Submitted,
            attempts: 2,
            last_error: Some("timeout".to_string()),
            fulfillment_tx: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_converts_to_record() {
        let record = DepositRecord::try_from(row()).unwrap();
        assert_eq!(record.id, DepositId::from_label("dep1"));
        assert_eq!(record.amount, u128::MAX);
        assert_eq!(record.status, Status::Submitted);
        assert_eq!(record.attempts, 2);
    }

    #[test]
    fn test_bad_row_is_corrupt() {
        let mut bad = row();
        bad.amount = "1.5".to_string();
        assert!(matches!(
            DepositRecord::try_from(bad),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
    async fn test_pg_roundtrip() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let store = PgStore::connect(&url).await.unwrap();
        let record = DepositRecord::try_from(row()).unwrap();
        store.upsert(&record).await.unwrap();
        let fetched = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.amount, record.amount);
        assert_eq!(fetched.status, Status::Submitted);

        store.set_cursor(55).await.unwrap();
        assert_eq!(store.cursor().await.unwrap(), Some(55));
    }
}
