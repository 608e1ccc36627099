use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{migrate::MigrateDatabase, Row, SqlitePool};
use tracing::info;

use super::{LedgerIoError, PersistedScan, ScanMetadata, ScanStore};
use crate::codec::UnitCode;
use crate::types::ShiftId;

/// SQLite-backed scan store, enabled with the `database` feature
pub struct SqliteScanStore {
    pool: SqlitePool,
}

impl SqliteScanStore {
    /// Open (and create if needed) the database and its `scans` table
    pub async fn connect(database_url: &str) -> Result<Self, LedgerIoError> {
        if !sqlx::Sqlite::database_exists(database_url).await? {
            info!("Creating scan database at {}", database_url);
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePool::connect(database_url).await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scans (
                shift_id TEXT NOT NULL,
                dedup_key TEXT NOT NULL,
                unit_json TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                scanned_at TEXT NOT NULL,
                PRIMARY KEY (shift_id, dedup_key)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ScanStore for SqliteScanStore {
    async fn persist_scan(
        &self,
        shift_id: &ShiftId,
        unit: &UnitCode,
        metadata: &ScanMetadata,
    ) -> Result<(), LedgerIoError> {
        // First write wins, same as the memory index
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO scans (shift_id, dedup_key, unit_json, metadata_json, scanned_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(shift_id.as_str())
        .bind(unit.dedup_key())
        .bind(serde_json::to_string(unit)?)
        .bind(serde_json::to_string(metadata)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_persisted_scans(&self, shift_id: &ShiftId) -> Result<Vec<PersistedScan>, LedgerIoError> {
        let rows = sqlx::query(
            r#"
            SELECT unit_json, metadata_json, scanned_at
            FROM scans
            WHERE shift_id = ?1
            ORDER BY scanned_at ASC
            "#,
        )
        .bind(shift_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut scans = Vec::with_capacity(rows.len());
        for row in rows {
            let unit_json: String = row.get("unit_json");
            let metadata_json: String = row.get("metadata_json");
            let scanned_at: String = row.get("scanned_at");
            let timestamp = DateTime::parse_from_rfc3339(&scanned_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| LedgerIoError::Unavailable {
                    reason: format!("corrupt timestamp {scanned_at:?}: {e}"),
                })?;

            scans.push(PersistedScan {
                shift_id: shift_id.clone(),
                unit: serde_json::from_str(&unit_json)?,
                timestamp,
                metadata: serde_json::from_str(&metadata_json)?,
            });
        }
        Ok(scans)
    }

    async fn contains(&self, shift_id: &ShiftId, dedup_key: &str) -> Result<bool, LedgerIoError> {
        let row = sqlx::query("SELECT 1 FROM scans WHERE shift_id = ?1 AND dedup_key = ?2")
            .bind(shift_id.as_str())
            .bind(dedup_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn delete_scans(&self, shift_id: &ShiftId, dedup_keys: &[String]) -> Result<usize, LedgerIoError> {
        let mut transaction = self.pool.begin().await?;
        let mut deleted = 0;
        for key in dedup_keys {
            let result = sqlx::query("DELETE FROM scans WHERE shift_id = ?1 AND dedup_key = ?2")
                .bind(shift_id.as_str())
                .bind(key)
                .execute(&mut *transaction)
                .await?;
            deleted += result.rows_affected() as usize;
        }
        transaction.commit().await?;
        Ok(deleted)
    }

    async fn clear_shift(&self, shift_id: &ShiftId) -> Result<(), LedgerIoError> {
        sqlx::query("DELETE FROM scans WHERE shift_id = ?1")
            .bind(shift_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
