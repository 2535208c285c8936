//! SQLite-backed [`SnapshotStore`], available behind the `sqlite` feature.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, instrument};

use super::snapshot::{InstanceSnapshot, SnapshotStore};
use super::PersistenceError;

/// Snapshot store persisting to a SQLite database file.
///
/// The whole snapshot is stored as one serialized blob per instance; the
/// indexed columns exist for operational queries, not for partial reads.
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    /// Connect to (and if necessary create) the database at `database_url`,
    /// e.g. `sqlite://harelite.db`.
    #[instrument]
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS instance_snapshots (
                instance_id TEXT PRIMARY KEY,
                chart_name  TEXT    NOT NULL,
                saved_at    TEXT    NOT NULL,
                last_seq    INTEGER NOT NULL,
                body        BLOB    NOT NULL
            )
            ",
        )
        .execute(&pool)
        .await?;
        debug!(database_url, "snapshot store ready");
        Ok(Self { pool })
    }

    /// Wrap an existing pool, assuming the schema is already in place.
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, snapshot: &InstanceSnapshot) -> Result<(), PersistenceError> {
        let body = snapshot.to_bytes()?;
        sqlx::query(
            r"
            INSERT INTO instance_snapshots (instance_id, chart_name, saved_at, last_seq, body)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(instance_id) DO UPDATE SET
                chart_name = excluded.chart_name,
                saved_at   = excluded.saved_at,
                last_seq   = excluded.last_seq,
                body       = excluded.body
            ",
        )
        .bind(&snapshot.instance_id)
        .bind(&snapshot.chart_name)
        .bind(snapshot.saved_at.to_rfc3339())
        .bind(i64::try_from(snapshot.last_seq).unwrap_or(i64::MAX))
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>, PersistenceError> {
        let row = sqlx::query("SELECT body FROM instance_snapshots WHERE instance_id = ?1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let body: Vec<u8> = row.try_get("body")?;
                Ok(Some(InstanceSnapshot::from_bytes(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, instance_id: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM instance_snapshots WHERE instance_id = ?1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, PersistenceError> {
        let rows =
            sqlx::query("SELECT instance_id FROM instance_snapshots ORDER BY instance_id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("instance_id").map_err(Into::into))
            .collect()
    }
}
