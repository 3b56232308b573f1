//! PostgreSQL store with runtime queries (no compile-time checking)

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::{Executor, PgPool, QueryBuilder, Row as _, Transaction};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::row::{Row, SqlType, SqlValue};
use super::schema::{self, SCHEMA_HASH_KEY};
use crate::aggregates::views::AggregateView;
use crate::config::DatabaseConfig;
use crate::core::{AggregatePort, BlockLogRow, StorageError, StoragePort, WriteSession};

/// Postgres caps bind parameters per statement at 65535
const MAX_BIND_PARAMS: usize = 65_000;

#[derive(Clone)]
pub struct PostgresManager {
    pub pool: PgPool,
}

impl PostgresManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .connect(&config.postgres_url)
            .await?;

        Ok(Self { pool })
    }

    /// Creates the schema on an empty database and verifies the stored
    /// schema hash otherwise. With `rebuild` a mismatching schema is
    /// dropped and recreated, losing all indexed data.
    pub async fn ensure_schema(&self, rebuild: bool) -> Result<(), StorageError> {
        let expected = schema::schema_hash();
        let stored = self.stored_schema_hash().await?;

        match stored {
            Some(stored) if stored == expected => {
                debug!(hash = %expected, "Schema up to date");
                return Ok(());
            }
            Some(stored) if !rebuild => {
                return Err(StorageError::SchemaMismatch { stored, expected });
            }
            Some(stored) => {
                warn!(stored = %stored, expected = %expected, "Rebuilding schema, dropping indexed data");
                self.drop_schema().await?;
            }
            None => info!("Creating schema"),
        }

        let mut tx = self.pool.begin().await?;
        (&mut *tx).execute(schema::ddl().as_str())
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;
        sqlx::query(
            "INSERT INTO constants (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(SCHEMA_HASH_KEY)
        .bind(&expected)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn stored_schema_hash(&self) -> Result<Option<String>, StorageError> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass('constants') IS NOT NULL")
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Ok(None);
        }
        self.get_constant(SCHEMA_HASH_KEY).await
    }

    async fn drop_schema(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for table in schema::all_table_names() {
            (&mut *tx).execute(format!("DROP TABLE IF EXISTS {} CASCADE", table).as_str())
                .await?;
        }
        (&mut *tx).execute("DELETE FROM constants").await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn push_value(builder: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>, row: &Row, i: usize) {
    match &row.values[i] {
        SqlValue::BigInt(v) => builder.push_bind(*v),
        SqlValue::Text(v) => builder.push_bind(v.clone()),
        SqlValue::Bytes(v) => builder.push_bind(v.clone()),
        SqlValue::Bool(v) => builder.push_bind(*v),
        SqlValue::Null => match column_type(row, i) {
            SqlType::BigInt => builder.push_bind(None::<i64>),
            SqlType::Text => builder.push_bind(None::<String>),
            SqlType::Bytea => builder.push_bind(None::<Vec<u8>>),
            SqlType::Bool => builder.push_bind(None::<bool>),
        },
    };
}

fn column_type(row: &Row, i: usize) -> SqlType {
    schema::table(row.table)
        .and_then(|t| t.column(row.columns[i]))
        .map_or(SqlType::Text, |c| c.ty)
}

/// One multi-row INSERT for rows sharing table and column list
fn insert_statement(rows: &[Row]) -> QueryBuilder<'static, Postgres> {
    let first = &rows[0];
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        first.table,
        first.columns.join(", ")
    ));
    builder.push_values(rows, |mut b, row| {
        for i in 0..row.values.len() {
            push_value(&mut b, row, i);
        }
    });
    builder
}

/// Splits rows into runs of identical shape, each small enough for one
/// statement
fn chunks(rows: &[Row]) -> Vec<&[Row]> {
    let mut out = Vec::new();
    let mut start = 0;
    while start < rows.len() {
        let width = rows[start].columns.len().max(1);
        let limit = (MAX_BIND_PARAMS / width).max(1);
        let mut end = start + 1;
        while end < rows.len() && end - start < limit && rows[end].same_shape(&rows[start]) {
            end += 1;
        }
        out.push(&rows[start..end]);
        start = end;
    }
    out
}

/// Transaction held open by the tolerant strategy until the next commit
pub struct PgSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl WriteSession for PgSession {
    async fn write_group(&mut self, rows: &[Row]) -> Result<(), StorageError> {
        (&mut *self.tx).execute("SAVEPOINT event_rows").await?;
        for row in rows {
            let result = insert_statement(std::slice::from_ref(row))
                .build()
                .execute(&mut *self.tx)
                .await;
            if let Err(e) = result {
                warn!(table = row.table, error = %e, "Row rejected, rolling back its event");
                (&mut *self.tx).execute("ROLLBACK TO SAVEPOINT event_rows").await?;
                return Err(StorageError::RowRejected {
                    table: row.table.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        (&mut *self.tx).execute("RELEASE SAVEPOINT event_rows").await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl StoragePort for PostgresManager {
    async fn write_rows(&self, rows: &[Row]) -> Result<(), StorageError> {
        let mut sorted: Vec<Row> = rows.to_vec();
        // Grouping by table only; rows of one table keep their order
        sorted.sort_by(|a, b| a.table.cmp(b.table));

        let mut tx = self.pool.begin().await?;
        for chunk in chunks(&sorted) {
            insert_statement(chunk).build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn begin_session(&self) -> Result<Box<dyn WriteSession>, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession { tx }))
    }

    async fn get_constant(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value = sqlx::query_scalar("SELECT value FROM constants WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_constant(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO constants (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_constant(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM constants WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_checkpoint(&self) -> Result<Option<BlockLogRow>, StorageError> {
        let row = sqlx::query(
            "SELECT height, timestamp, hash, agg_state FROM block_log
             WHERE agg_state IS NOT NULL ORDER BY height DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<BlockLogRow, sqlx::Error> {
            Ok(BlockLogRow {
                height: row.try_get("height")?,
                timestamp: row.try_get("timestamp")?,
                hash: row.try_get("hash")?,
                agg_state: row.try_get("agg_state")?,
            })
        })
        .transpose()
        .map_err(|e| StorageError::Database(format!("unreadable block_log row: {}", e)))
    }
}

#[async_trait]
impl AggregatePort for PostgresManager {
    async fn watermark(&self, view: &str) -> Result<Option<i64>, StorageError> {
        let value = sqlx::query_scalar("SELECT watermark FROM aggregate_watermarks WHERE view = $1")
            .bind(view)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn earliest_block_timestamp(&self) -> Result<Option<i64>, StorageError> {
        let value: Option<i64> = sqlx::query_scalar("SELECT MIN(timestamp) FROM block_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(value)
    }

    async fn refresh_view(
        &self,
        view: &AggregateView,
        from: i64,
        to: i64,
        watermark: i64,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&view.refresh_sql())
            .bind(from)
            .bind(to)
            .bind(view.bucket.nanos())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO aggregate_watermarks (view, watermark) VALUES ($1, $2)
             ON CONFLICT (view) DO UPDATE SET watermark = GREATEST(aggregate_watermarks.watermark, EXCLUDED.watermark)",
        )
        .bind(view.name())
        .bind(watermark)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod tests {
    use super::*;

    async fn connect() -> PostgresManager {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| DatabaseConfig::default().postgres_url);
        let config = DatabaseConfig {
            postgres_url: url,
            ..DatabaseConfig::default()
        };
        let manager = PostgresManager::new(&config).await.unwrap();
        manager.ensure_schema(true).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn constants_round_trip() {
        let store = connect().await;
        store.set_constant("sample_key", "1").await.unwrap();
        assert_eq!(store.get_constant("sample_key").await.unwrap().as_deref(), Some("1"));
        store.delete_constant("sample_key").await.unwrap();
        assert_eq!(store.get_constant("sample_key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn checkpoint_reads_latest_snapshot_row() {
        let store = connect().await;
        let row = |height: i64, state: Option<Vec<u8>>| {
            schema::validate_row(
                "block_log",
                &["height", "timestamp", "hash", "agg_state"],
                vec![height.into(), (height * 10).into(), vec![1u8].into(), state.into()],
            )
            .unwrap()
        };
        let base = 9_000_000_000;
        store
            .write_rows(&[row(base, Some(vec![7])), row(base + 1, None)])
            .await
            .unwrap();
        let latest = store.latest_checkpoint().await.unwrap().unwrap();
        assert_eq!(latest.height, base);
        assert_eq!(latest.agg_state, vec![7]);
    }

    #[tokio::test]
    async fn session_rolls_back_only_the_rejected_group() {
        let store = connect().await;
        let row = |height: i64| {
            schema::validate_row(
                "block_log",
                &["height", "timestamp", "hash", "agg_state"],
                vec![height.into(), (height * 10).into(), vec![1u8].into(), None::<Vec<u8>>.into()],
            )
            .unwrap()
        };
        let base = 9_100_000_000;
        let mut session = store.begin_session().await.unwrap();
        session.write_group(&[row(base)]).await.unwrap();
        let err = session
            .write_group(&[row(base + 1), row(base)])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RowRejected { .. }));
        session.commit().await.unwrap();

        let heights: Vec<i64> = sqlx::query_scalar("SELECT height FROM block_log WHERE height >= $1 ORDER BY height")
            .bind(base)
            .fetch_all(&store.pool)
            .await
            .unwrap();
        assert_eq!(heights, vec![base]);
    }
}
