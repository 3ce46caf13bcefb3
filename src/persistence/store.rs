//! SQLite-based publish history

use crate::persistence::{GraphHistory, PublishOutcome, PublishRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;

/// SQLite publish history
pub struct SqliteGraphHistory {
    pool: SqlitePool,
}

impl SqliteGraphHistory {
    /// Open (or create) a history database
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Private in-memory database on a single connection
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("shipgraph");
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("Failed to create data directory: {}", db_dir.display()))?;

        Self::new(db_dir.join("history.db")).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS publish_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                graph_name TEXT NOT NULL,
                version TEXT,
                digest TEXT NOT NULL,
                commit_id TEXT,
                outcome TEXT NOT NULL,
                detail TEXT,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_graph_name ON publish_history(graph_name);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize publish history schema")?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn from_row(row: &SqliteRow) -> Result<PublishRecord> {
        Ok(PublishRecord {
            id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            graph_name: row.get("graph_name"),
            version: row.get("version"),
            digest: row.get("digest"),
            commit_id: row.get("commit_id"),
            outcome: row.get::<String, _>("outcome").parse::<PublishOutcome>()?,
            detail: row.get("detail"),
            recorded_at: Self::from_naive(row.get("recorded_at")),
        })
    }
}

#[async_trait::async_trait]
impl GraphHistory for SqliteGraphHistory {
    async fn record(&self, record: &PublishRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publish_history
            (id, graph_name, version, digest, commit_id, outcome, detail, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.graph_name)
        .bind(&record.version)
        .bind(&record.digest)
        .bind(&record.commit_id)
        .bind(record.outcome.to_string())
        .bind(&record.detail)
        .bind(Self::to_naive(record.recorded_at))
        .execute(&self.pool)
        .await
        .context("Failed to record publish")?;

        Ok(())
    }

    async fn list(&self, graph_name: &str) -> Result<Vec<PublishRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, graph_name, version, digest, commit_id, outcome, detail, recorded_at
            FROM publish_history
            WHERE graph_name = ?1
            ORDER BY seq DESC
            "#,
        )
        .bind(graph_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list publish history")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn latest(&self, graph_name: &str) -> Result<Option<PublishRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, graph_name, version, digest, commit_id, outcome, detail, recorded_at
            FROM publish_history
            WHERE graph_name = ?1
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(graph_name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get latest publish")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_graphs(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT graph_name
            FROM publish_history
            ORDER BY graph_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list graphs")?;

        Ok(rows.iter().map(|row| row.get("graph_name")).collect())
    }
}
