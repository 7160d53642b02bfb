//! Local durable cache (SQLite).
//!
//! Two logical tables: `transcripts` (ordered entries per session) and
//! `sessions` (local overrides + last-seen). A schema version mismatch drops
//! and recreates both; nothing is migrated across a bump.

use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, info, warn};

use crate::config::VmuxConfig;
use crate::error::StoreError;
use crate::models::{PersistedSession, TranscriptEntry};

/// Current schema version. Any change here wipes existing local caches.
const SCHEMA_VERSION: i64 = 2;

#[derive(Clone)]
pub struct PersistenceStore {
    pub(crate) pool: SqlitePool,
}

impl PersistenceStore {
    pub async fn open(config: &VmuxConfig) -> Result<Self> {
        info!("Opening local cache: {}", config.db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .min_connections(1)
            .connect(&config.db_url())
            .await
            .with_context(|| format!("Failed to connect to database: {}", config.db_url()))?;

        run_migrations(&pool).await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Isolated in-memory store with the current schema applied.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to create in-memory SQLite pool")?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── transcripts ─────────────────────────────────────────────────────

    pub async fn append_entries(&self, entries: &[TranscriptEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            let json = serde_json::to_string(entry).context("Failed to encode transcript entry")?;
            sqlx::query("INSERT INTO transcripts (session_id, entry_json) VALUES (?, ?)")
                .bind(&entry.session_id)
                .bind(json)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!("Persisted {} transcript entries", entries.len());
        Ok(())
    }

    /// Entries for one session in the order they were appended.
    pub async fn load_transcript(&self, session_id: &str) -> Result<Vec<TranscriptEntry>> {
        self.load_transcript_through(session_id, i64::MAX).await
    }

    /// Like [`load_transcript`](Self::load_transcript), limited to rows at or
    /// below `last_id` (see [`transcript_watermark`](Self::transcript_watermark)).
    pub async fn load_transcript_through(
        &self,
        session_id: &str,
        last_id: i64,
    ) -> Result<Vec<TranscriptEntry>> {
        let rows = sqlx::query(
            "SELECT entry_json FROM transcripts WHERE session_id = ? AND id <= ? ORDER BY id ASC",
        )
        .bind(session_id)
        .bind(last_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let json: String = row.get("entry_json");
                match serde_json::from_str(&json) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        debug!("Skipping unreadable transcript row: {}", e);
                        None
                    }
                }
            })
            .collect())
    }

    /// Highest transcript row id written so far, 0 for an empty cache. Row
    /// ids are never reused, so rows above it were written later.
    pub async fn transcript_watermark(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS last_id FROM transcripts")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("last_id"))
    }

    pub async fn clear_transcript(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM transcripts WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ── sessions ────────────────────────────────────────────────────────

    pub async fn touch_session(&self, session_id: &str, last_seen: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, last_seen) VALUES (?, ?)
            ON CONFLICT(session_id) DO UPDATE SET last_seen = excluded.last_seen
            "#,
        )
        .bind(session_id)
        .bind(last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_display_name(
        &self,
        session_id: &str,
        display_name: Option<&str>,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, display_name, last_seen) VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET display_name = excluded.display_name
            "#,
        )
        .bind(session_id)
        .bind(display_name)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_hue_override(&self, session_id: &str, hue: Option<u16>, now: i64) -> Result<()> {
        if let Some(h) = hue {
            if h >= 360 {
                return Err(StoreError::InvalidHue(h).into());
            }
        }
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, hue_override, last_seen) VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET hue_override = excluded.hue_override
            "#,
        )
        .bind(session_id)
        .bind(hue.map(i64::from))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_sessions(&self) -> Result<Vec<PersistedSession>> {
        let rows = sqlx::query(
            "SELECT session_id, display_name, hue_override, last_seen FROM sessions ORDER BY last_seen DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PersistedSession {
                session_id: row.get("session_id"),
                display_name: row.get("display_name"),
                hue_override: row
                    .get::<Option<i64>, _>("hue_override")
                    .and_then(|h| u16::try_from(h).ok()),
                last_seen: row.get("last_seen"),
            })
            .collect())
    }

    /// Drop sessions not seen since `cutoff` (epoch ms) along with their
    /// transcripts. Returns the number of sessions removed.
    pub async fn prune_sessions(&self, cutoff: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM transcripts WHERE session_id IN (SELECT session_id FROM sessions WHERE last_seen < ?)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE last_seen < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch())
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    if current_version == SCHEMA_VERSION {
        debug!("Local cache schema is up to date (version {})", current_version);
        return Ok(());
    }

    if current_version != 0 {
        warn!(
            "Local cache schema version {} differs from {}; dropping cached data",
            current_version, SCHEMA_VERSION
        );
    }

    let mut tx = pool.begin().await?;
    sqlx::query("DROP TABLE IF EXISTS transcripts")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DROP TABLE IF EXISTS sessions")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE transcripts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            entry_json TEXT NOT NULL,
            created_at INTEGER NOT NULL DEFAULT (unixepoch())
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX idx_transcripts_session ON transcripts(session_id, id)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE sessions (
            session_id TEXT PRIMARY KEY,
            display_name TEXT,
            hue_override INTEGER,
            last_seen INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM schema_version")
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!("Local cache schema created (version {})", SCHEMA_VERSION);
    Ok(())
}
