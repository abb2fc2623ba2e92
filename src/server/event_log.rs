//! Append-only SQLite log of sync events.
//!
//! Each accepted event is written with a sequence number assigned by SQLite
//! (`seq INTEGER PRIMARY KEY AUTOINCREMENT`). Appends are serialized, so
//! sequence order always equals append order.

use chrono::{DateTime, SecondsFormat, Utc};
use esg_sync_core::{Action, SyncEvent};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::Mutex;

/// Maximum records returned by one query.
pub const QUERY_LIMIT: i64 = 100;

/// Errors reading or writing the event log.
#[derive(Debug)]
pub enum PersistenceError {
    /// Could not create the database directory.
    Io(PathBuf, std::io::Error),
    /// SQLite error.
    Database(sqlx::Error),
    /// Schema migration failed.
    Migration(sqlx::migrate::MigrateError),
    /// Payload could not be encoded as JSON.
    Encoding(serde_json::Error),
    /// A stored row could not be decoded.
    Corrupt { seq: i64, reason: String },
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::Io(path, e) => {
                write!(f, "I/O error for {}: {}", path.display(), e)
            }
            PersistenceError::Database(e) => write!(f, "Database error: {}", e),
            PersistenceError::Migration(e) => write!(f, "Migration failed: {}", e),
            PersistenceError::Encoding(e) => write!(f, "Failed to encode payload: {}", e),
            PersistenceError::Corrupt { seq, reason } => {
                write!(f, "Corrupt event log record {}: {}", seq, reason)
            }
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistenceError::Io(_, e) => Some(e),
            PersistenceError::Database(e) => Some(e),
            PersistenceError::Migration(e) => Some(e),
            PersistenceError::Encoding(e) => Some(e),
            PersistenceError::Corrupt { .. } => None,
        }
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(e: sqlx::Error) -> Self {
        PersistenceError::Database(e)
    }
}

/// A logged event with its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogRecord {
    pub sequence: i64,
    #[serde(flatten)]
    pub event: SyncEvent,
}

/// Optional filters for `EventLog::query`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
}

impl EventFilter {
    pub fn entity_type(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            entity_id: None,
        }
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    seq: i64,
    entity_type: String,
    entity_id: String,
    action: String,
    payload: String,
    origin: String,
    timestamp: String,
}

impl TryFrom<EventRow> for EventLogRecord {
    type Error = PersistenceError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| PersistenceError::Corrupt {
            seq: row.seq,
            reason,
        };

        let action = Action::parse(&row.action)
            .ok_or_else(|| corrupt(format!("unknown action '{}'", row.action)))?;
        let payload = serde_json::from_str(&row.payload)
            .map_err(|e| corrupt(format!("invalid payload: {}", e)))?;
        let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
            .map_err(|e| corrupt(format!("invalid timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(EventLogRecord {
            sequence: row.seq,
            event: SyncEvent {
                entity_type: row.entity_type,
                entity_id: row.entity_id,
                action,
                payload,
                origin_identity: row.origin,
                timestamp,
            },
        })
    }
}

const SELECT_EVENTS: &str =
    "SELECT seq, entity_type, entity_id, action, payload, origin, timestamp FROM sync_events";

/// Durable, append-only record of sync events.
pub struct EventLog {
    pool: SqlitePool,
    append_lock: Mutex<()>,
}

impl EventLog {
    /// Opens (creating if needed) the log database at `path` and runs migrations.
    pub async fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PersistenceError::Io(parent.to_path_buf(), e))?;
            }
        }

        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, running migrations first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, PersistenceError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(PersistenceError::Migration)?;

        Ok(Self {
            pool,
            append_lock: Mutex::new(()),
        })
    }

    /// Appends `event`, returning its sequence number once it is stored.
    pub async fn append(&self, event: &SyncEvent) -> Result<i64, PersistenceError> {
        let payload = serde_json::to_string(&event.payload).map_err(PersistenceError::Encoding)?;

        let _guard = self.append_lock.lock().await;

        let result = sqlx::query(
            "INSERT INTO sync_events (entity_type, entity_id, action, payload, origin, timestamp)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.entity_type)
        .bind(&event.entity_id)
        .bind(event.action.as_str())
        .bind(&payload)
        .bind(&event.origin_identity)
        .bind(event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Newest-first records matching `filter`, at most `QUERY_LIMIT` of them.
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<EventLogRecord>, PersistenceError> {
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_EVENTS);
        let mut keyword = " WHERE ";

        if let Some(entity_type) = &filter.entity_type {
            builder.push(keyword).push("entity_type = ").push_bind(entity_type.clone());
            keyword = " AND ";
        }
        if let Some(entity_id) = &filter.entity_id {
            builder.push(keyword).push("entity_id = ").push_bind(entity_id.clone());
        }
        builder.push(" ORDER BY seq DESC LIMIT ").push_bind(QUERY_LIMIT);

        let rows: Vec<EventRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(EventLogRecord::try_from).collect()
    }

    /// Oldest-first records after `sequence`, at most `QUERY_LIMIT` of them.
    ///
    /// Records that originated from `exclude_origin` are skipped.
    pub async fn since(
        &self,
        sequence: i64,
        exclude_origin: Option<&str>,
    ) -> Result<Vec<EventLogRecord>, PersistenceError> {
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_EVENTS);
        builder.push(" WHERE seq > ").push_bind(sequence);
        if let Some(origin) = exclude_origin {
            builder.push(" AND origin != ").push_bind(origin.to_string());
        }
        builder.push(" ORDER BY seq ASC LIMIT ").push_bind(QUERY_LIMIT);

        let rows: Vec<EventRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(EventLogRecord::try_from).collect()
    }

    /// Highest sequence number written so far.
    pub async fn latest_sequence(&self) -> Result<Option<i64>, PersistenceError> {
        let (latest,): (Option<i64>,) = sqlx::query_as("SELECT MAX(seq) FROM sync_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(latest)
    }

    /// Closes the underlying pool; later appends fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
