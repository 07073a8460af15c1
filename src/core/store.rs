//! SQLite persistence for call records.
//!
//! A single connection behind a mutex is the only writer. Every access
//! goes through [`CallStore::with_conn`], which retries `SQLITE_BUSY` /
//! `SQLITE_LOCKED` with the configured policy before surfacing the error.
//!
//! The schema is created by an ordered list of migrations tracked in the
//! `schema_migrations` table; each one runs at most once, inside its own
//! transaction.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{
    CallRecord, CallStatus, Coordinates, Enrichment, LocationFields, ProcessOptions,
};

use super::retry::{retry_blocking, RetryPolicy};

/// Errors from the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration v{version} ({name}) failed: {source}")]
    Migration {
        version: u32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database schema v{found} is newer than supported v{supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("Call not found: {0}")]
    NotFound(String),

    #[error("Invalid duplicate reference {duplicate} -> {original}: {reason}")]
    InvalidDuplicate {
        duplicate: String,
        original: String,
        reason: &'static str,
    },

    #[error("Database connection lock poisoned")]
    Poisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Write-lock contention that a retry may clear
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

/// Migrations only ever add; never edit one that has shipped.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_calls",
        sql: r#"
            CREATE TABLE IF NOT EXISTS calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL UNIQUE,
                source_path TEXT NOT NULL,
                status TEXT NOT NULL,
                last_error TEXT,
                raw_transcript TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_calls_status_updated ON calls(status, updated_at);
        "#,
    },
    Migration {
        version: 2,
        name: "content_dedup",
        sql: r#"
            ALTER TABLE calls ADD COLUMN size_bytes INTEGER;
            ALTER TABLE calls ADD COLUMN duration_seconds REAL;
            ALTER TABLE calls ADD COLUMN content_hash TEXT;
            ALTER TABLE calls ADD COLUMN duplicate_of TEXT;
            CREATE INDEX IF NOT EXISTS idx_calls_hash_status ON calls(content_hash, status);
        "#,
    },
    Migration {
        version: 3,
        name: "enrichment",
        sql: r#"
            ALTER TABLE calls ADD COLUMN clean_transcript TEXT;
            ALTER TABLE calls ADD COLUMN translation TEXT;
            ALTER TABLE calls ADD COLUMN normalized_transcript TEXT;
            ALTER TABLE calls ADD COLUMN diarized_json TEXT;
            ALTER TABLE calls ADD COLUMN embedding_json TEXT;
            ALTER TABLE calls ADD COLUMN call_type TEXT;
            ALTER TABLE calls ADD COLUMN recognized_towns_json TEXT;
            ALTER TABLE calls ADD COLUMN requested_model TEXT;
            ALTER TABLE calls ADD COLUMN requested_mode TEXT;
            ALTER TABLE calls ADD COLUMN requested_format TEXT;
            ALTER TABLE calls ADD COLUMN actual_model_used TEXT;
            ALTER TABLE calls ADD COLUMN call_timestamp TEXT;
            ALTER TABLE calls ADD COLUMN agency_town TEXT;
        "#,
    },
    Migration {
        version: 4,
        name: "location",
        sql: r#"
            ALTER TABLE calls ADD COLUMN latitude REAL;
            ALTER TABLE calls ADD COLUMN longitude REAL;
            ALTER TABLE calls ADD COLUMN location_label TEXT;
            ALTER TABLE calls ADD COLUMN location_source TEXT;
            CREATE INDEX IF NOT EXISTS idx_calls_town_time ON calls(agency_town, status, call_timestamp);
        "#,
    },
];

pub const SCHEMA_VERSION: u32 = 4;

const CALL_COLUMNS: &str = "filename, source_path, status, last_error, size_bytes, duration_seconds, \
    content_hash, duplicate_of, agency_town, raw_transcript, clean_transcript, translation, \
    normalized_transcript, diarized_json, embedding_json, call_type, recognized_towns_json, \
    actual_model_used, latitude, longitude, location_label, location_source, requested_model, \
    requested_mode, requested_format, call_timestamp, created_at, updated_at";

/// Fields written when a call is (re)queued
#[derive(Debug, Clone)]
pub struct QueuedCall<'a> {
    pub filename: &'a str,
    pub source_path: &'a str,
    pub call_timestamp: Option<DateTime<Utc>>,
    pub agency_town: Option<&'a str>,
    pub requested_model: &'a str,
    pub options: &'a ProcessOptions,
}

/// Most frequent historical location for a town
#[derive(Debug, Clone, PartialEq)]
pub struct Hotspot {
    pub coordinates: Coordinates,
    pub label: Option<String>,
    pub occurrences: u32,
}

/// Record counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub done: u64,
    pub error: u64,
}

/// Durable store of call records
#[derive(Clone)]
pub struct CallStore {
    conn: Arc<Mutex<Connection>>,
    busy_retry: RetryPolicy,
}

impl CallStore {
    /// Open (creating if needed) the database at `db_path` and migrate it
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;

        // WAL lets dashboards read while the pipeline writes
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_millis(250))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            busy_retry: RetryPolicy::fixed(10, Duration::from_millis(50)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Replace the busy/locked retry policy
    pub fn with_busy_retry(mut self, policy: RetryPolicy) -> Self {
        self.busy_retry = policy;
        self
    }

    /// Run `op` against the connection, retrying busy/locked failures.
    ///
    /// The mutex is released between attempts so a backoff never blocks
    /// other callers.
    fn with_conn<T>(
        &self,
        mut op: impl FnMut(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        retry_blocking(&self.busy_retry, StoreError::is_busy, |attempt| {
            if attempt > 1 {
                debug!(attempt, "retrying busy database operation");
            }
            let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
            op(&mut conn)
        })
        .map_err(|e| {
            if e.is_busy() {
                warn!(error = %e, "database still busy after retries");
            }
            e
        })
    }

    // ------------------------------------------------------------------
    // Migrations
    // ------------------------------------------------------------------

    /// Apply pending migrations. Returns how many ran.
    pub fn migrate(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    applied_at TEXT NOT NULL
                );",
            )?;

            let current = current_version(conn)?;
            if current > SCHEMA_VERSION {
                return Err(StoreError::SchemaTooNew {
                    found: current,
                    supported: SCHEMA_VERSION,
                });
            }

            let mut applied = 0;
            for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
                info!(version = migration.version, name = migration.name, "Applying migration");

                let to_err = |source| StoreError::Migration {
                    version: migration.version,
                    name: migration.name,
                    source,
                };

                let tx = conn.transaction().map_err(to_err)?;
                tx.execute_batch(migration.sql).map_err(to_err)?;
                tx.execute(
                    "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                    params![migration.version, migration.name, timestamp(Utc::now())],
                )
                .map_err(to_err)?;
                tx.commit().map_err(to_err)?;
                applied += 1;
            }

            Ok(applied)
        })
    }

    /// Highest applied migration version
    pub fn schema_version(&self) -> Result<u32, StoreError> {
        self.with_conn(|conn| current_version(conn))
    }

    /// Applied migration versions, ascending
    pub fn applied_migrations(&self) -> Result<Vec<u32>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
            let versions = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<u32>, _>>()?;
            Ok(versions)
        })
    }

    /// Column names of the calls table, in declaration order
    pub fn call_columns(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('calls') ORDER BY cid")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get(&self, filename: &str) -> Result<Option<CallRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {CALL_COLUMNS} FROM calls WHERE filename = ?1");
            Ok(conn
                .query_row(&sql, params![filename], row_to_record)
                .optional()?)
        })
    }

    /// Oldest completed, non-duplicate record with this content hash
    pub fn find_done_by_hash(
        &self,
        content_hash: &str,
        exclude_filename: &str,
    ) -> Result<Option<CallRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CALL_COLUMNS} FROM calls
                 WHERE content_hash = ?1 AND status = 'done' AND filename != ?2
                 ORDER BY (duplicate_of IS NOT NULL AND duplicate_of != ''), created_at ASC
                 LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![content_hash, exclude_filename], row_to_record)
                .optional()?)
        })
    }

    /// Most frequent stored point among completed calls for `town` since `since`.
    ///
    /// Points that were themselves hotspot guesses are ignored so the
    /// fallback cannot reinforce itself.
    pub fn location_hotspot(
        &self,
        town: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Hotspot>, StoreError> {
        self.with_conn(|conn| {
            let hotspot = conn
                .query_row(
                    "SELECT ROUND(latitude, 4) AS lat, ROUND(longitude, 4) AS lon,
                            MAX(location_label) AS label, COUNT(*) AS hits
                     FROM calls
                     WHERE status = 'done'
                       AND agency_town = ?1 COLLATE NOCASE
                       AND latitude IS NOT NULL AND longitude IS NOT NULL
                       AND COALESCE(location_source, '') != 'hotspot'
                       AND COALESCE(call_timestamp, created_at) >= ?2
                     GROUP BY lat, lon
                     ORDER BY hits DESC, MAX(updated_at) DESC
                     LIMIT 1",
                    params![town, timestamp(since)],
                    |row| {
                        Ok(Hotspot {
                            coordinates: Coordinates::new(row.get("lat")?, row.get("lon")?),
                            label: row.get("label")?,
                            occurrences: row.get("hits")?,
                        })
                    },
                )
                .optional()?;
            Ok(hotspot)
        })
    }

    /// Records stuck in `status` since before `cutoff`
    pub fn stale_in_status(
        &self,
        status: CallStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CALL_COLUMNS} FROM calls
                 WHERE status = ?1 AND updated_at < ?2
                 ORDER BY updated_at ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params![status, timestamp(cutoff)], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    /// Abandoned `processing` rows (e.g. left behind by a crash)
    pub fn stale_processing(&self, older_than: Duration) -> Result<Vec<CallRecord>, StoreError> {
        self.stale_in_status(CallStatus::Processing, cutoff(older_than))
    }

    /// `queued` rows nobody picked up (e.g. dropped at admission)
    pub fn stale_queued(&self, older_than: Duration) -> Result<Vec<CallRecord>, StoreError> {
        self.stale_in_status(CallStatus::Queued, cutoff(older_than))
    }

    pub fn list_recent(
        &self,
        status: Option<CallStatus>,
        limit: usize,
    ) -> Result<Vec<CallRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CALL_COLUMNS} FROM calls
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY updated_at DESC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params![status, limit as i64], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    pub fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM calls GROUP BY status")?;
            let mut counts = StatusCounts::default();
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, CallStatus>(0)?, row.get::<_, u64>(1)?))
            })?;
            for row in rows {
                let (status, n) = row?;
                match status {
                    CallStatus::Queued => counts.queued = n,
                    CallStatus::Processing => counts.processing = n,
                    CallStatus::Done => counts.done = n,
                    CallStatus::Error => counts.error = n,
                }
            }
            Ok(counts)
        })
    }

    // ------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------

    /// Insert or reset a record to `queued`, keeping any known call time
    pub fn upsert_queued(&self, call: &QueuedCall<'_>) -> Result<(), StoreError> {
        let now = timestamp(Utc::now());
        let call_timestamp = call.call_timestamp.map(timestamp);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO calls (filename, source_path, status, agency_town, call_timestamp,
                                    requested_model, requested_mode, requested_format,
                                    created_at, updated_at)
                 VALUES (?1, ?2, 'queued', ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(filename) DO UPDATE SET
                    source_path = excluded.source_path,
                    status = 'queued',
                    last_error = NULL,
                    agency_town = COALESCE(excluded.agency_town, calls.agency_town),
                    call_timestamp = COALESCE(calls.call_timestamp, excluded.call_timestamp),
                    requested_model = excluded.requested_model,
                    requested_mode = excluded.requested_mode,
                    requested_format = excluded.requested_format,
                    updated_at = MAX(calls.updated_at, excluded.updated_at)",
                params![
                    call.filename,
                    call.source_path,
                    call.agency_town,
                    call_timestamp,
                    call.requested_model,
                    call.options.mode.as_str(),
                    call.options.format.as_str(),
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Move a record to `processing` with the currently observed size
    pub fn mark_processing(&self, filename: &str, size_bytes: u64) -> Result<(), StoreError> {
        self.update_one(
            filename,
            "UPDATE calls SET status = 'processing', size_bytes = ?2, last_error = NULL,
                    updated_at = MAX(updated_at, ?3)
             WHERE filename = ?1",
            params![filename, size_bytes as i64, timestamp(Utc::now())],
        )
    }

    /// Record facts about the stable audio file
    pub fn update_audio_facts(
        &self,
        filename: &str,
        size_bytes: u64,
        duration_seconds: Option<f64>,
        content_hash: &str,
    ) -> Result<(), StoreError> {
        self.update_one(
            filename,
            "UPDATE calls SET size_bytes = ?2, duration_seconds = COALESCE(?3, duration_seconds),
                    content_hash = ?4, updated_at = MAX(updated_at, ?5)
             WHERE filename = ?1",
            params![
                filename,
                size_bytes as i64,
                duration_seconds,
                content_hash,
                timestamp(Utc::now())
            ],
        )
    }

    /// Mark `filename` done as a duplicate of `original`, copying its enrichment.
    ///
    /// `original` must be a different, completed record.
    pub fn mark_duplicate(&self, filename: &str, original: &str) -> Result<CallRecord, StoreError> {
        if filename == original {
            return Err(StoreError::InvalidDuplicate {
                duplicate: filename.to_string(),
                original: original.to_string(),
                reason: "a call cannot duplicate itself",
            });
        }

        let now = timestamp(Utc::now());
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let original_status: Option<CallStatus> = tx
                .query_row(
                    "SELECT status FROM calls WHERE filename = ?1",
                    params![original],
                    |row| row.get(0),
                )
                .optional()?;
            if original_status != Some(CallStatus::Done) {
                return Err(StoreError::InvalidDuplicate {
                    duplicate: filename.to_string(),
                    original: original.to_string(),
                    reason: "original is not a completed call",
                });
            }

            let changed = tx.execute(
                "UPDATE calls SET
                    (raw_transcript, clean_transcript, translation, normalized_transcript,
                     diarized_json, embedding_json, call_type, recognized_towns_json,
                     actual_model_used, latitude, longitude, location_label, location_source) =
                    (SELECT raw_transcript, clean_transcript, translation, normalized_transcript,
                            diarized_json, embedding_json, call_type, recognized_towns_json,
                            actual_model_used, latitude, longitude, location_label, location_source
                     FROM calls WHERE filename = ?2),
                    duplicate_of = ?2,
                    status = 'done',
                    last_error = NULL,
                    updated_at = MAX(updated_at, ?3)
                 WHERE filename = ?1",
                params![filename, original, now],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(filename.to_string()));
            }

            let sql = format!("SELECT {CALL_COLUMNS} FROM calls WHERE filename = ?1");
            let record = tx.query_row(&sql, params![filename], row_to_record)?;
            tx.commit()?;
            Ok(record)
        })
    }

    /// Write every enrichment and location field and mark the record done.
    ///
    /// One UPDATE statement, so readers never observe a half-enriched
    /// `done` row.
    pub fn finalize_done(
        &self,
        filename: &str,
        enrichment: &Enrichment,
        location: &LocationFields,
    ) -> Result<(), StoreError> {
        let embedding = to_json(&enrichment.embedding);
        let towns = to_json(&Some(&enrichment.recognized_towns));
        let now = timestamp(Utc::now());

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE calls SET
                    status = 'done',
                    last_error = NULL,
                    duplicate_of = NULL,
                    raw_transcript = ?2,
                    clean_transcript = ?3,
                    translation = ?4,
                    normalized_transcript = ?5,
                    diarized_json = ?6,
                    embedding_json = ?7,
                    call_type = ?8,
                    recognized_towns_json = ?9,
                    actual_model_used = ?10,
                    latitude = ?11,
                    longitude = ?12,
                    location_label = ?13,
                    location_source = ?14,
                    updated_at = MAX(updated_at, ?15)
                 WHERE filename = ?1",
                params![
                    filename,
                    enrichment.raw_transcript,
                    enrichment.clean_transcript,
                    enrichment.translation,
                    enrichment.normalized_transcript,
                    enrichment.diarized_json,
                    embedding,
                    enrichment.call_type,
                    towns,
                    enrichment.actual_model_used,
                    location.latitude,
                    location.longitude,
                    location.location_label,
                    location.location_source,
                    now,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(filename.to_string()));
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn mark_error(&self, filename: &str, message: &str) -> Result<(), StoreError> {
        self.update_one(
            filename,
            "UPDATE calls SET status = 'error', last_error = ?2, updated_at = MAX(updated_at, ?3)
             WHERE filename = ?1",
            params![filename, message, timestamp(Utc::now())],
        )
    }

    fn update_one(
        &self,
        filename: &str,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            if conn.execute(sql, params)? == 0 {
                return Err(StoreError::NotFound(filename.to_string()));
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for CallStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStore")
            .field("busy_retry", &self.busy_retry)
            .finish_non_exhaustive()
    }
}

fn current_version(conn: &Connection) -> Result<u32, StoreError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?)
}

fn cutoff(older_than: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(older_than)
        .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Fixed-width RFC 3339 so lexical order matches time order
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json<T: serde::Serialize>(value: &Option<T>) -> Option<String> {
    value.as_ref().and_then(|v| serde_json::to_string(v).ok())
}

fn parse_timestamp(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(row, column, e))
    })
    .transpose()
}

fn parse_json<T: DeserializeOwned>(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(row, column, e)))
        .transpose()
}

fn conversion_error<E>(row: &Row<'_>, column: &str, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let idx = row.as_ref().column_index(column).unwrap_or_default();
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<CallRecord> {
    let created_at = parse_timestamp(row, "created_at")?.unwrap_or_else(Utc::now);
    let updated_at = parse_timestamp(row, "updated_at")?.unwrap_or(created_at);

    Ok(CallRecord {
        filename: row.get("filename")?,
        source_path: row.get("source_path")?,
        status: row.get("status")?,
        last_error: row.get("last_error")?,
        size_bytes: row.get("size_bytes")?,
        duration_seconds: row.get("duration_seconds")?,
        content_hash: row.get("content_hash")?,
        duplicate_of: row.get("duplicate_of")?,
        agency_town: row.get("agency_town")?,
        enrichment: Enrichment {
            raw_transcript: row.get("raw_transcript")?,
            clean_transcript: row.get("clean_transcript")?,
            translation: row.get("translation")?,
            normalized_transcript: row.get("normalized_transcript")?,
            diarized_json: row.get("diarized_json")?,
            embedding: parse_json(row, "embedding_json")?,
            call_type: row.get("call_type")?,
            recognized_towns: parse_json(row, "recognized_towns_json")?.unwrap_or_default(),
            actual_model_used: row.get("actual_model_used")?,
        },
        location: LocationFields {
            latitude: row.get("latitude")?,
            longitude: row.get("longitude")?,
            location_label: row.get("location_label")?,
            location_source: row.get("location_source")?,
        },
        requested_model: row.get("requested_model")?,
        requested_mode: row.get("requested_mode")?,
        requested_format: row.get("requested_format")?,
        call_timestamp: parse_timestamp(row, "call_timestamp")?,
        created_at,
        updated_at,
    })
}

impl ToSql for CallStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for CallStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(store: &CallStore, filename: &str) {
        let options = ProcessOptions::default();
        store
            .upsert_queued(&QueuedCall {
                filename,
                source_path: &format!("/calls/{filename}"),
                call_timestamp: None,
                agency_town: Some("Newton"),
                requested_model: "gpt-4o-transcribe",
                options: &options,
            })
            .unwrap();
    }

    #[test]
    fn test_fresh_store_is_fully_migrated() {
        let store = CallStore::open_in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        assert_eq!(store.applied_migrations().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(store.migrate().unwrap(), 0);
    }

    #[test]
    fn test_upsert_queued_preserves_call_timestamp() {
        let store = CallStore::open_in_memory().unwrap();
        let options = ProcessOptions::default();
        let first_seen = DateTime::parse_from_rfc3339("2025-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);

        let mut call = QueuedCall {
            filename: "a.mp3",
            source_path: "/calls/a.mp3",
            call_timestamp: Some(first_seen),
            agency_town: None,
            requested_model: "m",
            options: &options,
        };
        store.upsert_queued(&call).unwrap();
        store.mark_error("a.mp3", "boom").unwrap();

        call.call_timestamp = Some(Utc::now());
        store.upsert_queued(&call).unwrap();

        let record = store.get("a.mp3").unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Queued);
        assert_eq!(record.call_timestamp, Some(first_seen));
        assert!(record.last_error.is_none());
    }

    #[test]
    fn test_updated_at_never_moves_backwards() {
        let store = CallStore::open_in_memory().unwrap();
        queued(&store, "a.mp3");
        let before = store.get("a.mp3").unwrap().unwrap().updated_at;

        store.mark_processing("a.mp3", 10).unwrap();
        let after = store.get("a.mp3").unwrap().unwrap().updated_at;
        assert!(after >= before);
    }

    #[test]
    fn test_mark_processing_unknown_file() {
        let store = CallStore::open_in_memory().unwrap();
        let err = store.mark_processing("missing.mp3", 1).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_status_round_trip_and_counts() {
        let store = CallStore::open_in_memory().unwrap();
        queued(&store, "a.mp3");
        queued(&store, "b.mp3");
        store.mark_processing("b.mp3", 5).unwrap();

        let counts = store.status_counts().unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.done, 0);
    }

    #[test]
    fn test_list_recent_filters_by_status() {
        let store = CallStore::open_in_memory().unwrap();
        queued(&store, "a.mp3");
        queued(&store, "b.mp3");
        store.mark_error("a.mp3", "bad").unwrap();

        let errors = store.list_recent(Some(CallStatus::Error), 10).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].filename, "a.mp3");
        assert_eq!(store.list_recent(None, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_busy_error_detection() {
        let busy = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_busy());
        assert!(!StoreError::NotFound("x".into()).is_busy());
    }
}
