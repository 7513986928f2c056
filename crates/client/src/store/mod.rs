// Durable storage for queued mutations, keyed by id.
//
// `QueueStore` either wraps a live sqlite database or runs in a degraded
// mode where every operation is a no-op / empty result. Degraded mode is
// how "storage unavailable" turns into "no offline support" instead of a
// crash: callers attempt each mutation once, synchronously, with no retry.

pub mod queue_db;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use tracing::warn;
use uuid::Uuid;

use folio_common::types::{HttpMethod, OperationKind};

use crate::mutation::{MutationStatus, QueuedMutation};

pub use queue_db::QueueDb;

const SELECT_COLUMNS: &str = "id, operation_type, path, method, body, idempotency_key, \
     created_at, retry_count, status, next_retry_at, last_error";

/// Storage for one actor/session's queue. Exactly one logical queue exists
/// per session; there is no process-wide singleton.
#[derive(Debug)]
pub struct QueueStore {
    inner: Option<QueueDb>,
}

impl QueueStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { inner: Some(QueueDb::open(path)?) })
    }

    /// Degraded mode: no durability, every operation no-ops.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Open the backing database, downgrading to degraded mode (rather
    /// than failing) when the host environment has no usable storage.
    pub fn open_or_disabled(path: impl AsRef<Path>) -> Self {
        match Self::open(path.as_ref()) {
            Ok(store) => store,
            Err(error) => {
                warn!(
                    path = %path.as_ref().display(),
                    %error,
                    "queue storage unavailable, mutations will be attempted once without retry"
                );
                Self::disabled()
            }
        }
    }

    pub fn is_durable(&self) -> bool {
        self.inner.is_some()
    }

    /// Insert or overwrite an entry by id. Single statement, so concurrent
    /// readers never observe a partial record.
    pub fn put(&self, entry: &QueuedMutation) -> Result<()> {
        let Some(db) = &self.inner else {
            return Ok(());
        };

        let body = serde_json::to_string(&entry.body)
            .context("failed to serialize mutation body for storage")?;

        db.connection()
            .execute(
                "INSERT INTO queued_mutations \
                 (id, operation_type, path, method, body, idempotency_key, created_at, \
                  retry_count, status, next_retry_at, last_error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(id) DO UPDATE SET \
                 operation_type = excluded.operation_type, path = excluded.path, \
                 method = excluded.method, body = excluded.body, \
                 idempotency_key = excluded.idempotency_key, created_at = excluded.created_at, \
                 retry_count = excluded.retry_count, status = excluded.status, \
                 next_retry_at = excluded.next_retry_at, last_error = excluded.last_error",
                params![
                    entry.id.to_string(),
                    entry.operation_type.as_str(),
                    entry.path,
                    entry.method.as_str(),
                    body,
                    entry.idempotency_key.to_string(),
                    timestamp_str(entry.created_at),
                    entry.retry_count,
                    entry.status.as_str(),
                    entry.next_retry_at.map(timestamp_str),
                    entry.last_error,
                ],
            )
            .context("failed to upsert queued mutation")?;

        Ok(())
    }

    /// All entries ordered by `created_at` ascending (FIFO replay order).
    pub fn get_all(&self) -> Result<Vec<QueuedMutation>> {
        let Some(db) = &self.inner else {
            return Ok(Vec::new());
        };

        let mut stmt = db
            .connection()
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM queued_mutations ORDER BY created_at ASC"
            ))
            .context("failed to prepare get_all query")?;

        let rows = stmt.query_map([], row_to_mutation).context("failed to query queue entries")?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect queue entries")
    }

    /// Fetch one entry by id.
    pub fn get(&self, id: Uuid) -> Result<Option<QueuedMutation>> {
        let Some(db) = &self.inner else {
            return Ok(None);
        };

        let mut stmt = db
            .connection()
            .prepare(&format!("SELECT {SELECT_COLUMNS} FROM queued_mutations WHERE id = ?1"))
            .context("failed to prepare get query")?;

        let mut rows = stmt
            .query_map(params![id.to_string()], row_to_mutation)
            .context("failed to query queue entry")?;
        rows.next().transpose().context("failed to read queue entry")
    }

    /// Prior entries for a merge target, oldest first.
    pub fn find_by_target(
        &self,
        kind: OperationKind,
        path: &str,
        method: HttpMethod,
    ) -> Result<Vec<QueuedMutation>> {
        let Some(db) = &self.inner else {
            return Ok(Vec::new());
        };

        let mut stmt = db
            .connection()
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM queued_mutations \
                 WHERE operation_type = ?1 AND path = ?2 AND method = ?3 \
                 ORDER BY created_at ASC"
            ))
            .context("failed to prepare find_by_target query")?;

        let rows = stmt
            .query_map(params![kind.as_str(), path, method.as_str()], row_to_mutation)
            .context("failed to query merge targets")?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect merge targets")
    }

    /// Remove a batch of entries atomically (one DELETE statement).
    pub fn delete_many(&self, ids: &[Uuid]) -> Result<usize> {
        let Some(db) = &self.inner else {
            return Ok(0);
        };
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders =
            (1..=ids.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
        let sql = format!("DELETE FROM queued_mutations WHERE id IN ({placeholders})");
        let id_strings: Vec<String> = ids.iter().map(Uuid::to_string).collect();

        let deleted = db
            .connection()
            .execute(&sql, rusqlite::params_from_iter(id_strings.iter()))
            .context("failed to delete queued mutations")?;
        Ok(deleted)
    }

    /// Queue depth.
    pub fn count(&self) -> Result<i64> {
        let Some(db) = &self.inner else {
            return Ok(0);
        };

        db.connection()
            .query_row("SELECT COUNT(*) FROM queued_mutations", [], |row| row.get(0))
            .context("failed to count queued mutations")
    }
}

/// RFC 3339 with fixed-width nanoseconds, so lexicographic order in sqlite
/// matches chronological order and the full timestamp resolution survives
/// a round trip.
fn timestamp_str(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn row_to_mutation(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedMutation> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let method_str: String = row.get(3)?;
    let body_str: String = row.get(4)?;
    let key_str: String = row.get(5)?;
    let created_str: String = row.get(6)?;
    let status_str: String = row.get(8)?;
    let next_retry_str: Option<String> = row.get(9)?;

    Ok(QueuedMutation {
        id: parse_column(0, &id_str, |s| Uuid::parse_str(s).ok())?,
        operation_type: parse_column(1, &kind_str, OperationKind::parse)?,
        path: row.get(2)?,
        method: parse_column(3, &method_str, HttpMethod::parse)?,
        body: parse_column(4, &body_str, |s| serde_json::from_str(s).ok())?,
        idempotency_key: parse_column(5, &key_str, |s| Uuid::parse_str(s).ok())?,
        created_at: parse_column(6, &created_str, |s| {
            s.parse::<DateTime<Utc>>().ok()
        })?,
        retry_count: row.get(7)?,
        status: parse_column(8, &status_str, MutationStatus::parse)?,
        next_retry_at: next_retry_str.and_then(|s| s.parse::<DateTime<Utc>>().ok()),
        last_error: row.get(10)?,
    })
}

fn parse_column<T>(
    index: usize,
    raw: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::other(format!("unparseable column value `{raw}`"))),
        )
    })
}
