use super::{
    validate_session_id, CommitReport, DroppedVariable, Namespace, NamespaceDelta,
    RetentionPolicy, SessionSummary, StoreError, SweepReport, VariableDescriptor,
};
use crate::codec::SerializationGuard;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub variable_byte_cap: usize,
    pub session_byte_cap: u64,
    pub retention: RetentionPolicy,
    /// Minimum gap between lazy sweeps; `None` leaves sweeping to the caller.
    pub sweep_interval: Option<Duration>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            variable_byte_cap: 4 * 1024 * 1024,
            session_byte_cap: 32 * 1024 * 1024,
            retention: RetentionPolicy::default(),
            sweep_interval: Some(Duration::from_secs(600)),
        }
    }
}

/// Durable session state backed by SQLite.
///
/// Every mutation of one session runs in a single immediate transaction, so
/// a reader never sees half a commit. Callers that need read-execute-commit
/// atomicity take [`SessionStore::session_lock`] around the whole sequence.
pub struct SessionStore {
    conn: Mutex<Connection>,
    guard: SerializationGuard,
    session_byte_cap: u64,
    retention: RetentionPolicy,
    sweep_interval: Option<Duration>,
    last_sweep: Mutex<Option<Instant>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(db_path: &str, options: StoreOptions) -> Result<Self, StoreError> {
        // Expand ~ to home directory
        let expanded = if db_path.starts_with('~') {
            if let Some(home) = dirs::home_dir() {
                db_path.replacen('~', &home.display().to_string(), 1)
            } else {
                db_path.to_string()
            }
        } else {
            db_path.to_string()
        };

        // Create parent directory if needed
        if let Some(parent) = std::path::Path::new(&expanded).parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(&expanded)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        debug!(path = %expanded, "session store opened");
        Self::with_connection(conn, options)
    }

    /// Create an in-memory store (for testing and one-shot runs).
    pub fn in_memory(options: StoreOptions) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, options)
    }

    fn with_connection(conn: Connection, options: StoreOptions) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
            guard: SerializationGuard::new(options.variable_byte_cap),
            session_byte_cap: options.session_byte_cap,
            retention: options.retention,
            sweep_interval: options.sweep_interval,
            last_sweep: Mutex::new(None),
            locks: Mutex::new(HashMap::new()),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                last_active_at TEXT NOT NULL,
                execution_count INTEGER NOT NULL DEFAULT 0,
                total_bytes INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS variables (
                session_id TEXT NOT NULL,
                name TEXT NOT NULL,
                type_tag TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                data BLOB NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (session_id, name),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_last_active
                ON sessions(last_active_at);",
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn guard(&self) -> &SerializationGuard {
        &self.guard
    }

    pub fn session_byte_cap(&self) -> u64 {
        self.session_byte_cap
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// The mutex serializing executions against one session id. Entries
    /// nobody holds are pruned as new ones are handed out.
    pub fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(session_id) {
            return lock.clone();
        }
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(session_id.to_string(), lock.clone());
        lock
    }

    /// Register a session ahead of its first execution. Without an id a
    /// fresh one is generated.
    pub fn create_session(&self, session_id: Option<&str>) -> Result<String, StoreError> {
        let id = match session_id {
            Some(id) => {
                validate_session_id(id)?;
                id.to_string()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        let now = timestamp(Utc::now());
        self.conn().execute(
            "INSERT INTO sessions (id, created_at, last_active_at) VALUES (?1, ?2, ?2)
             ON CONFLICT(id) DO NOTHING",
            params![id, now],
        )?;
        Ok(id)
    }

    pub fn session_info(&self, session_id: &str) -> Result<Option<SessionSummary>, StoreError> {
        self.maybe_sweep();
        let conn = self.conn();
        let summary = conn
            .query_row(
                &format!("{} WHERE s.id = ?1", SUMMARY_SELECT),
                params![session_id],
                summary_from_row,
            )
            .optional()?;
        Ok(summary)
    }

    /// Materialize the persisted namespace. An unknown session yields an
    /// empty namespace; entries that fail validation are skipped.
    pub fn get_namespace(&self, session_id: &str) -> Result<Namespace, StoreError> {
        self.maybe_sweep();
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT name, data FROM variables WHERE session_id = ?1 ORDER BY name")?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut namespace = Namespace::new();
        for row in rows {
            let (name, data) = row?;
            match self.guard.deserialize(&data) {
                Ok(value) => {
                    namespace.insert(name, value);
                }
                Err(e) => warn!(session = session_id, variable = %name, "skipping stored variable: {}", e),
            }
        }
        Ok(namespace)
    }

    /// Apply one execution's delta atomically.
    ///
    /// Values the guard refuses are left out and reported; a stale stored
    /// value under the same name is removed with them. A replacing delta
    /// discards the old variables in the same transaction. If the result
    /// would exceed the session cap nothing is written.
    pub fn commit(&self, session_id: &str, delta: &NamespaceDelta) -> Result<CommitReport, StoreError> {
        self.commit_at(session_id, delta, Utc::now())
    }

    pub(crate) fn commit_at(
        &self,
        session_id: &str,
        delta: &NamespaceDelta,
        now: DateTime<Utc>,
    ) -> Result<CommitReport, StoreError> {
        validate_session_id(session_id)?;

        let mut report = CommitReport::default();
        let mut encoded = Vec::with_capacity(delta.changed.len());
        for (name, value) in &delta.changed {
            match self.guard.serialize(value) {
                Ok(enc) => encoded.push((name, enc)),
                Err(error) => {
                    debug!(session = session_id, variable = %name, "not persisted: {}", error);
                    report.dropped.push(DroppedVariable {
                        name: name.clone(),
                        error,
                    });
                }
            }
        }

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = timestamp(now);

        let existing: HashMap<String, u64> = {
            let mut stmt = tx.prepare("SELECT name, size_bytes FROM variables WHERE session_id = ?1")?;
            let rows = stmt.query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        let mut to_remove: BTreeSet<&str> = if delta.replace {
            existing.keys().map(String::as_str).collect()
        } else {
            delta
                .removed
                .iter()
                .map(String::as_str)
                .filter(|name| existing.contains_key(*name))
                .collect()
        };
        to_remove.extend(
            report
                .dropped
                .iter()
                .map(|d| d.name.as_str())
                .filter(|name| existing.contains_key(*name)),
        );

        let mut projected = existing.clone();
        for name in &to_remove {
            projected.remove(*name);
        }
        for (name, enc) in &encoded {
            projected.insert((*name).clone(), enc.size_bytes() as u64);
        }
        let attempted: u64 = projected.values().sum();
        if attempted > self.session_byte_cap {
            return Err(StoreError::SessionOverflow {
                session_id: session_id.to_string(),
                attempted,
                cap: self.session_byte_cap,
            });
        }

        tx.execute(
            "INSERT INTO sessions (id, created_at, last_active_at) VALUES (?1, ?2, ?2)
             ON CONFLICT(id) DO NOTHING",
            params![session_id, now],
        )?;
        for name in &to_remove {
            tx.execute(
                "DELETE FROM variables WHERE session_id = ?1 AND name = ?2",
                params![session_id, name],
            )?;
        }
        for (name, enc) in &encoded {
            tx.execute(
                "INSERT INTO variables (session_id, name, type_tag, size_bytes, data, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id, name) DO UPDATE SET
                    type_tag = excluded.type_tag,
                    size_bytes = excluded.size_bytes,
                    data = excluded.data,
                    updated_at = excluded.updated_at",
                params![session_id, name, enc.type_tag, enc.size_bytes() as i64, enc.bytes, now],
            )?;
        }
        tx.execute(
            "UPDATE sessions SET
                total_bytes = (SELECT COALESCE(SUM(size_bytes), 0) FROM variables WHERE session_id = ?1),
                last_active_at = ?2,
                execution_count = execution_count + 1,
                active = 1
             WHERE id = ?1",
            params![session_id, now],
        )?;
        tx.commit()?;

        report.persisted = encoded.iter().map(|(name, _)| (*name).clone()).collect();
        report.removed = to_remove
            .iter()
            .filter(|name| !delta.changed.contains_key(**name))
            .map(|name| name.to_string())
            .collect();
        report.total_bytes = attempted;
        debug!(
            session = session_id,
            persisted = report.persisted.len(),
            removed = report.removed.len(),
            dropped = report.dropped.len(),
            total_bytes = report.total_bytes,
            "commit"
        );
        Ok(report)
    }

    /// Descriptors of a session's variables; `SessionNotFound` when the id
    /// was never seen or has been deleted.
    pub fn list_variables(&self, session_id: &str) -> Result<Vec<VariableDescriptor>, StoreError> {
        self.maybe_sweep();
        let conn = self.conn();
        let known = conn
            .query_row("SELECT 1 FROM sessions WHERE id = ?1", params![session_id], |_| Ok(()))
            .optional()?
            .is_some();
        if !known {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        let mut stmt = conn.prepare(
            "SELECT name, type_tag, size_bytes FROM variables WHERE session_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(VariableDescriptor {
                name: row.get(0)?,
                type_tag: row.get(1)?,
                size_bytes: row.get::<_, i64>(2)? as u64,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Sessions ordered most recently active first.
    pub fn list_sessions(&self, include_inactive: bool) -> Result<Vec<SessionSummary>, StoreError> {
        self.maybe_sweep();
        let conn = self.conn();
        let sql = if include_inactive {
            format!("{} ORDER BY s.last_active_at DESC", SUMMARY_SELECT)
        } else {
            format!("{} WHERE s.active = 1 ORDER BY s.last_active_at DESC", SUMMARY_SELECT)
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], summary_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Drop every variable but keep the session record.
    pub fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = timestamp(Utc::now());
        let updated = tx.execute(
            "UPDATE sessions SET total_bytes = 0, last_active_at = ?2, active = 1 WHERE id = ?1",
            params![session_id, now],
        )?;
        if updated == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        tx.execute("DELETE FROM variables WHERE session_id = ?1", params![session_id])?;
        tx.commit()?;
        info!(session = session_id, "session cleared");
        Ok(())
    }

    /// Remove the session record and everything under it.
    pub fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !delete_session_rows(&tx, session_id)? {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        tx.commit()?;
        info!(session = session_id, "session deleted");
        Ok(())
    }

    /// Mark idle sessions inactive and delete expired ones. Sessions with
    /// an execution in flight are skipped and picked up by a later sweep.
    pub fn sweep(&self) -> Result<SweepReport, StoreError> {
        self.sweep_at(Utc::now())
    }

    pub(crate) fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let inactive_cutoff = timestamp(now - to_chrono(self.retention.inactive_after()));
        let delete_cutoff = timestamp(now - to_chrono(self.retention.delete_after()));
        let mut report = SweepReport::default();

        let expired: Vec<String> = {
            let conn = self.conn();
            let mut stmt = conn.prepare("SELECT id FROM sessions WHERE last_active_at < ?1")?;
            let rows = stmt.query_map(params![delete_cutoff], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };

        for id in expired {
            let lock = self.session_lock(&id);
            let Ok(_held) = lock.try_lock() else {
                report.skipped_busy += 1;
                continue;
            };
            let mut conn = self.conn();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            // Re-check under the transaction: the session may have been used
            // since the candidate list was read.
            let still_expired = tx
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1 AND last_active_at < ?2",
                    params![id, delete_cutoff],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if still_expired && delete_session_rows(&tx, &id)? {
                report.deleted.push(id);
            }
            tx.commit()?;
        }

        report.marked_inactive = self.conn().execute(
            "UPDATE sessions SET active = 0 WHERE active = 1 AND last_active_at < ?1",
            params![inactive_cutoff],
        )?;

        if report.marked_inactive > 0 || !report.deleted.is_empty() {
            info!(
                marked_inactive = report.marked_inactive,
                deleted = report.deleted.len(),
                skipped_busy = report.skipped_busy,
                "retention sweep"
            );
        }
        Ok(report)
    }

    fn maybe_sweep(&self) {
        let Some(interval) = self.sweep_interval else {
            return;
        };
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*last, Some(at) if at.elapsed() < interval) {
                return;
            }
            *last = Some(Instant::now());
        }
        if let Err(e) = self.sweep() {
            warn!("retention sweep failed: {}", e);
        }
    }
}

const SUMMARY_SELECT: &str = "SELECT s.id, s.created_at, s.last_active_at, s.execution_count,
        s.total_bytes, s.active,
        (SELECT COUNT(*) FROM variables v WHERE v.session_id = s.id)
     FROM sessions s";

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SessionSummary> {
    Ok(SessionSummary {
        id: row.get(0)?,
        created_at: parse_timestamp(row, 1)?,
        last_active_at: parse_timestamp(row, 2)?,
        execution_count: row.get::<_, i64>(3)? as u64,
        total_bytes: row.get::<_, i64>(4)? as u64,
        active: row.get(5)?,
        variable_count: row.get::<_, i64>(6)? as usize,
    })
}

fn delete_session_rows(conn: &Connection, session_id: &str) -> rusqlite::Result<bool> {
    conn.execute("DELETE FROM variables WHERE session_id = ?1", params![session_id])?;
    let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
    Ok(deleted > 0)
}

// Fixed-width UTC timestamps compare correctly as text.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
