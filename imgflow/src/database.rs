//! SQLite database for persistent execution history
//!
//! Backs the [`ExecutionRecorder`] and the keyed stores for workflows and saved sources.
//!
//! # Database Schema
//!
//! 1. **executions** - One row per execution record (counters, status, timestamps)
//! 2. **execution_step_logs** - Ordered step log of each execution (cascade on delete)
//! 3. **workflows** - Workflow definitions keyed by id, stored as JSON
//! 4. **saved_sources** - Source configurations keyed by user label, with their tag set
//! 5. **schema_version** - Database schema version for migrations
//!
//! Timestamps are UTC RFC 3339 with microsecond precision, so comparing the
//! stored strings orders them by time.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use imgflow::database::Database;
//! use imgflow::recorder::ExecutionRecorder;
//!
//! # fn main() -> anyhow::Result<()> {
//! let db = Database::open("/tmp/imgflow/executions.db")?;
//! for record in db.list()? {
//!     println!("{} {} {}", record.id, record.workflow_name, record.status);
//! }
//! let removed = db.prune(chrono::Duration::days(30))?;
//! println!("pruned {removed} records");
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use imgflow_sdk::{
    ExecutionRecord, ExecutionStatus, LogStatus, Parameters, SavedSource, SourceConfig,
    StepLogEntry, Workflow,
};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::recorder::{ExecutionRecorder, RecorderError};

const SCHEMA_VERSION: i32 = 1;

/// Database wrapper for execution persistence
pub struct Database {
    conn: Mutex<Connection>,
}

/// Execution counts, optionally for one workflow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub running: usize,
}

impl Database {
    /// Open (or create) the database at `path` and bring its schema up to date
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent access
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    /// In-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self, RecorderError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RecorderError> {
        self.conn
            .lock()
            .map_err(|_| RecorderError::Task("database lock poisoned".to_string()))
    }

    /// Create all tables and indexes
    pub fn initialize_schema(&self) -> Result<(), RecorderError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,

                -- Workflow info (denormalized for history display)
                workflow_id TEXT NOT NULL,
                workflow_name TEXT NOT NULL,

                -- Source
                source_type TEXT NOT NULL,
                source_parameters TEXT NOT NULL,

                -- Lifecycle
                status TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,

                -- Counters
                total_images INTEGER NOT NULL DEFAULT 0,
                processed_images INTEGER NOT NULL DEFAULT 0,
                success_images INTEGER NOT NULL DEFAULT 0,
                failed_images INTEGER NOT NULL DEFAULT 0,

                output_directory TEXT NOT NULL,
                error_message TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_executions_workflow_id ON executions(workflow_id);
            CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
            CREATE INDEX IF NOT EXISTS idx_executions_start_time ON executions(start_time DESC);

            CREATE TABLE IF NOT EXISTS execution_step_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                step_id TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                message TEXT NOT NULL,
                image TEXT,

                FOREIGN KEY(execution_id) REFERENCES executions(id) ON DELETE CASCADE,
                UNIQUE(execution_id, sequence)
            );

            CREATE INDEX IF NOT EXISTS idx_step_logs_execution_id
            ON execution_step_logs(execution_id, sequence);

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS saved_sources (
                label TEXT PRIMARY KEY,
                source_type TEXT NOT NULL,
                parameters TEXT NOT NULL,
                tags TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;

        Ok(())
    }

    /// Get current schema version
    pub fn schema_version(&self) -> Result<i32, RecorderError> {
        let conn = self.conn()?;
        let version: i32 =
            conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
        Ok(version)
    }

    /// List execution records, newest first, with optional paging and workflow filter
    pub fn list_executions(
        &self,
        limit: Option<usize>,
        offset: usize,
        workflow_id: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>, RecorderError> {
        let conn = self.conn()?;
        // SQLite treats a negative LIMIT as "no limit"
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let offset = offset as i64;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, workflow_id, workflow_name, source_type, source_parameters,
                   status, start_time, end_time, total_images, processed_images,
                   success_images, failed_images, output_directory, error_message
            FROM executions
            WHERE (?1 IS NULL OR workflow_id = ?1)
            ORDER BY start_time DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )?;
        let mut records = stmt
            .query_map(params![workflow_id, limit, offset], map_execution_row)?
            .collect::<Result<Vec<_>, _>>()?;

        for record in &mut records {
            record.step_log = load_step_log(&conn, &record.id)?;
        }

        Ok(records)
    }

    /// Execution counts by status, for one workflow or for all of them
    pub fn stats(&self, workflow_id: Option<&str>) -> Result<ExecutionStats, RecorderError> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0)
            FROM executions
            WHERE (?1 IS NULL OR workflow_id = ?1)
            "#,
            params![workflow_id],
            |row| {
                Ok(ExecutionStats {
                    total: row.get::<_, i64>(0)? as usize,
                    completed: row.get::<_, i64>(1)? as usize,
                    failed: row.get::<_, i64>(2)? as usize,
                    cancelled: row.get::<_, i64>(3)? as usize,
                    running: row.get::<_, i64>(4)? as usize,
                })
            },
        )?;
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    pub fn save_workflow(&self, workflow: &Workflow) -> Result<(), RecorderError> {
        let definition = serde_json::to_string(workflow)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO workflows (id, name, definition, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = excluded.updated_at
            "#,
            params![
                workflow.id,
                workflow.name,
                definition,
                format_ts(&workflow.updated_at)
            ],
        )?;
        Ok(())
    }

    pub fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, RecorderError> {
        let conn = self.conn()?;
        let definition: Option<String> = conn
            .query_row(
                "SELECT definition FROM workflows WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        definition
            .map(|d| serde_json::from_str(&d).map_err(RecorderError::from))
            .transpose()
    }

    /// All stored workflows, sorted by name
    pub fn list_workflows(&self) -> Result<Vec<Workflow>, RecorderError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT definition FROM workflows ORDER BY name ASC, id ASC")?;
        let definitions = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        definitions
            .iter()
            .map(|d| serde_json::from_str(d).map_err(RecorderError::from))
            .collect()
    }

    /// Removes only the definition; execution history keeps its denormalized name
    pub fn delete_workflow(&self, id: &str) -> Result<bool, RecorderError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM workflows WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // ------------------------------------------------------------------
    // Saved sources
    // ------------------------------------------------------------------

    /// Insert or replace the source saved under `source.label`
    pub fn save_source(&self, source: &SavedSource) -> Result<(), RecorderError> {
        let parameters = serde_json::to_string(&source.config.parameters)?;
        let tags = serde_json::to_string(&normalized_tags(&source.tags()))?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO saved_sources (label, source_type, parameters, tags, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                source.label,
                source.config.source_type,
                parameters,
                tags,
                format_ts(&source.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn get_source(&self, label: &str) -> Result<Option<SavedSource>, RecorderError> {
        let conn = self.conn()?;
        let source = conn
            .query_row(
                r#"
                SELECT label, source_type, parameters, created_at
                FROM saved_sources WHERE label = ?1
                "#,
                params![label],
                map_source_row,
            )
            .optional()?;
        Ok(source)
    }

    /// All saved sources, sorted by label
    pub fn list_sources(&self) -> Result<Vec<SavedSource>, RecorderError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT label, source_type, parameters, created_at FROM saved_sources ORDER BY label ASC",
        )?;
        let sources = stmt
            .query_map([], map_source_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    /// Saved source whose tag set equals `tags` (order and case insensitive)
    pub fn find_source_by_tags(&self, tags: &[String]) -> Result<Option<SavedSource>, RecorderError> {
        let wanted = serde_json::to_string(&normalized_tags(tags))?;
        let conn = self.conn()?;
        let source = conn
            .query_row(
                r#"
                SELECT label, source_type, parameters, created_at
                FROM saved_sources WHERE tags = ?1
                ORDER BY label ASC LIMIT 1
                "#,
                params![wanted],
                map_source_row,
            )
            .optional()?;
        Ok(source)
    }

    pub fn delete_source(&self, label: &str) -> Result<bool, RecorderError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM saved_sources WHERE label = ?1", params![label])?;
        Ok(deleted > 0)
    }
}

impl ExecutionRecorder for Database {
    fn save(&self, record: &ExecutionRecord) -> Result<(), RecorderError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let stored: Option<String> = tx
            .query_row(
                "SELECT status FROM executions WHERE id = ?1",
                params![record.id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            None => insert_execution(&tx, record)?,
            Some(status) => {
                let status: ExecutionStatus = status.parse().map_err(RecorderError::Corrupt)?;
                if status.is_terminal() {
                    // Finalized records are immutable
                    return Ok(());
                }
                update_execution(&tx, record)?;
            }
        }
        append_step_log(&tx, record)?;

        tx.commit()?;
        Ok(())
    }

    fn get(&self, id: &Uuid) -> Result<Option<ExecutionRecord>, RecorderError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                r#"
                SELECT id, workflow_id, workflow_name, source_type, source_parameters,
                       status, start_time, end_time, total_images, processed_images,
                       success_images, failed_images, output_directory, error_message
                FROM executions
                WHERE id = ?1
                "#,
                params![id.to_string()],
                map_execution_row,
            )
            .optional()?;

        match record {
            Some(mut record) => {
                record.step_log = load_step_log(&conn, &record.id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<ExecutionRecord>, RecorderError> {
        self.list_executions(None, 0, None)
    }

    fn delete(&self, id: &Uuid) -> Result<bool, RecorderError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM executions WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(deleted > 0)
    }

    fn prune(&self, older_than: chrono::Duration) -> Result<usize, RecorderError> {
        let cutoff = format_ts(&(Utc::now() - older_than));
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM executions WHERE start_time < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}

fn insert_execution(tx: &Transaction, record: &ExecutionRecord) -> Result<(), RecorderError> {
    tx.execute(
        r#"
        INSERT INTO executions (
            id, workflow_id, workflow_name, source_type, source_parameters,
            status, start_time, end_time, total_images, processed_images,
            success_images, failed_images, output_directory, error_message, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
        params![
            record.id.to_string(),
            record.workflow_id,
            record.workflow_name,
            record.source_type,
            serde_json::to_string(&record.source_parameters)?,
            record.status.as_str(),
            format_ts(&record.start_time),
            record.end_time.as_ref().map(format_ts),
            record.total_images as i64,
            record.processed_images as i64,
            record.success_images as i64,
            record.failed_images as i64,
            record.output_directory.to_string_lossy().to_string(),
            record.error_message,
            format_ts(&Utc::now()),
        ],
    )?;
    Ok(())
}

/// Transient fields only: identity and start time are never rewritten
fn update_execution(tx: &Transaction, record: &ExecutionRecord) -> Result<(), RecorderError> {
    tx.execute(
        r#"
        UPDATE executions
        SET status = ?1, end_time = ?2, total_images = ?3, processed_images = ?4,
            success_images = ?5, failed_images = ?6, error_message = ?7, updated_at = ?8
        WHERE id = ?9
        "#,
        params![
            record.status.as_str(),
            record.end_time.as_ref().map(format_ts),
            record.total_images as i64,
            record.processed_images as i64,
            record.success_images as i64,
            record.failed_images as i64,
            record.error_message,
            format_ts(&Utc::now()),
            record.id.to_string(),
        ],
    )?;
    Ok(())
}

/// Step log is append-only; entries already stored are skipped by sequence
fn append_step_log(tx: &Transaction, record: &ExecutionRecord) -> Result<(), RecorderError> {
    let mut stmt = tx.prepare(
        r#"
        INSERT OR IGNORE INTO execution_step_logs
            (execution_id, sequence, step_id, action, status, timestamp, message, image)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )?;

    for (sequence, entry) in record.step_log.iter().enumerate() {
        stmt.execute(params![
            record.id.to_string(),
            sequence as i64,
            entry.step_id,
            entry.action,
            entry.status.as_str(),
            format_ts(&entry.timestamp),
            entry.message,
            entry.image,
        ])?;
    }
    Ok(())
}

fn load_step_log(conn: &Connection, id: &Uuid) -> Result<Vec<StepLogEntry>, RecorderError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT step_id, action, status, timestamp, message, image
        FROM execution_step_logs
        WHERE execution_id = ?1
        ORDER BY sequence ASC
        "#,
    )?;

    let entries = stmt
        .query_map(params![id.to_string()], |row| {
            let status: String = row.get(2)?;
            let timestamp: String = row.get(3)?;
            Ok(StepLogEntry {
                step_id: row.get(0)?,
                action: row.get(1)?,
                status: status
                    .parse::<LogStatus>()
                    .map_err(|e| conversion_error(2, e))?,
                timestamp: parse_ts(3, &timestamp)?,
                message: row.get(4)?,
                image: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

// Helper functions for mapping between database and Rust types

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(RecorderError::Corrupt(message)),
    )
}

fn parse_parameters(idx: usize, value: &str) -> rusqlite::Result<Parameters> {
    serde_json::from_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn normalized_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Map a database row to ExecutionRecord (step log loaded separately)
fn map_execution_row(row: &Row) -> rusqlite::Result<ExecutionRecord> {
    let id_str: String = row.get(0)?;
    let source_parameters: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let start_time: String = row.get(6)?;
    let end_time: Option<String> = row.get(7)?;
    let output_directory: String = row.get(12)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ExecutionRecord {
        id,
        workflow_id: row.get(1)?,
        workflow_name: row.get(2)?,
        source_type: row.get(3)?,
        source_parameters: parse_parameters(4, &source_parameters)?,
        status: status_str
            .parse::<ExecutionStatus>()
            .map_err(|e| conversion_error(5, e))?,
        start_time: parse_ts(6, &start_time)?,
        end_time: end_time.map(|s| parse_ts(7, &s)).transpose()?,
        total_images: row.get::<_, i64>(8)? as u64,
        processed_images: row.get::<_, i64>(9)? as u64,
        success_images: row.get::<_, i64>(10)? as u64,
        failed_images: row.get::<_, i64>(11)? as u64,
        output_directory: PathBuf::from(output_directory),
        error_message: row.get(13)?,
        step_log: Vec::new(),
    })
}

fn map_source_row(row: &Row) -> rusqlite::Result<SavedSource> {
    let parameters: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    Ok(SavedSource {
        label: row.get(0)?,
        config: SourceConfig::new(row.get::<_, String>(1)?, parse_parameters(2, &parameters)?),
        created_at: parse_ts(3, &created_at)?,
    })
}
