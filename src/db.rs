use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

/// Upper bound on rows written per statement group so a single bulk write never
/// exceeds SQLite's bound-parameter ceiling.
pub const SQLITE_BATCH_LIMIT: usize = 200;

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS publish_plans (
        id TEXT PRIMARY KEY,
        workbook_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        connector_account_id TEXT,
        branch_name TEXT NOT NULL,
        status TEXT NOT NULL,
        phases_json TEXT NOT NULL,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS publish_plan_entries (
        id TEXT PRIMARY KEY,
        plan_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        file_path TEXT NOT NULL,
        phase TEXT NOT NULL,
        operation_json TEXT NOT NULL,
        raw INTEGER NOT NULL DEFAULT 0,
        remote_record_id TEXT,
        data_folder_id TEXT,
        status TEXT NOT NULL,
        error TEXT
    );
    CREATE TABLE IF NOT EXISTS file_index (
        workbook_id TEXT NOT NULL,
        folder_path TEXT NOT NULL,
        filename TEXT NOT NULL,
        record_id TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        PRIMARY KEY (workbook_id, folder_path, record_id)
    );
    CREATE TABLE IF NOT EXISTS file_references (
        workbook_id TEXT NOT NULL,
        branch TEXT NOT NULL,
        source_file_path TEXT NOT NULL,
        target_folder_path TEXT NOT NULL,
        target_file_name TEXT,
        target_file_record_id TEXT
    );
    CREATE TABLE IF NOT EXISTS data_folders (
        id TEXT PRIMARY KEY,
        workbook_id TEXT NOT NULL,
        name TEXT NOT NULL,
        path TEXT NOT NULL,
        connector_account_id TEXT,
        schema_json TEXT NOT NULL,
        id_column_remote_id TEXT
    );
    CREATE TABLE IF NOT EXISTS connector_accounts (
        id TEXT PRIMARY KEY,
        service TEXT NOT NULL,
        base_url TEXT NOT NULL,
        api_key TEXT NOT NULL,
        create_batch_size INTEGER NOT NULL,
        update_batch_size INTEGER NOT NULL,
        delete_batch_size INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_plans_workbook ON publish_plans(workbook_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_entries_plan_phase ON publish_plan_entries(plan_id, phase, status, seq);
    CREATE INDEX IF NOT EXISTS idx_entries_plan_path ON publish_plan_entries(plan_id, file_path);
    CREATE INDEX IF NOT EXISTS idx_file_index_filename ON file_index(workbook_id, folder_path, filename);
    CREATE INDEX IF NOT EXISTS idx_file_index_seen ON file_index(last_seen_at);
    CREATE INDEX IF NOT EXISTS idx_refs_source ON file_references(workbook_id, branch, source_file_path);
    CREATE INDEX IF NOT EXISTS idx_refs_target_file ON file_references(workbook_id, target_folder_path, target_file_name);
    CREATE INDEX IF NOT EXISTS idx_refs_target_record ON file_references(workbook_id, target_file_record_id);
    CREATE INDEX IF NOT EXISTS idx_folders_workbook_path ON data_folders(workbook_id, path);
";

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed creating database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening database {}", path.display()))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed opening in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed applying database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))?;
        f(&mut guard)
    }
}

/// `?1,?2,...,?n` for an `IN (...)` clause starting after `offset` bound parameters.
pub fn placeholders(offset: usize, count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{}", offset + i))
        .collect::<Vec<_>>()
        .join(",")
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub fn encode_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|v| v.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
