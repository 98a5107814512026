//! SQLite storage for prompts, outputs and alerts
//!
//! A single connection guarded by a mutex. Every statement is short, so the
//! async handlers call into it directly.

use crate::models::db::{
    Alert, AlertWithPrompt, Output, Prompt, PromptDetail, PromptWithOutput, Settings,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database connection lock poisoned")]
    LockPoisoned,

    #[error("backup file not found: {0}")]
    BackupNotFound(PathBuf),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS prompts (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    provider TEXT,
    request TEXT NOT NULL,
    type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS outputs (
    id TEXT PRIMARY KEY,
    prompt_id TEXT NOT NULL REFERENCES prompts(id),
    timestamp TEXT NOT NULL,
    output TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    prompt_id TEXT NOT NULL REFERENCES prompts(id),
    output_id TEXT REFERENCES outputs(id),
    code_snippet TEXT,
    trigger_string TEXT,
    trigger_type TEXT NOT NULL,
    trigger_category TEXT,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    id TEXT PRIMARY KEY,
    ip TEXT,
    port INTEGER,
    llm_model TEXT,
    system_prompt TEXT,
    other_settings TEXT
);

CREATE TABLE IF NOT EXISTS instance (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    last_update TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_prompts_timestamp ON prompts(timestamp);
CREATE INDEX IF NOT EXISTS idx_outputs_prompt_id ON outputs(prompt_id);
CREATE INDEX IF NOT EXISTS idx_alerts_prompt_id ON alerts(prompt_id);
";

/// Prompt columns followed by the latest output's columns
const PROMPT_WITH_OUTPUT_SELECT: &str = "
SELECT p.id, p.timestamp, p.provider, p.request, p.type,
       o.id, o.output, o.timestamp
FROM prompts p
LEFT JOIN outputs o ON o.id = (
    SELECT id FROM outputs WHERE prompt_id = p.id ORDER BY timestamp DESC LIMIT 1
)";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and its schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| DbError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        debug!(path = %path.display(), "Opened database");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Id of this CodeGate installation, created on first run
    pub fn init_instance(&self) -> Result<String, DbError> {
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row("SELECT id FROM instance LIMIT 1", [], |row| row.get(0))
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO instance (id, timestamp) VALUES (?1, ?2)",
            params![id, sql_timestamp(&Utc::now())],
        )?;
        info!(instance_id = %id, "Initialized instance");
        Ok(id)
    }

    /// Make sure a session row exists and return its id
    pub fn init_session_if_not_exists(&self) -> Result<String, DbError> {
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row("SELECT id FROM sessions LIMIT 1", [], |row| row.get(0))
            .optional()?;
        if let Some(id) = existing {
            conn.execute(
                "UPDATE sessions SET last_update = ?1 WHERE id = ?2",
                params![sql_timestamp(&Utc::now()), id],
            )?;
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO sessions (id, last_update) VALUES (?1, ?2)",
            params![id, sql_timestamp(&Utc::now())],
        )?;
        debug!(session_id = %id, "Created session");
        Ok(id)
    }

    /// Store a request as it was forwarded upstream
    pub fn record_prompt(
        &self,
        provider: Option<&str>,
        request: &str,
        prompt_type: &str,
    ) -> Result<Prompt, DbError> {
        let prompt = Prompt {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            provider: provider.map(str::to_string),
            request: request.to_string(),
            prompt_type: prompt_type.to_string(),
        };
        self.insert_prompt(&prompt)?;
        Ok(prompt)
    }

    pub fn insert_prompt(&self, prompt: &Prompt) -> Result<(), DbError> {
        self.conn()?.execute(
            "INSERT INTO prompts (id, timestamp, provider, request, type)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                prompt.id,
                sql_timestamp(&prompt.timestamp),
                prompt.provider,
                prompt.request,
                prompt.prompt_type,
            ],
        )?;
        Ok(())
    }

    pub fn record_output(&self, prompt_id: &str, output: &str) -> Result<Output, DbError> {
        let output = Output {
            id: Uuid::new_v4().to_string(),
            prompt_id: prompt_id.to_string(),
            timestamp: Utc::now(),
            output: output.to_string(),
        };
        self.insert_output(&output)?;
        Ok(output)
    }

    pub fn insert_output(&self, output: &Output) -> Result<(), DbError> {
        self.conn()?.execute(
            "INSERT INTO outputs (id, prompt_id, timestamp, output) VALUES (?1, ?2, ?3, ?4)",
            params![
                output.id,
                output.prompt_id,
                sql_timestamp(&output.timestamp),
                output.output
            ],
        )?;
        Ok(())
    }

    pub fn record_alert(&self, alert: &Alert) -> Result<(), DbError> {
        self.conn()?.execute(
            "INSERT INTO alerts (id, prompt_id, output_id, code_snippet, trigger_string,
                                 trigger_type, trigger_category, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                alert.id,
                alert.prompt_id,
                alert.output_id,
                alert.code_snippet,
                alert.trigger_string,
                alert.trigger_type,
                alert.trigger_category,
                sql_timestamp(&alert.timestamp),
            ],
        )?;
        Ok(())
    }

    /// Prompts with their latest output, newest prompt first
    pub fn list_prompts_with_output(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PromptWithOutput>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{PROMPT_WITH_OUTPUT_SELECT} ORDER BY p.timestamp DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], |row| {
                prompt_with_output_from_row(row, 0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn prompt_with_outputs_and_alerts(&self, id: &str) -> Result<Option<PromptDetail>, DbError> {
        let conn = self.conn()?;
        let prompt = conn
            .query_row(
                "SELECT id, timestamp, provider, request, type FROM prompts WHERE id = ?1",
                params![id],
                prompt_from_row,
            )
            .optional()?;
        let Some(prompt) = prompt else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, prompt_id, timestamp, output FROM outputs
             WHERE prompt_id = ?1 ORDER BY timestamp DESC",
        )?;
        let outputs = stmt
            .query_map(params![id], output_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, prompt_id, output_id, code_snippet, trigger_string, trigger_type,
                    trigger_category, timestamp
             FROM alerts WHERE prompt_id = ?1 ORDER BY timestamp DESC",
        )?;
        let alerts = stmt
            .query_map(params![id], |row| alert_from_row(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(PromptDetail {
            prompt,
            outputs,
            alerts,
        }))
    }

    /// Most recent alerts with the prompt and output they belong to
    pub fn list_alerts(&self, limit: usize) -> Result<Vec<AlertWithPrompt>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT a.id, a.prompt_id, a.output_id, a.code_snippet, a.trigger_string,
                    a.trigger_type, a.trigger_category, a.timestamp,
                    p.id, p.timestamp, p.provider, p.request, p.type,
                    o.id, o.output, o.timestamp
             FROM alerts a
             JOIN prompts p ON p.id = a.prompt_id
             LEFT JOIN outputs o ON o.id = (
                 SELECT id FROM outputs WHERE prompt_id = p.id ORDER BY timestamp DESC LIMIT 1
             )
             ORDER BY a.timestamp DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(AlertWithPrompt {
                    alert: alert_from_row(row, 0)?,
                    prompt: prompt_with_output_from_row(row, 8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_settings(&self, settings: &Settings) -> Result<(), DbError> {
        self.conn()?.execute(
            "INSERT INTO settings (id, ip, port, llm_model, system_prompt, other_settings)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 ip = excluded.ip,
                 port = excluded.port,
                 llm_model = excluded.llm_model,
                 system_prompt = excluded.system_prompt,
                 other_settings = excluded.other_settings",
            params![
                settings.id,
                settings.ip,
                settings.port,
                settings.llm_model,
                settings.system_prompt,
                settings.other_settings,
            ],
        )?;
        Ok(())
    }

    pub fn get_settings(&self) -> Result<Option<Settings>, DbError> {
        let settings = self
            .conn()?
            .query_row(
                "SELECT id, ip, port, llm_model, system_prompt, other_settings
                 FROM settings ORDER BY id LIMIT 1",
                [],
                |row| {
                    Ok(Settings {
                        id: row.get(0)?,
                        ip: row.get(1)?,
                        port: row.get(2)?,
                        llm_model: row.get(3)?,
                        system_prompt: row.get(4)?,
                        other_settings: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(settings)
    }
}

/// Replace the database file with `backup_dir/backup_name`
///
/// Must run while no connection to `db_path` is open. Leftover WAL files of
/// the replaced database are removed so they are not replayed on the backup.
pub fn restore_backup(backup_dir: &Path, backup_name: &str, db_path: &Path) -> Result<(), DbError> {
    let backup = backup_dir.join(backup_name);
    if !backup.is_file() {
        return Err(DbError::BackupNotFound(backup));
    }

    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| DbError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::copy(&backup, db_path).map_err(|source| DbError::Io {
        path: db_path.to_path_buf(),
        source,
    })?;

    for suffix in ["-wal", "-shm"] {
        let mut sidecar = db_path.as_os_str().to_owned();
        sidecar.push(suffix);
        let sidecar = PathBuf::from(sidecar);
        if sidecar.exists() {
            fs::remove_file(&sidecar).map_err(|source| DbError::Io {
                path: sidecar.clone(),
                source,
            })?;
        }
    }

    info!(backup = %backup.display(), db = %db_path.display(), "Restored database backup");
    Ok(())
}

/// RFC 3339 in UTC with a fixed width, so text order is time order
fn sql_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, false)
}

fn prompt_from_row(row: &Row<'_>) -> rusqlite::Result<Prompt> {
    Ok(Prompt {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        provider: row.get(2)?,
        request: row.get(3)?,
        prompt_type: row.get(4)?,
    })
}

fn output_from_row(row: &Row<'_>) -> rusqlite::Result<Output> {
    Ok(Output {
        id: row.get(0)?,
        prompt_id: row.get(1)?,
        timestamp: row.get(2)?,
        output: row.get(3)?,
    })
}

fn alert_from_row(row: &Row<'_>, start: usize) -> rusqlite::Result<Alert> {
    Ok(Alert {
        id: row.get(start)?,
        prompt_id: row.get(start + 1)?,
        output_id: row.get(start + 2)?,
        code_snippet: row.get(start + 3)?,
        trigger_string: row.get(start + 4)?,
        trigger_type: row.get(start + 5)?,
        trigger_category: row.get(start + 6)?,
        timestamp: row.get(start + 7)?,
    })
}

fn prompt_with_output_from_row(row: &Row<'_>, start: usize) -> rusqlite::Result<PromptWithOutput> {
    Ok(PromptWithOutput {
        id: row.get(start)?,
        timestamp: row.get(start + 1)?,
        provider: row.get(start + 2)?,
        request: row.get(start + 3)?,
        prompt_type: row.get(start + 4)?,
        output_id: row.get(start + 5)?,
        output: row.get(start + 6)?,
        output_timestamp: row.get::<_, Option<DateTime<Utc>>>(start + 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn prompt_at(id: &str, secs: i64, request: &str) -> Prompt {
        Prompt {
            id: id.to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            provider: Some("openai".to_string()),
            request: request.to_string(),
            prompt_type: "chat".to_string(),
        }
    }

    fn alert_for(prompt_id: &str, secs: i64) -> Alert {
        Alert {
            id: Uuid::new_v4().to_string(),
            prompt_id: prompt_id.to_string(),
            output_id: None,
            code_snippet: None,
            trigger_string: Some("1 email".to_string()),
            trigger_type: "codegate-pii".to_string(),
            trigger_category: Some("critical".to_string()),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_instance_and_session_are_stable() {
        let db = Database::open_in_memory().unwrap();
        let instance = db.init_instance().unwrap();
        assert_eq!(db.init_instance().unwrap(), instance);

        let session = db.init_session_if_not_exists().unwrap();
        assert_eq!(db.init_session_if_not_exists().unwrap(), session);
    }

    #[test]
    fn test_list_prompts_with_latest_output() {
        let db = Database::open_in_memory().unwrap();
        db.insert_prompt(&prompt_at("p1", 0, "{}")).unwrap();
        db.insert_prompt(&prompt_at("p2", 10, "{}")).unwrap();

        let base = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        for (id, offset, text) in [("o1", 0, "old"), ("o2", 5, "new")] {
            db.insert_output(&Output {
                id: id.to_string(),
                prompt_id: "p1".to_string(),
                timestamp: base + Duration::seconds(offset),
                output: text.to_string(),
            })
            .unwrap();
        }

        let rows = db.list_prompts_with_output(10, 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "p2");
        assert!(rows[0].output.is_none());
        assert_eq!(rows[1].id, "p1");
        assert_eq!(rows[1].output.as_deref(), Some("new"));
        assert_eq!(rows[1].output_timestamp, Some(base + Duration::seconds(5)));

        let page = db.list_prompts_with_output(1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "p1");
    }

    #[test]
    fn test_timestamps_stored_as_rfc3339() {
        let db = Database::open_in_memory().unwrap();
        let prompt = prompt_at("p1", 0, "{}");
        db.insert_prompt(&prompt).unwrap();

        let stored: String = db
            .conn()
            .unwrap()
            .query_row("SELECT timestamp FROM prompts WHERE id = 'p1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored, "2023-11-14T22:13:20.000000000+00:00");
        assert_eq!(DateTime::parse_from_rfc3339(&stored).unwrap(), prompt.timestamp);
        assert_eq!(db.list_prompts_with_output(1, 0).unwrap()[0].timestamp, prompt.timestamp);
    }

    #[test]
    fn test_prompt_detail() {
        let db = Database::open_in_memory().unwrap();
        let prompt = db.record_prompt(Some("anthropic"), "{\"a\":1}", "chat").unwrap();
        db.record_output(&prompt.id, "{}").unwrap();
        db.record_alert(&alert_for(&prompt.id, 0)).unwrap();

        let detail = db.prompt_with_outputs_and_alerts(&prompt.id).unwrap().unwrap();
        assert_eq!(detail.prompt, prompt);
        assert_eq!(detail.outputs.len(), 1);
        assert_eq!(detail.alerts.len(), 1);

        assert!(db.prompt_with_outputs_and_alerts("missing").unwrap().is_none());
    }

    #[test]
    fn test_list_alerts_newest_first() {
        let db = Database::open_in_memory().unwrap();
        db.insert_prompt(&prompt_at("p1", 0, "{}")).unwrap();
        let older = alert_for("p1", 1);
        let newer = alert_for("p1", 2);
        db.record_alert(&older).unwrap();
        db.record_alert(&newer).unwrap();

        let alerts = db.list_alerts(10).unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].alert.id, newer.id);
        assert_eq!(alerts[0].prompt.id, "p1");
        assert_eq!(db.list_alerts(1).unwrap().len(), 1);
    }

    #[test]
    fn test_alert_requires_existing_prompt() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.record_alert(&alert_for("nope", 0)).is_err());
    }

    #[test]
    fn test_settings_upsert() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_settings().unwrap().is_none());

        let mut settings = Settings {
            id: "default".to_string(),
            ip: Some("127.0.0.1".to_string()),
            port: Some(8989),
            llm_model: None,
            system_prompt: None,
            other_settings: None,
        };
        db.upsert_settings(&settings).unwrap();
        settings.port = Some(9000);
        db.upsert_settings(&settings).unwrap();

        assert_eq!(db.get_settings().unwrap(), Some(settings));
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/db/codegate.db");
        let db = Database::open(&path).unwrap();
        db.init_instance().unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn test_restore_backup() {
        let dir = TempDir::new().unwrap();
        let backup_dir = dir.path().join("backups");
        fs::create_dir_all(&backup_dir).unwrap();

        let backup_path = backup_dir.join("snapshot.db");
        {
            let db = Database::open(&backup_path).unwrap();
            db.insert_prompt(&prompt_at("from-backup", 0, "{}")).unwrap();
        }

        let db_path = dir.path().join("db/codegate.db");
        {
            let db = Database::open(&db_path).unwrap();
            db.insert_prompt(&prompt_at("current", 0, "{}")).unwrap();
        }

        restore_backup(&backup_dir, "snapshot.db", &db_path).unwrap();

        let db = Database::open(&db_path).unwrap();
        let rows = db.list_prompts_with_output(10, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "from-backup");
    }

    #[test]
    fn test_restore_missing_backup() {
        let dir = TempDir::new().unwrap();
        let err = restore_backup(dir.path(), "nope.db", &dir.path().join("x.db")).unwrap_err();
        assert!(matches!(err, DbError::BackupNotFound(_)));
    }
}
