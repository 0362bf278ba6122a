use crate::errors::{AppError, AppResult};
use crate::models::{AppSettings, OutputLine, Session, ToolDefinition};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Persistence for tool definitions and sessions.
pub trait ConfigStore: Send + Sync {
    fn list_tools(&self) -> AppResult<Vec<ToolDefinition>>;
    fn get_tool(&self, name: &str) -> AppResult<Option<ToolDefinition>>;
    fn upsert_tool(&self, tool: &ToolDefinition) -> AppResult<()>;
    fn list_sessions(&self) -> AppResult<Vec<Session>>;
    fn get_session(&self, id: &str) -> AppResult<Option<Session>>;
    fn create_session(&self, tool: &ToolDefinition) -> AppResult<Session>;
    /// Stores the session as given; capping its output is the caller's job.
    fn save_session(&self, session: &Session) -> AppResult<()>;
    fn delete_session(&self, id: &str) -> AppResult<bool>;
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'app'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<AppSettings>(&raw).unwrap_or_default()),
            None => Ok(AppSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: AppSettings = serde_json::from_value(merged)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('app', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
        )?;

        Ok(settings)
    }

    pub fn delete_tool(&self, name: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM tools WHERE name = ?1", [name])?;
        Ok(changed > 0)
    }

    pub fn record_secret_key(&self, tool_name: &str, var_name: &str) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO secret_keys (tool_name, var_name, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(tool_name, var_name) DO UPDATE SET updated_at = excluded.updated_at",
            params![tool_name, var_name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_secret_key(&self, tool_name: &str, var_name: &str) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM secret_keys WHERE tool_name = ?1 AND var_name = ?2",
            params![tool_name, var_name],
        )?;
        Ok(())
    }

    pub fn list_secret_keys(&self) -> AppResult<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT tool_name, var_name FROM secret_keys ORDER BY tool_name, var_name")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM settings WHERE key = 'app'", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES ('app', ?1, ?2)",
                params![
                    serde_json::to_string(&AppSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }
}

impl ConfigStore for Database {
    fn list_tools(&self) -> AppResult<Vec<ToolDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name, definition_json FROM tools ORDER BY name")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut tools = Vec::new();
        for row in rows {
            let (name, raw) = row?;
            match serde_json::from_str::<ToolDefinition>(&raw) {
                Ok(tool) => tools.push(tool),
                Err(error) => {
                    tracing::warn!(tool = %name, error = %error, "skipping unreadable stored tool");
                }
            }
        }
        Ok(tools)
    }

    fn get_tool(&self, name: &str) -> AppResult<Option<ToolDefinition>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT definition_json FROM tools WHERE name = ?1",
                [name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        raw.map(|raw| serde_json::from_str::<ToolDefinition>(&raw).map_err(AppError::from))
            .transpose()
    }

    fn upsert_tool(&self, tool: &ToolDefinition) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tools (name, definition_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET definition_json = excluded.definition_json, updated_at = excluded.updated_at",
            params![tool.name, serde_json::to_string(tool)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn list_sessions(&self) -> AppResult<Vec<Session>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tool_name, tool_icon, tool_description, argument_values_json, flag_values_json,
                    output_json, exit_code, created_at, last_run_at
             FROM sessions
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], parse_session_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    fn get_session(&self, id: &str) -> AppResult<Option<Session>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, tool_name, tool_icon, tool_description, argument_values_json, flag_values_json,
                    output_json, exit_code, created_at, last_run_at
             FROM sessions WHERE id = ?1",
            [id],
            parse_session_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn create_session(&self, tool: &ToolDefinition) -> AppResult<Session> {
        let session = Session::from_tool(tool);
        self.save_session(&session)?;
        Ok(session)
    }

    fn save_session(&self, session: &Session) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (
               id, tool_name, tool_icon, tool_description, argument_values_json, flag_values_json,
               output_json, exit_code, created_at, last_run_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
               argument_values_json = excluded.argument_values_json,
               flag_values_json = excluded.flag_values_json,
               output_json = excluded.output_json,
               exit_code = excluded.exit_code,
               last_run_at = excluded.last_run_at",
            params![
                session.id,
                session.tool_name,
                session.tool_icon,
                session.tool_description,
                serde_json::to_string(&session.argument_values)?,
                serde_json::to_string(&session.flag_values)?,
                serde_json::to_string(&session.output_lines)?,
                session.exit_code,
                session.created_at.to_rfc3339(),
                session.last_run_at.map(|value| value.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn delete_session(&self, id: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }
}

fn parse_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let arguments_raw: String = row.get(4)?;
    let flags_raw: String = row.get(5)?;
    let output_raw: String = row.get(6)?;
    Ok(Session {
        id: row.get(0)?,
        tool_name: row.get(1)?,
        tool_icon: row.get(2)?,
        tool_description: row.get(3)?,
        argument_values: serde_json::from_str::<BTreeMap<String, String>>(&arguments_raw).unwrap_or_default(),
        flag_values: serde_json::from_str::<BTreeMap<String, bool>>(&flags_raw).unwrap_or_default(),
        output_lines: serde_json::from_str::<Vec<OutputLine>>(&output_raw).unwrap_or_default(),
        exit_code: row.get(7)?,
        created_at: parse_time(&row.get::<_, String>(8)?)?,
        last_run_at: row
            .get::<_, Option<String>>(9)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
