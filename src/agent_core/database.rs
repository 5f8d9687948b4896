//! SQLite invocation log for MCP tool calls.
//!
//! Uses `rusqlite` in synchronous mode behind a mutex; calls are short and
//! made from the session after each tool call completes. WAL mode is enabled
//! so the CLI can read while a session writes.

use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection};

use super::errors::AgentError;
use super::types::{InvocationEntry, ToolUsageStats};
use crate::mcp_client::types::{InvocationLog, ToolInvocationRecord};

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite handle for the tool invocation log.
pub struct InvocationDatabase {
    conn: Mutex<Connection>,
}

impl InvocationDatabase {
    /// Open (or create) the database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS mcp_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                parameters TEXT,
                response TEXT,
                success INTEGER NOT NULL,
                execution_time INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_mcp_logs_session
                ON mcp_logs(session_id, id);
            ",
        )?;
        Ok(())
    }

    // ─── Writes ─────────────────────────────────────────────────────────

    /// Append one invocation. Returns the new row id.
    pub fn log_invocation(&self, record: &ToolInvocationRecord) -> Result<i64, AgentError> {
        let parameters = serde_json::to_string(&record.parameters)?;
        let response = serde_json::to_string(&record.response)?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO mcp_logs
             (session_id, timestamp, tool_name, parameters, response, success, execution_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.session_id,
                record.recorded_at.to_rfc3339(),
                record.tool_name,
                parameters,
                response,
                record.success as i32,
                record.execution_time_ms as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ─── Reads ──────────────────────────────────────────────────────────

    /// Most recent invocations for a session, newest first.
    pub fn recent_invocations(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<InvocationEntry>, AgentError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, timestamp, tool_name, parameters, response,
                    success, execution_time
             FROM mcp_logs
             WHERE session_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![session_id, limit as i64], |row| {
            Ok(InvocationEntry {
                id: row.get(0)?,
                session_id: row.get(1)?,
                timestamp: row.get(2)?,
                tool_name: row.get(3)?,
                parameters: parse_json_value(row.get::<_, Option<String>>(4)?),
                response: parse_json_value(row.get::<_, Option<String>>(5)?),
                success: row.get::<_, i32>(6)? != 0,
                execution_time_ms: row.get::<_, i64>(7)?.max(0) as u64,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Per-tool call counts, failures and mean duration, busiest first.
    pub fn usage_stats(&self) -> Result<Vec<ToolUsageStats>, AgentError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT tool_name,
                    COUNT(*),
                    SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END),
                    AVG(execution_time)
             FROM mcp_logs
             GROUP BY tool_name
             ORDER BY COUNT(*) DESC, tool_name ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(ToolUsageStats {
                tool_name: row.get(0)?,
                calls: row.get::<_, i64>(1)?.max(0) as u64,
                failures: row.get::<_, i64>(2)?.max(0) as u64,
                avg_execution_time_ms: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
            })
        })?;

        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    }
}

impl InvocationLog for InvocationDatabase {
    fn record(&self, record: &ToolInvocationRecord) -> anyhow::Result<()> {
        self.log_invocation(record)?;
        Ok(())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Parse a stored JSON column, defaulting to null.
fn parse_json_value(json: Option<String>) -> serde_json::Value {
    json.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn test_db() -> InvocationDatabase {
        InvocationDatabase::open(":memory:").unwrap()
    }

    fn record(session: &str, tool: &str, success: bool, ms: u64) -> ToolInvocationRecord {
        ToolInvocationRecord {
            session_id: session.into(),
            tool_name: tool.into(),
            parameters: json!({"a": 2, "b": 3}),
            response: json!("5"),
            success,
            execution_time_ms: ms,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_log_and_read_back() {
        let db = test_db();
        let id = db.log_invocation(&record("s1", "add_numbers", true, 12)).unwrap();
        assert!(id > 0);

        let entries = db.recent_invocations("s1", 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tool_name, "add_numbers");
        assert_eq!(entries[0].parameters, json!({"a": 2, "b": 3}));
        assert_eq!(entries[0].response, json!("5"));
        assert!(entries[0].success);
        assert_eq!(entries[0].execution_time_ms, 12);
    }

    #[test]
    fn test_recent_invocations_newest_first_and_scoped() {
        let db = test_db();
        db.log_invocation(&record("s1", "echo", true, 1)).unwrap();
        db.log_invocation(&record("s2", "echo", true, 1)).unwrap();
        db.log_invocation(&record("s1", "get_time", true, 1)).unwrap();
        db.log_invocation(&record("s1", "reverse_text", true, 1)).unwrap();

        let entries = db.recent_invocations("s1", 2).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.tool_name.as_str()).collect();
        assert_eq!(names, vec!["reverse_text", "get_time"]);
    }

    #[test]
    fn test_usage_stats() {
        let db = test_db();
        db.log_invocation(&record("s1", "echo", true, 10)).unwrap();
        db.log_invocation(&record("s1", "echo", false, 30)).unwrap();
        db.log_invocation(&record("s1", "add_numbers", true, 4)).unwrap();

        let stats = db.usage_stats().unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].tool_name, "echo");
        assert_eq!(stats[0].calls, 2);
        assert_eq!(stats[0].failures, 1);
        assert!((stats[0].avg_execution_time_ms - 20.0).abs() < f64::EPSILON);
        assert_eq!(stats[1].tool_name, "add_numbers");
        assert_eq!(stats[1].failures, 0);
    }

    #[test]
    fn test_on_disk_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playground.db");
        let path = path.to_str().unwrap();

        {
            let db = InvocationDatabase::open(path).unwrap();
            let log: &dyn InvocationLog = &db;
            log.record(&record("s1", "echo", true, 3)).unwrap();
        }

        let reopened = InvocationDatabase::open(path).unwrap();
        assert_eq!(reopened.recent_invocations("s1", 10).unwrap().len(), 1);
    }
}
