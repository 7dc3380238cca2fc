//! SQLite store for persisted log events.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::Level;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        severity INTEGER NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        device_id INTEGER,
        connection_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_device ON logs(device_id, id);
    CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
";

const DEFAULT_LIMIT: u32 = 100;

/// A persisted log event.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining event fields as a JSON object.
    pub fields: Option<String>,
    pub device_id: Option<u64>,
    pub connection_id: Option<String>,
}

/// Filters for [`SqliteLogSink::query`]. Unset filters match everything.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Least severe level to include, e.g. `WARN` also returns errors.
    pub min_level: Option<Level>,
    /// Module path prefix, e.g. `hisp_server::registry`.
    pub target: Option<String>,
    pub device_id: Option<u64>,
    /// RFC 3339 lower bound on the event time.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// An event about to be written.
#[derive(Clone, Debug)]
pub(crate) struct NewLogEntry {
    pub timestamp: String,
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub device_id: Option<u64>,
    pub connection_id: Option<String>,
}

/// Lower is more severe, so `severity <= rank(min)` selects "min and above".
fn rank(level: Level) -> i64 {
    [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG]
        .iter()
        .position(|l| *l == level)
        .map_or(5, |i| i as i64 + 1)
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    /// Sink backed by a private in-memory database.
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn insert(&self, entry: &NewLogEntry) -> Result<(), rusqlite::Error> {
        self.conn.lock().execute(
            "INSERT INTO logs (timestamp, severity, level, target, message, fields, device_id, connection_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.timestamp,
                rank(entry.level),
                entry.level.to_string(),
                entry.target,
                entry.message,
                entry.fields,
                entry.device_id.map(|id| id as i64),
                entry.connection_id,
            ],
        )?;
        Ok(())
    }

    /// Matching events, newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, level, target, message, fields, device_id, connection_id
             FROM logs
             WHERE (?1 IS NULL OR severity <= ?1)
               AND (?2 IS NULL OR substr(target, 1, length(?2)) = ?2)
               AND (?3 IS NULL OR device_id = ?3)
               AND (?4 IS NULL OR timestamp >= ?4)
             ORDER BY id DESC
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                q.min_level.map(rank),
                q.target,
                q.device_id.map(|id| id as i64),
                q.since,
                q.limit.unwrap_or(DEFAULT_LIMIT),
            ],
            |row| {
                Ok(LogRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    fields: row.get(5)?,
                    device_id: row.get::<_, Option<i64>>(6)?.map(|id| id as u64),
                    connection_id: row.get(7)?,
                })
            },
        )?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: Level, message: &str) -> NewLogEntry {
        NewLogEntry {
            timestamp: "2026-10-16T12:00:00Z".into(),
            level,
            target: "hisp_server::registry".into(),
            message: message.into(),
            fields: None,
            device_id: None,
            connection_id: None,
        }
    }

    fn sink_with(entries: &[NewLogEntry]) -> SqliteLogSink {
        let sink = SqliteLogSink::in_memory().unwrap();
        for e in entries {
            sink.insert(e).unwrap();
        }
        sink
    }

    #[test]
    fn file_backed_sink_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteLogSink::new(&dir.path().join("nested/logs.db")).unwrap();
        sink.insert(&entry(Level::WARN, "presence write failed")).unwrap();
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn min_level_includes_more_severe() {
        let sink = sink_with(&[
            entry(Level::INFO, "info"),
            entry(Level::WARN, "warn"),
            entry(Level::ERROR, "error"),
        ]);

        let warn_and_up = sink
            .query(&LogQuery {
                min_level: Some(Level::WARN),
                ..Default::default()
            })
            .unwrap();
        let messages: Vec<_> = warn_and_up.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, ["error", "warn"]);
        assert_eq!(warn_and_up[0].level, "ERROR");
    }

    #[test]
    fn filters_by_device_and_target_prefix() {
        let sink = sink_with(&[
            NewLogEntry {
                device_id: Some(1),
                ..entry(Level::WARN, "device one")
            },
            NewLogEntry {
                device_id: Some(2),
                target: "hisp_store::presence".into(),
                ..entry(Level::WARN, "device two")
            },
        ]);

        let by_device = sink
            .query(&LogQuery {
                device_id: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_device.len(), 1);
        assert_eq!(by_device[0].message, "device one");

        let by_target = sink
            .query(&LogQuery {
                target: Some("hisp_store".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_target.len(), 1);
        assert_eq!(by_target[0].device_id, Some(2));
    }

    #[test]
    fn since_and_limit() {
        let mut entries: Vec<_> = (0..5).map(|i| entry(Level::WARN, &format!("msg {i}"))).collect();
        entries[0].timestamp = "2026-10-16T11:00:00Z".into();
        let sink = sink_with(&entries);

        let recent = sink
            .query(&LogQuery {
                since: Some("2026-10-16T12:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(recent.len(), 4);

        let newest = sink
            .query(&LogQuery {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        let messages: Vec<_> = newest.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, ["msg 4", "msg 3"]);
    }
}
