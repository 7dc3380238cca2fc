//! Settings type definitions.
//!
//! All types use camelCase JSON field names and implement [`Default`] with
//! production values, so partial JSON files are accepted.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HispSettings {
    pub server: ServerSettings,
    pub presence: PresenceSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
}

/// Accepted range for `presence.keepaliveIntervalMs`.
pub const KEEPALIVE_INTERVAL_MS: RangeInclusive<u64> = 1_000..=3_600_000;
/// Accepted range for `presence.transitionWaitMs`.
pub const TRANSITION_WAIT_MS: RangeInclusive<u64> = 0..=600_000;
/// Accepted range for `presence.persistTimeoutMs`.
pub const PERSIST_TIMEOUT_MS: RangeInclusive<u64> = 100..=600_000;

impl HispSettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let presence = &self.presence;
        check_range("presence.keepaliveIntervalMs", presence.keepalive_interval_ms, &KEEPALIVE_INTERVAL_MS)?;
        check_range("presence.transitionWaitMs", presence.transition_wait_ms, &TRANSITION_WAIT_MS)?;
        check_range("presence.persistTimeoutMs", presence.persist_timeout_ms, &PERSIST_TIMEOUT_MS)?;
        if presence.send_queue == 0 {
            return Err(SettingsError::Invalid {
                field: "presence.sendQueue",
                reason: "must be positive",
            });
        }
        Ok(())
    }
}

fn check_range(field: &'static str, value: u64, range: &RangeInclusive<u64>) -> Result<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(SettingsError::OutOfRange {
            field,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}

/// Device transport listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. 0 picks a free port.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Connection registry and liveness tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    /// Period between `data: open` keepalive frames.
    pub keepalive_interval_ms: u64,
    /// Upper bound on how long a reconnect waits for the previous offline write.
    pub transition_wait_ms: u64,
    /// Upper bound on a single presence store write.
    pub persist_timeout_ms: u64,
    /// Frames buffered per connection before new ones are dropped.
    pub send_queue: usize,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 80_000,
            transition_wait_ms: 5_000,
            persist_timeout_ms: 10_000,
            send_queue: 64,
        }
    }
}

impl PresenceSettings {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn transition_wait(&self) -> Duration {
        Duration::from_millis(self.transition_wait_ms)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// SQLite file. Relative paths resolve against `~/.hisp`.
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "hisp.db".to_string(),
        }
    }
}

impl DatabaseSettings {
    pub fn resolve(&self, home: &Path) -> PathBuf {
        resolve_under(home, &self.path)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level. `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Persist warn+ records to SQLite.
    pub log_to_sqlite: bool,
    /// Log database file. Relative paths resolve against `~/.hisp`.
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: "logs.db".to_string(),
        }
    }
}

impl LoggingSettings {
    pub fn resolve_db_path(&self, home: &Path) -> PathBuf {
        resolve_under(home, &self.log_db_path)
    }
}

fn resolve_under(home: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        home.join(path)
    }
}
