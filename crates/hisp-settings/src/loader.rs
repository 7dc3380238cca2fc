//! Where settings come from.
//!
//! Compiled defaults, then `~/.hisp/settings.json` merged over them key by
//! key, then `HISP_*` environment variables. The result is validated before
//! it is returned.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{HispSettings, KEEPALIVE_INTERVAL_MS, PERSIST_TIMEOUT_MS, TRANSITION_WAIT_MS};

/// `~/.hisp`, home of the settings file and the default databases.
pub fn hisp_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".hisp")
}

pub fn settings_path() -> PathBuf {
    hisp_home().join("settings.json")
}

pub fn load_settings() -> Result<HispSettings> {
    load_settings_from_path(&settings_path())
}

/// A missing file means "all defaults". A file that exists must be valid.
pub fn load_settings_from_path(path: &Path) -> Result<HispSettings> {
    let mut doc = serde_json::to_value(HispSettings::default())?;

    match std::fs::read_to_string(path) {
        Ok(text) => {
            let user: Value = serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            debug!(path = %path.display(), "merging settings file over defaults");
            doc = deep_merge(doc, user);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file, using defaults");
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    let mut settings: HispSettings = serde_json::from_value(doc)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Overlay `source` on `target`. Objects merge per key, anything else is
/// replaced, and an explicit `null` leaves the target value alone.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut into), Value::Object(from)) => {
            for (key, value) in from.into_iter().filter(|(_, v)| !v.is_null()) {
                let merged = match into.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                into.insert(key, merged);
            }
            Value::Object(into)
        }
        (_, source) => source,
    }
}

/// Apply `HISP_*` overrides. A value that does not parse, or falls outside
/// its field's range, is skipped with a warning.
pub fn apply_env_overrides(settings: &mut HispSettings) {
    let server = &mut settings.server;
    env_override("HISP_HOST", &mut server.host, non_empty);
    env_override("HISP_PORT", &mut server.port, |v| v.parse().ok());

    let presence = &mut settings.presence;
    env_override("HISP_KEEPALIVE_INTERVAL_MS", &mut presence.keepalive_interval_ms, |v| {
        parse_within(v, &KEEPALIVE_INTERVAL_MS)
    });
    env_override("HISP_TRANSITION_WAIT_MS", &mut presence.transition_wait_ms, |v| {
        parse_within(v, &TRANSITION_WAIT_MS)
    });
    env_override("HISP_PERSIST_TIMEOUT_MS", &mut presence.persist_timeout_ms, |v| {
        parse_within(v, &PERSIST_TIMEOUT_MS)
    });

    env_override("HISP_DB_PATH", &mut settings.database.path, non_empty);
    env_override("HISP_LOG_LEVEL", &mut settings.logging.level, non_empty);
    env_override("HISP_LOG_TO_SQLITE", &mut settings.logging.log_to_sqlite, parse_bool);
}

fn env_override<T>(name: &str, slot: &mut T, parse: impl Fn(&str) -> Option<T>) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match parse(&raw) {
        Some(value) => *slot = value,
        None => warn!(var = name, value = %raw, "ignoring unusable environment override"),
    }
}

fn non_empty(raw: &str) -> Option<String> {
    (!raw.is_empty()).then(|| raw.to_string())
}

/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `raw` and keep it only if it lies in `range`.
pub fn parse_within<T>(raw: &str, range: &RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    raw.trim().parse().ok().filter(|n| range.contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_settings(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, body).unwrap();
        (dir, path)
    }

    #[test]
    fn merge_overlays_nested_keys_and_skips_nulls() {
        let defaults = json!({
            "server": {"host": "0.0.0.0", "port": 3000},
            "presence": {"sendQueue": 64}
        });
        let user = json!({
            "server": {"port": 8080},
            "presence": {"sendQueue": null},
            "extra": [1]
        });

        let merged = deep_merge(defaults, user);
        assert_eq!(merged["server"], json!({"host": "0.0.0.0", "port": 8080}));
        assert_eq!(merged["presence"]["sendQueue"], 64);
        assert_eq!(merged["extra"], json!([1]));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(
            settings.presence.send_queue,
            HispSettings::default().presence.send_queue
        );
    }

    #[test]
    fn load_partial_file_merges_over_defaults() {
        let (_dir, path) = write_settings(
            r#"{"presence": {"keepaliveIntervalMs": 15000}, "database": {"path": "/data/devices.db"}}"#,
        );

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.presence.keepalive_interval_ms, 15_000);
        assert_eq!(settings.presence.transition_wait_ms, 5_000);
        assert_eq!(settings.database.path, "/data/devices.db");
    }

    #[test]
    fn load_invalid_json_is_an_error() {
        let (_dir, path) = write_settings("{ not json");

        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Parse { path: p, .. } if p == path));
    }

    #[test]
    fn load_directory_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_settings_from_path(dir.path()).unwrap_err();
        assert!(matches!(err, SettingsError::Read { .. }));
    }

    #[test]
    fn load_rejects_zero_send_queue() {
        let (_dir, path) = write_settings(r#"{"presence": {"sendQueue": 0}}"#);

        let err = load_settings_from_path(&path).unwrap_err();
        assert_eq!(err.field(), Some("presence.sendQueue"));
    }

    #[test]
    fn load_rejects_zero_persist_timeout() {
        let (_dir, path) = write_settings(r#"{"presence": {"persistTimeoutMs": 0}}"#);

        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::OutOfRange { field: "presence.persistTimeoutMs", .. }));
    }

    #[test]
    fn load_wrong_type_is_a_shape_error() {
        let (_dir, path) = write_settings(r#"{"server": {"port": "eighty"}}"#);

        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Shape(_)));
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("Off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_within_enforces_field_ranges() {
        assert_eq!(parse_within("80000", &KEEPALIVE_INTERVAL_MS), Some(80_000));
        assert_eq!(parse_within(" 0 ", &TRANSITION_WAIT_MS), Some(0));
        assert_eq!(parse_within("10", &KEEPALIVE_INTERVAL_MS), None);
        assert_eq!(parse_within("99", &PERSIST_TIMEOUT_MS), None);
        assert_eq!(parse_within("-5", &TRANSITION_WAIT_MS), None);
    }
}
