//! Best-effort device activity log.

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use hisp_core::DeviceId;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Connected,
    Disconnected,
    /// Free-form line pushed by the device itself.
    Log,
    Sensor,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Log => "log",
            Self::Sensor => "sensor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connected" => Some(Self::Connected),
            "disconnected" => Some(Self::Disconnected),
            "log" => Some(Self::Log),
            "sensor" => Some(Self::Sensor),
            _ => None,
        }
    }

    /// Kind recorded alongside a presence flag write.
    pub fn for_presence(online: bool) -> Self {
        if online {
            Self::Connected
        } else {
            Self::Disconnected
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRow {
    pub id: i64,
    pub device_id: DeviceId,
    pub kind: ActivityKind,
    pub data: Option<String>,
    pub created_at: String,
}

#[derive(Clone)]
pub struct ActivityRepo {
    db: Database,
}

impl ActivityRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn append(
        &self,
        device_id: DeviceId,
        kind: ActivityKind,
        data: Option<&str>,
    ) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO device_logs (device_id, kind, data, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    device_id.get() as i64,
                    kind.as_str(),
                    data,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Most recent entries for a device, newest first.
    pub fn recent(&self, device_id: DeviceId, limit: u32) -> Result<Vec<ActivityRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, data, created_at FROM device_logs
                 WHERE device_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![device_id.get() as i64, limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, kind, data, created_at)| {
                    let kind = ActivityKind::parse(&kind)
                        .ok_or_else(|| StoreError::Database(format!("unknown activity kind: {kind}")))?;
                    Ok(ActivityRow {
                        id,
                        device_id,
                        kind,
                        data,
                        created_at,
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceRepo;

    fn setup() -> (ActivityRepo, DeviceId) {
        let db = Database::in_memory().unwrap();
        let id = DeviceId::new(42);
        DeviceRepo::new(db.clone()).register(id, 1, "lamp").unwrap();
        (ActivityRepo::new(db), id)
    }

    #[test]
    fn append_and_read_back_newest_first() {
        let (repo, id) = setup();
        repo.append(id, ActivityKind::Connected, None).unwrap();
        repo.append(id, ActivityKind::Log, Some("booted fw 1.2")).unwrap();

        let rows = repo.recent(id, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, ActivityKind::Log);
        assert_eq!(rows[0].data.as_deref(), Some("booted fw 1.2"));
        assert_eq!(rows[1].kind, ActivityKind::Connected);
    }

    #[test]
    fn recent_respects_limit() {
        let (repo, id) = setup();
        for i in 0..5 {
            repo.append(id, ActivityKind::Log, Some(&format!("line {i}"))).unwrap();
        }
        let rows = repo.recent(id, 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].data.as_deref(), Some("line 4"));
    }

    #[test]
    fn append_for_unregistered_device_fails() {
        let (repo, _) = setup();
        let err = repo.append(DeviceId::new(7), ActivityKind::Log, None).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got: {err}");
    }

    #[test]
    fn kind_string_roundtrip() {
        for kind in [
            ActivityKind::Connected,
            ActivityKind::Disconnected,
            ActivityKind::Log,
            ActivityKind::Sensor,
        ] {
            assert_eq!(ActivityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ActivityKind::for_presence(true), ActivityKind::Connected);
        assert_eq!(ActivityKind::for_presence(false), ActivityKind::Disconnected);
    }
}
