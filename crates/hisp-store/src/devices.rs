use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use hisp_core::DeviceId;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRow {
    pub id: DeviceId,
    pub owner_id: u64,
    pub name: String,
    pub online: bool,
    pub sensor_value: Option<f64>,
    pub sensor_str: Option<String>,
    pub sensor_updated_at: Option<String>,
    pub created_at: String,
}

const DEVICE_COLUMNS: &str =
    "id, owner_id, name, online, sensor_value, sensor_str, sensor_updated_at, created_at";

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceRow> {
    Ok(DeviceRow {
        id: DeviceId::new(row.get::<_, i64>(0)? as u64),
        owner_id: row.get::<_, i64>(1)? as u64,
        name: row.get(2)?,
        online: row.get(3)?,
        sensor_value: row.get(4)?,
        sensor_str: row.get(5)?,
        sensor_updated_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn sql_id(id: DeviceId) -> i64 {
    id.get() as i64
}

/// Registered devices, their owners, presence flag and latest sensor reading.
#[derive(Clone)]
pub struct DeviceRepo {
    db: Database,
}

impl DeviceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a device for an owner. Registering an existing id is a conflict.
    #[instrument(skip(self), fields(device_id = %id))]
    pub fn register(&self, id: DeviceId, owner_id: u64, name: &str) -> Result<DeviceRow, StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO devices (id, owner_id, name, online, created_at) VALUES (?1, ?2, ?3, 0, ?4)",
                params![sql_id(id), owner_id as i64, name, now],
            )
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => StoreError::Conflict(format!("device {id} already registered")),
                other => other,
            })?;

            Ok(DeviceRow {
                id,
                owner_id,
                name: name.to_string(),
                online: false,
                sensor_value: None,
                sensor_str: None,
                sensor_updated_at: None,
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(device_id = %id))]
    pub fn get(&self, id: DeviceId) -> Result<DeviceRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
                [sql_id(id)],
                device_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("device {id}")))
        })
    }

    /// Fetch a device only if `owner_id` owns it. A foreign device reads as not found.
    #[instrument(skip(self), fields(device_id = %id))]
    pub fn get_owned(&self, id: DeviceId, owner_id: u64) -> Result<DeviceRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1 AND owner_id = ?2"),
                params![sql_id(id), owner_id as i64],
                device_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("device {id}")))
        })
    }

    pub fn exists(&self, id: DeviceId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM devices WHERE id = ?1", [sql_id(id)], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }

    #[instrument(skip(self))]
    pub fn list_for_owner(&self, owner_id: u64) -> Result<Vec<DeviceRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEVICE_COLUMNS} FROM devices WHERE owner_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([owner_id as i64], device_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Write the persisted presence flag.
    pub fn set_online(&self, id: DeviceId, online: bool) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE devices SET online = ?1 WHERE id = ?2",
                params![online, sql_id(id)],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("device {id}")));
            }
            Ok(())
        })
    }

    /// Record the latest sensor reading pushed by a device.
    #[instrument(skip(self, sensor_str), fields(device_id = %id))]
    pub fn update_sensor(&self, id: DeviceId, value: f64, sensor_str: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE devices SET sensor_value = ?1, sensor_str = ?2, sensor_updated_at = ?3 WHERE id = ?4",
                params![value, sensor_str, Utc::now().to_rfc3339(), sql_id(id)],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("device {id}")));
            }
            Ok(())
        })
    }

    /// Clear every presence flag. No connection survives a restart, so
    /// anything still marked online at boot is stale.
    pub fn reset_presence(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("UPDATE devices SET online = 0 WHERE online <> 0", [])?;
            Ok(changed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> DeviceRepo {
        DeviceRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn register_and_get() {
        let repo = repo();
        let created = repo.register(DeviceId::new(42), 1, "porch lamp").unwrap();
        assert!(!created.online);

        let fetched = repo.get(DeviceId::new(42)).unwrap();
        assert_eq!(fetched.name, "porch lamp");
        assert_eq!(fetched.owner_id, 1);
        assert!(fetched.sensor_value.is_none());
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let repo = repo();
        repo.register(DeviceId::new(5), 1, "a").unwrap();
        let err = repo.register(DeviceId::new(5), 2, "b").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got: {err}");
    }

    #[test]
    fn get_missing_device_is_not_found() {
        let err = repo().get(DeviceId::new(99)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn get_owned_hides_foreign_devices() {
        let repo = repo();
        repo.register(DeviceId::new(3), 10, "thermo").unwrap();
        assert!(repo.get_owned(DeviceId::new(3), 10).is_ok());
        assert!(matches!(
            repo.get_owned(DeviceId::new(3), 11),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn list_for_owner_is_sorted_and_filtered() {
        let repo = repo();
        repo.register(DeviceId::new(9), 1, "b").unwrap();
        repo.register(DeviceId::new(2), 1, "a").unwrap();
        repo.register(DeviceId::new(4), 2, "other").unwrap();

        let ids: Vec<u64> = repo
            .list_for_owner(1)
            .unwrap()
            .into_iter()
            .map(|d| d.id.get())
            .collect();
        assert_eq!(ids, vec![2, 9]);
    }

    #[test]
    fn set_online_toggles_flag() {
        let repo = repo();
        repo.register(DeviceId::new(42), 1, "lamp").unwrap();
        repo.set_online(DeviceId::new(42), true).unwrap();
        assert!(repo.get(DeviceId::new(42)).unwrap().online);
        repo.set_online(DeviceId::new(42), false).unwrap();
        assert!(!repo.get(DeviceId::new(42)).unwrap().online);
    }

    #[test]
    fn set_online_unknown_device_is_not_found() {
        let err = repo().set_online(DeviceId::new(1), true).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn update_sensor_stores_reading() {
        let repo = repo();
        repo.register(DeviceId::new(8), 1, "weather").unwrap();
        repo.update_sensor(DeviceId::new(8), 21.5, "temp").unwrap();

        let device = repo.get(DeviceId::new(8)).unwrap();
        assert_eq!(device.sensor_value, Some(21.5));
        assert_eq!(device.sensor_str.as_deref(), Some("temp"));
        assert!(device.sensor_updated_at.is_some());
    }

    #[test]
    fn reset_presence_clears_all_flags() {
        let repo = repo();
        repo.register(DeviceId::new(1), 1, "a").unwrap();
        repo.register(DeviceId::new(2), 1, "b").unwrap();
        repo.set_online(DeviceId::new(1), true).unwrap();
        repo.set_online(DeviceId::new(2), true).unwrap();

        assert_eq!(repo.reset_presence().unwrap(), 2);
        assert!(!repo.get(DeviceId::new(1)).unwrap().online);
        assert_eq!(repo.reset_presence().unwrap(), 0);
    }

    #[test]
    fn exists_reports_registration() {
        let repo = repo();
        assert!(!repo.exists(DeviceId::new(6)).unwrap());
        repo.register(DeviceId::new(6), 1, "x").unwrap();
        assert!(repo.exists(DeviceId::new(6)).unwrap());
    }
}
