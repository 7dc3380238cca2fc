use async_trait::async_trait;
use tracing::{debug, warn};

use hisp_core::{DeviceId, PersistenceError, PresenceStore};

use crate::activity::{ActivityKind, ActivityRepo};
use crate::database::Database;
use crate::devices::DeviceRepo;

/// SQLite-backed presence flag plus the matching activity log row.
///
/// The flag is authoritative; the activity row is bookkeeping and its failure
/// never fails the write.
#[derive(Clone)]
pub struct SqlitePresenceStore {
    db: Database,
}

impl SqlitePresenceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PresenceStore for SqlitePresenceStore {
    async fn set_online(&self, device_id: DeviceId, online: bool) -> Result<(), PersistenceError> {
        let devices = DeviceRepo::new(self.db.clone());
        let activity = ActivityRepo::new(self.db.clone());

        tokio::task::spawn_blocking(move || {
            devices.set_online(device_id, online)?;
            if let Err(e) = activity.append(device_id, ActivityKind::for_presence(online), None) {
                warn!(device_id = %device_id, error = %e, "failed to append activity row");
            }
            Ok::<_, crate::error::StoreError>(())
        })
        .await
        .map_err(|e| PersistenceError::Unavailable(e.to_string()))??;

        debug!(device_id = %device_id, online, "presence persisted");
        Ok(())
    }
}
