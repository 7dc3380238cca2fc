use async_trait::async_trait;

use crate::errors::PersistenceError;
use crate::ids::DeviceId;

/// Durable record of whether a device is online.
///
/// Implementations only promise to eventually reflect the last value written.
/// Callers are responsible for ordering writes per device.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_online(&self, device_id: DeviceId, online: bool) -> Result<(), PersistenceError>;
}
