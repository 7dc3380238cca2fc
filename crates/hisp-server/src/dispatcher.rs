use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use hisp_core::frame::ACTION_PAYLOAD;
use hisp_core::{DeviceId, Frame};

use crate::registry::{ConnectionRegistry, Delivery};

/// What happened to a dispatched event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Delivered,
    /// The device has no active connection. The event is discarded.
    Offline,
    /// The connection had silently died; it was released.
    Stale,
    /// The channel did not accept the frame.
    Dropped,
}

/// Routes events to a device's active connection. Events are never queued
/// for offline devices.
#[derive(Clone)]
pub struct EventDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl EventDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn dispatch_event(&self, device_id: DeviceId, payload: &str) -> DispatchOutcome {
        let frame = Frame::event(payload);
        match self.registry.deliver(device_id, &frame).await {
            Delivery::Written => {
                debug!(device_id = %device_id, bytes = frame.as_str().len(), "event delivered");
                DispatchOutcome::Delivered
            }
            Delivery::NoConnection => {
                debug!(device_id = %device_id, "device offline, event discarded");
                DispatchOutcome::Offline
            }
            Delivery::Dropped => {
                warn!(device_id = %device_id, "event dropped by channel");
                DispatchOutcome::Dropped
            }
            Delivery::Stale(connection_id) => {
                info!(device_id = %device_id, connection_id = %connection_id, "stale connection, releasing");
                self.registry.release(device_id, &connection_id).await;
                DispatchOutcome::Stale
            }
        }
    }

    /// Tell the device a user triggered an action.
    pub async fn request_action(&self, device_id: DeviceId) -> DispatchOutcome {
        self.dispatch_event(device_id, ACTION_PAYLOAD).await
    }
}
