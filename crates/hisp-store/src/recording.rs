use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use hisp_core::{DeviceId, PersistenceError, PresenceStore};

/// One presence write that reached the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresenceWrite {
    pub device_id: DeviceId,
    pub online: bool,
}

/// In-memory presence store that records the order in which writes land.
///
/// Writes can be slowed down or made to fail, for exercising the registry's
/// ordering and error paths without a database.
#[derive(Default)]
pub struct RecordingPresenceStore {
    writes: Mutex<Vec<PresenceWrite>>,
    delay: Mutex<Option<Duration>>,
    fail_online: AtomicBool,
    fail_offline: AtomicBool,
    calls: AtomicUsize,
}

impl RecordingPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write sleeps for `delay` before landing.
    pub fn with_delay(delay: Duration) -> Self {
        let store = Self::default();
        store.set_delay(Some(delay));
        store
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn fail_online(&self, fail: bool) {
        self.fail_online.store(fail, Ordering::SeqCst);
    }

    pub fn fail_offline(&self, fail: bool) {
        self.fail_offline.store(fail, Ordering::SeqCst);
    }

    /// All successful writes in landing order.
    pub fn writes(&self) -> Vec<PresenceWrite> {
        self.writes.lock().clone()
    }

    /// Successful writes for one device, as online flags in landing order.
    pub fn history(&self, device_id: DeviceId) -> Vec<bool> {
        self.writes
            .lock()
            .iter()
            .filter(|w| w.device_id == device_id)
            .map(|w| w.online)
            .collect()
    }

    /// Last persisted flag for a device, if any write landed.
    pub fn last(&self, device_id: DeviceId) -> Option<bool> {
        self.history(device_id).last().copied()
    }

    /// Number of `set_online` calls, including failed and abandoned ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PresenceStore for RecordingPresenceStore {
    async fn set_online(&self, device_id: DeviceId, online: bool) -> Result<(), PersistenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = if online {
            self.fail_online.load(Ordering::SeqCst)
        } else {
            self.fail_offline.load(Ordering::SeqCst)
        };
        if failing {
            return Err(PersistenceError::Unavailable("injected failure".into()));
        }

        self.writes.lock().push(PresenceWrite { device_id, online });
        Ok(())
    }
}
