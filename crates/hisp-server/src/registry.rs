//! Per-device connection registry.
//!
//! Each device gets a slot guarded by its own async mutex. Every registry
//! mutation on a device runs under that lock, so at most one connection is
//! ever `Active` for a device and operations on different devices never
//! contend. The lock is never held across a wait on the presence store.
//!
//! Presence writes for a device form a chain: each transition awaits the one
//! before it, so writes land in the order connections were opened and
//! released even when the store is slow or a wait gives up.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hisp_core::{ConnectionId, DeviceId, Frame, PersistenceError, PresenceStore};
use hisp_settings::PresenceSettings;

use crate::channel::{CloseCallback, DeliveryChannel};
use crate::connection::{Connection, ConnectionState};

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub keepalive_interval: Duration,
    /// Upper bound a reconnect waits for the previous offline write.
    pub transition_wait: Duration,
    /// Upper bound on a single presence write.
    pub persist_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&PresenceSettings::default())
    }
}

impl From<&PresenceSettings> for RegistryConfig {
    fn from(settings: &PresenceSettings) -> Self {
        Self {
            keepalive_interval: settings.keepalive_interval(),
            transition_wait: settings.transition_wait(),
            persist_timeout: settings.persist_timeout(),
        }
    }
}

type TransitionFuture = Shared<BoxFuture<'static, ()>>;

/// An in-flight presence write. Completes once the write landed, failed or
/// timed out.
#[derive(Clone)]
struct Transition {
    online: bool,
    done: TransitionFuture,
}

#[derive(Default)]
struct Slot {
    connection: Option<Connection>,
    pending: Option<Transition>,
    /// Set once the slot has been removed from the map. Anyone who fetched it
    /// before removal must go back to the map for a fresh one.
    retired: bool,
}

type SlotHandle = Arc<Mutex<Slot>>;
type SlotMap = Arc<DashMap<DeviceId, SlotHandle>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// No active connection existed. `waited` is true when the previous
    /// connection was still closing and its offline write was awaited.
    Installed { waited: bool },
    /// An active connection was closed and replaced without touching presence.
    Superseded { previous: ConnectionId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The connection is not the device's active one. Nothing happened.
    Stale,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Written,
    /// The channel refused the frame (queue full or closing).
    Dropped,
    NoConnection,
    /// The active channel's transport is gone. It has been closed; the caller
    /// should release it.
    Stale(ConnectionId),
}

/// Point-in-time view of a device's registry entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub connection_id: ConnectionId,
    pub state: ConnectionState,
    pub opened_at: DateTime<Utc>,
    pub keepalive_running: bool,
}

pub struct ConnectionRegistry {
    slots: SlotMap,
    store: Arc<dyn PresenceStore>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn PresenceStore>, config: RegistryConfig) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            store,
            config,
        }
    }

    fn slot_for(&self, device_id: DeviceId) -> SlotHandle {
        Arc::clone(self.slots.entry(device_id).or_default().value())
    }

    fn existing_slot(&self, device_id: DeviceId) -> Option<SlotHandle> {
        self.slots.get(&device_id).map(|entry| Arc::clone(entry.value()))
    }

    async fn lock_live_slot(&self, device_id: DeviceId) -> OwnedMutexGuard<Slot> {
        loop {
            let guard = self.slot_for(device_id).lock_owned().await;
            if !guard.retired {
                return guard;
            }
        }
    }

    /// Make `channel` the device's active connection.
    ///
    /// A still-active predecessor is superseded: closed and replaced with no
    /// presence write. A predecessor that is closing has its offline write
    /// awaited (bounded by `transition_wait`, outside the slot lock) before
    /// the online write is chained behind it. The channel's close callback is
    /// wired to [`release`](Self::release).
    pub async fn acquire(
        self: &Arc<Self>,
        device_id: DeviceId,
        channel: Arc<dyn DeliveryChannel>,
    ) -> AcquireOutcome {
        let connection_id = channel.id().clone();
        let mut waited = false;

        let (outcome, stopper) = loop {
            let mut slot = self.lock_live_slot(device_id).await;
            let previous = slot
                .connection
                .as_ref()
                .map(|conn| (conn.id().clone(), conn.state()));

            let outcome = match previous {
                Some((previous, ConnectionState::Active)) => {
                    if let Some(mut old) = slot.connection.take() {
                        old.finish();
                    }
                    info!(
                        device_id = %device_id,
                        connection_id = %connection_id,
                        previous = %previous,
                        "superseded active connection"
                    );
                    AcquireOutcome::Superseded { previous }
                }
                Some(_) if !waited => {
                    let pending = slot.pending.clone();
                    drop(slot);
                    self.await_pending(device_id, pending).await;
                    waited = true;
                    continue;
                }
                Some((previous, _)) => {
                    if let Some(mut old) = slot.connection.take() {
                        old.finish();
                    }
                    let transition = self.start_transition(device_id, true, slot.pending.take());
                    slot.pending = Some(transition);
                    debug!(device_id = %device_id, previous = %previous, "reconnected after close");
                    AcquireOutcome::Installed { waited }
                }
                None => {
                    let transition = self.start_transition(device_id, true, slot.pending.take());
                    slot.pending = Some(transition);
                    AcquireOutcome::Installed { waited }
                }
            };

            let connection = Connection::open(
                device_id,
                Arc::clone(&channel),
                self.config.keepalive_interval,
            );
            let stopper = connection.keepalive_stopper();
            slot.connection = Some(connection);
            break (outcome, stopper);
        };

        channel.on_close(self.release_on_close(device_id, connection_id.clone(), stopper));
        info!(device_id = %device_id, connection_id = %connection_id, "connection active");
        outcome
    }

    /// Release the device's active connection if it is `connection_id`.
    ///
    /// The connection moves to `Closing` and an offline write is chained; the
    /// entry is removed once that write settles, unless a newer connection
    /// was installed in the meantime.
    pub async fn release(&self, device_id: DeviceId, connection_id: &ConnectionId) -> ReleaseOutcome {
        let Some(handle) = self.existing_slot(device_id) else {
            debug!(device_id = %device_id, connection_id = %connection_id, "release for unknown device");
            return ReleaseOutcome::Stale;
        };
        let mut slot = Arc::clone(&handle).lock_owned().await;

        let Some(conn) = slot
            .connection
            .as_mut()
            .filter(|conn| conn.is(connection_id, ConnectionState::Active))
        else {
            debug!(device_id = %device_id, connection_id = %connection_id, "stale release ignored");
            return ReleaseOutcome::Stale;
        };
        conn.begin_close();

        let transition = self.start_transition(device_id, false, slot.pending.take());
        slot.pending = Some(transition.clone());
        drop(slot);

        tokio::spawn(finish_release(
            Arc::clone(&self.slots),
            handle,
            device_id,
            connection_id.clone(),
            transition.done,
        ));
        info!(device_id = %device_id, connection_id = %connection_id, "connection released");
        ReleaseOutcome::Released
    }

    /// Write `frame` to the device's active connection.
    pub async fn deliver(&self, device_id: DeviceId, frame: &Frame) -> Delivery {
        let Some(handle) = self.existing_slot(device_id) else {
            return Delivery::NoConnection;
        };
        let slot = handle.lock().await;
        let Some(conn) = slot
            .connection
            .as_ref()
            .filter(|conn| conn.state() == ConnectionState::Active)
        else {
            return Delivery::NoConnection;
        };

        let channel = conn.channel();
        if !channel.is_alive() {
            channel.close();
            return Delivery::Stale(conn.id().clone());
        }
        if channel.write(frame) {
            Delivery::Written
        } else {
            Delivery::Dropped
        }
    }

    pub async fn snapshot(&self, device_id: DeviceId) -> Option<ConnectionSnapshot> {
        let handle = self.existing_slot(device_id)?;
        let slot = handle.lock().await;
        let conn = slot.connection.as_ref()?;
        Some(ConnectionSnapshot {
            connection_id: conn.id().clone(),
            state: conn.state(),
            opened_at: conn.opened_at(),
            keepalive_running: conn.keepalive_running(),
        })
    }

    pub async fn state_of(&self, device_id: DeviceId) -> Option<ConnectionState> {
        self.snapshot(device_id).await.map(|s| s.state)
    }

    /// Number of devices with an entry, including entries still closing.
    pub fn tracked_devices(&self) -> usize {
        self.slots.len()
    }

    pub async fn active_count(&self) -> usize {
        let mut count = 0;
        for handle in self.all_slots() {
            let slot = handle.lock().await;
            if slot
                .connection
                .as_ref()
                .is_some_and(|conn| conn.state() == ConnectionState::Active)
            {
                count += 1;
            }
        }
        count
    }

    /// Wait for every presence write queued so far for the device.
    pub async fn settle(&self, device_id: DeviceId) {
        let Some(handle) = self.existing_slot(device_id) else {
            return;
        };
        let pending = handle.lock().await.pending.clone();
        if let Some(transition) = pending {
            transition.done.await;
        }
    }

    /// Release every active connection and wait for their offline writes.
    pub async fn shutdown(&self) {
        let mut active = Vec::new();
        for handle in self.all_slots() {
            let slot = handle.lock().await;
            if let Some(conn) = slot
                .connection
                .as_ref()
                .filter(|conn| conn.state() == ConnectionState::Active)
            {
                active.push((conn.device_id(), conn.id().clone()));
            }
        }

        info!(count = active.len(), "releasing connections for shutdown");
        for (device_id, connection_id) in &active {
            self.release(*device_id, connection_id).await;
        }
        for (device_id, _) in &active {
            self.settle(*device_id).await;
        }
    }

    fn all_slots(&self) -> Vec<SlotHandle> {
        self.slots.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    async fn await_pending(&self, device_id: DeviceId, pending: Option<Transition>) {
        let Some(transition) = pending else {
            return;
        };
        if tokio::time::timeout(self.config.transition_wait, transition.done)
            .await
            .is_err()
        {
            warn!(
                device_id = %device_id,
                online = transition.online,
                wait_ms = self.config.transition_wait.as_millis() as u64,
                "previous presence write still pending, proceeding"
            );
        }
    }

    /// Chain a presence write behind `previous` and start it.
    fn start_transition(&self, device_id: DeviceId, online: bool, previous: Option<Transition>) -> Transition {
        let store = Arc::clone(&self.store);
        let persist_timeout = self.config.persist_timeout;

        let done = async move {
            if let Some(previous) = previous {
                previous.done.await;
            }
            let result = match tokio::time::timeout(persist_timeout, store.set_online(device_id, online)).await {
                Ok(result) => result,
                Err(_) => Err(PersistenceError::Timeout(persist_timeout)),
            };
            match result {
                Ok(()) => debug!(device_id = %device_id, online, "presence transition landed"),
                Err(e) => warn!(
                    device_id = %device_id,
                    online,
                    kind = e.error_kind(),
                    error = %e,
                    "presence write failed"
                ),
            }
        }
        .boxed()
        .shared();

        tokio::spawn(done.clone());
        Transition { online, done }
    }

    /// Close callback: stops the keepalive right away, then releases on the
    /// runtime.
    fn release_on_close(
        self: &Arc<Self>,
        device_id: DeviceId,
        connection_id: ConnectionId,
        keepalive: Option<CancellationToken>,
    ) -> CloseCallback {
        let registry: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(keepalive) = keepalive {
                keepalive.cancel();
            }
            let Some(registry) = registry.upgrade() else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        registry.release(device_id, &connection_id).await;
                    });
                }
                Err(_) => debug!(device_id = %device_id, "channel closed outside a runtime"),
            }
        })
    }
}

/// Drop the device's entry once the offline write settles, unless the slot
/// has moved on to a newer connection.
async fn finish_release(
    slots: SlotMap,
    handle: SlotHandle,
    device_id: DeviceId,
    connection_id: ConnectionId,
    done: TransitionFuture,
) {
    done.await;

    let mut slot = handle.lock().await;
    if !slot
        .connection
        .as_ref()
        .is_some_and(|conn| conn.is(&connection_id, ConnectionState::Closing))
    {
        debug!(device_id = %device_id, connection_id = %connection_id, "entry reused, keeping it");
        return;
    }

    if let Some(mut conn) = slot.connection.take() {
        conn.finish();
    }
    slot.pending = None;
    slot.retired = true;
    slots.remove_if(&device_id, |_, current| Arc::ptr_eq(current, &handle));
    debug!(device_id = %device_id, connection_id = %connection_id, "entry removed");
}
