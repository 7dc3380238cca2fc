use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use hisp_core::{ConnectionId, DeviceId};

use crate::channel::DeliveryChannel;
use crate::liveness::{spawn_keepalive, KeepaliveHandle};

/// Lifecycle of one device connection. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Registered and receiving events.
    Active,
    /// Released; the offline write is still in flight.
    Closing,
    Closed,
}

/// A device's live stream together with the keepalive task it owns.
pub struct Connection {
    device_id: DeviceId,
    channel: Arc<dyn DeliveryChannel>,
    state: ConnectionState,
    keepalive: Option<KeepaliveHandle>,
    opened_at: DateTime<Utc>,
}

impl Connection {
    pub(crate) fn open(
        device_id: DeviceId,
        channel: Arc<dyn DeliveryChannel>,
        keepalive_interval: Duration,
    ) -> Self {
        let keepalive = spawn_keepalive(Arc::clone(&channel), keepalive_interval);
        Self {
            device_id,
            channel,
            state: ConnectionState::Active,
            keepalive: Some(keepalive),
            opened_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        self.channel.id()
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn channel(&self) -> &Arc<dyn DeliveryChannel> {
        &self.channel
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Token that stops this connection's keepalive writer.
    pub fn keepalive_stopper(&self) -> Option<CancellationToken> {
        self.keepalive.as_ref().map(KeepaliveHandle::stopper)
    }

    pub fn keepalive_running(&self) -> bool {
        self.keepalive.as_ref().is_some_and(|k| !k.is_stopped())
    }

    pub fn is(&self, id: &ConnectionId, state: ConnectionState) -> bool {
        self.id() == id && self.state == state
    }

    /// Active -> Closing. Stops keepalives and ends the stream.
    pub(crate) fn begin_close(&mut self) {
        if self.state == ConnectionState::Active {
            self.state = ConnectionState::Closing;
        }
        self.shut();
    }

    /// Terminal. Used both for superseded connections and finished releases.
    pub(crate) fn finish(&mut self) {
        self.state = ConnectionState::Closed;
        self.shut();
    }

    fn shut(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.cancel();
        }
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use hisp_core::Frame;

    #[tokio::test(start_paused = true)]
    async fn lifecycle_moves_forward_and_stops_keepalive() {
        let channel = MemoryChannel::new();
        let mut conn = Connection::open(DeviceId::new(1), channel.clone(), Duration::from_secs(1));
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(conn.is(channel.id(), ConnectionState::Active));
        assert!(conn.keepalive_running());

        conn.begin_close();
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(channel.is_closed());
        assert!(!conn.keepalive_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(channel.payload_count(&Frame::keepalive()), 0);

        conn.finish();
        conn.begin_close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn external_stopper_halts_keepalive_while_active() {
        let channel = MemoryChannel::new();
        let conn = Connection::open(DeviceId::new(1), channel.clone(), Duration::from_secs(1));

        conn.keepalive_stopper().unwrap().cancel();
        assert!(!conn.keepalive_running());
        assert_eq!(conn.state(), ConnectionState::Active);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(channel.payload_count(&Frame::keepalive()), 0);
    }
}
