use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use hisp_core::Frame;

use crate::channel::DeliveryChannel;

/// Periodic keepalive writer owned by exactly one connection.
///
/// Dropping the handle stops the task, so a connection can never leave a
/// writer running after it is closed or replaced. The stop token can also be
/// tripped from elsewhere, e.g. the channel's close hook.
pub struct KeepaliveHandle {
    task: JoinHandle<()>,
    stop: CancellationToken,
}

impl KeepaliveHandle {
    pub fn cancel(self) {
        drop(self);
    }

    /// Token that stops the writer when cancelled.
    pub fn stopper(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for KeepaliveHandle {
    fn drop(&mut self) {
        self.stop.cancel();
        self.task.abort();
    }
}

/// Write a keepalive frame every `interval` until the channel stops being
/// alive or the handle is stopped. The first frame goes out one full
/// interval after the call.
pub fn spawn_keepalive(channel: Arc<dyn DeliveryChannel>, interval: Duration) -> KeepaliveHandle {
    let stop = CancellationToken::new();
    let stopped = stop.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stopped.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !channel.is_alive() {
                debug!(connection_id = %channel.id(), "channel gone, stopping keepalive");
                break;
            }
            channel.write(&Frame::keepalive());
        }
    });
    KeepaliveHandle { task, stop }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;

    const INTERVAL: Duration = Duration::from_secs(80);

    #[tokio::test(start_paused = true)]
    async fn writes_one_frame_per_interval() {
        let channel = MemoryChannel::new();
        let _handle = spawn_keepalive(channel.clone(), INTERVAL);

        tokio::time::sleep(Duration::from_secs(79)).await;
        assert!(channel.frames().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(channel.payload_count(&Frame::keepalive()), 1);

        tokio::time::sleep(INTERVAL).await;
        assert_eq!(channel.payload_count(&Frame::keepalive()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_channel_dies() {
        let channel = MemoryChannel::new();
        let handle = spawn_keepalive(channel.clone(), INTERVAL);

        channel.kill();
        tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;

        assert!(handle.is_finished());
        assert!(channel.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_writes() {
        let channel = MemoryChannel::new();
        let handle = spawn_keepalive(channel.clone(), INTERVAL);
        handle.cancel();

        tokio::time::sleep(INTERVAL * 3).await;
        assert!(channel.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tripping_the_stopper_ends_the_task() {
        let channel = MemoryChannel::new();
        let handle = spawn_keepalive(channel.clone(), INTERVAL);

        handle.stopper().cancel();
        assert!(handle.is_stopped());
        tokio::time::sleep(INTERVAL * 2).await;

        assert!(handle.is_finished());
        assert!(channel.frames().is_empty());
    }
}
