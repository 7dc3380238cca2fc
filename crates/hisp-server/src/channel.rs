//! Delivery channels: the server-side end of a device's event stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{Stream, StreamExt, TakeUntil};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, warn};

use hisp_core::{ConnectionId, Frame};

/// Invoked once when the transport behind a channel goes away.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Write side of a long-lived server-push stream to one device.
pub trait DeliveryChannel: Send + Sync {
    fn id(&self) -> &ConnectionId;

    /// Queue a frame. Returns false if the frame was not accepted.
    fn write(&self, frame: &Frame) -> bool;

    /// False once the underlying transport is known to be gone.
    fn is_alive(&self) -> bool;

    /// End the stream. Idempotent.
    fn close(&self);

    /// Register the callback fired when the transport closes. If it already
    /// closed, the callback runs immediately.
    fn on_close(&self, callback: CloseCallback);
}

#[derive(Default)]
struct CloseHook {
    callback: Option<CloseCallback>,
    fired: bool,
}

impl CloseHook {
    fn register(hook: &Mutex<CloseHook>, callback: CloseCallback) {
        let mut guard = hook.lock();
        if guard.fired {
            drop(guard);
            callback();
        } else {
            guard.callback = Some(callback);
        }
    }

    fn fire(hook: &Mutex<CloseHook>) {
        let callback = {
            let mut guard = hook.lock();
            guard.fired = true;
            guard.callback.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Channel backed by a bounded queue drained into an HTTP response body.
pub struct SseChannel {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
    hook: Arc<Mutex<CloseHook>>,
}

/// Read side of an [`SseChannel`], turned into the response body stream.
pub struct SseReceiver {
    rx: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
    hook: Arc<Mutex<CloseHook>>,
}

impl SseChannel {
    pub fn open(queue: usize) -> (Arc<Self>, SseReceiver) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let shutdown = CancellationToken::new();
        let hook = Arc::new(Mutex::new(CloseHook::default()));
        let channel = Arc::new(Self {
            id: ConnectionId::new(),
            tx,
            shutdown: shutdown.clone(),
            hook: Arc::clone(&hook),
        });
        (channel, SseReceiver { rx, shutdown, hook })
    }
}

impl DeliveryChannel for SseChannel {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn write(&self, frame: &Frame) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match self.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %self.id, "send queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn is_alive(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.tx.is_closed()
    }

    fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(connection_id = %self.id, "closing event stream");
            self.shutdown.cancel();
        }
    }

    fn on_close(&self, callback: CloseCallback) {
        CloseHook::register(&self.hook, callback);
    }
}

impl SseReceiver {
    pub fn into_stream(self) -> SseStream {
        SseStream {
            frames: ReceiverStream::new(self.rx).take_until(self.shutdown.cancelled_owned()),
            hook: self.hook,
        }
    }
}

pin_project! {
    /// Frames queued on an [`SseChannel`]. Ends when the channel is closed;
    /// dropping it (the client went away) fires the close callback.
    pub struct SseStream {
        #[pin]
        frames: TakeUntil<ReceiverStream<Frame>, WaitForCancellationFutureOwned>,
        hook: Arc<Mutex<CloseHook>>,
    }

    impl PinnedDrop for SseStream {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            CloseHook::fire(this.hook);
        }
    }
}

impl Stream for SseStream {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.project().frames.poll_next(cx)
    }
}

/// In-memory channel that captures every frame written to it.
pub struct MemoryChannel {
    id: ConnectionId,
    frames: Mutex<Vec<Frame>>,
    alive: AtomicBool,
    closed: AtomicBool,
    hook: Mutex<CloseHook>,
}

impl MemoryChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            frames: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            hook: Mutex::new(CloseHook::default()),
        })
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    pub fn payload_count(&self, frame: &Frame) -> usize {
        self.frames.lock().iter().filter(|f| *f == frame).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The transport died without a close notification reaching the server.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// The client disconnected and the close notification fired.
    pub fn disconnect(&self) {
        self.kill();
        CloseHook::fire(&self.hook);
    }
}

impl DeliveryChannel for MemoryChannel {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn write(&self, frame: &Frame) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.frames.lock().push(frame.clone());
        true
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            CloseHook::fire(&self.hook);
        }
    }

    fn on_close(&self, callback: CloseCallback) {
        CloseHook::register(&self.hook, callback);
    }
}
