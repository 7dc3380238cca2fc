//! # hisp-server
//!
//! Device presence and event delivery. Devices hold a long-lived event
//! stream open; the [`ConnectionRegistry`] keeps at most one active stream
//! per device and persists the online flag as streams come and go.

pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod liveness;
pub mod registry;
pub mod server;

pub use channel::{DeliveryChannel, MemoryChannel, SseChannel};
pub use connection::ConnectionState;
pub use dispatcher::{DispatchOutcome, EventDispatcher};
pub use error::ApiError;
pub use registry::{AcquireOutcome, ConnectionRegistry, Delivery, RegistryConfig, ReleaseOutcome};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
