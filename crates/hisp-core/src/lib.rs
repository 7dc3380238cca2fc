pub mod errors;
pub mod frame;
pub mod ids;
pub mod presence;

pub use errors::PersistenceError;
pub use frame::Frame;
pub use ids::{ConnectionId, DeviceId};
pub use presence::PresenceStore;
