pub mod activity;
pub mod database;
pub mod devices;
pub mod error;
pub mod presence;
pub mod recording;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use presence::SqlitePresenceStore;
pub use recording::RecordingPresenceStore;
