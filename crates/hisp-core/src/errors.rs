use std::time::Duration;

/// Failure writing presence state to the backing store.
///
/// None of these are fatal to the presence core: the in-memory registry stays
/// authoritative for delivery and the next transition retries implicitly.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("presence store unavailable: {0}")]
    Unavailable(String),
    #[error("presence store rejected write: {0}")]
    Rejected(String),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("presence write timed out after {0:?}")]
    Timeout(Duration),
}

impl PersistenceError {
    /// Whether a later write of the same value could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Rejected(_) => "rejected",
            Self::UnknownDevice(_) => "unknown_device",
            Self::Timeout(_) => "timeout",
        }
    }
}
