//! Server-push event stream framing.
//!
//! Every frame is one or more `data: ` lines terminated by a blank line.
//! `data: open` doubles as the greeting sent when a stream opens and the
//! periodic keepalive.

use std::fmt;

/// Payload of the keepalive / greeting frame.
pub const KEEPALIVE_PAYLOAD: &str = "open";

/// Payload delivered when a user triggers an action on a device.
pub const ACTION_PAYLOAD: &str = "action";

/// One encoded event-stream frame, ready to be written to a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame(String);

impl Frame {
    /// Encode an opaque payload. Multi-line payloads get one `data: ` line each
    /// so the receiver reassembles them into a single event.
    pub fn event(payload: &str) -> Self {
        let mut encoded = String::with_capacity(payload.len() + 8);
        for line in payload.split('\n') {
            encoded.push_str("data: ");
            encoded.push_str(line.strip_suffix('\r').unwrap_or(line));
            encoded.push('\n');
        }
        encoded.push('\n');
        Self(encoded)
    }

    pub fn keepalive() -> Self {
        Self::event(KEEPALIVE_PAYLOAD)
    }

    pub fn action() -> Self {
        Self::event(ACTION_PAYLOAD)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
