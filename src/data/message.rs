//! Inbound message payloads.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A decoded inbound notification payload.
///
/// The session does not impose a schema above the byte level; callers
/// interpret `data` themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Decoded payload bytes.
    pub data: Bytes,
    /// Time the notification was received.
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            received_at: Utc::now(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Interpret the payload as UTF-8 text, if it is valid.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Result of a send request.
///
/// Sending without a ready connection is not an error in this session
/// model, so it is reported as an outcome instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The peripheral acknowledged the write.
    Sent,
    /// No device was connected; nothing was written.
    NoActiveConnection,
}

impl SendOutcome {
    /// Check if the write went out.
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}
