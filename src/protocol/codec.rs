//! Transport-safe wire encoding.
//!
//! Characteristic values cross the backend boundary as standard base64
//! text (RFC 4648, padded). Outbound text is encoded before the write and
//! inbound payloads are decoded before being handed upward.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;

use crate::error::{Error, Result};

/// Encode raw bytes to the transport-safe representation.
///
/// # Example
///
/// ```
/// use ble_session::protocol::encode;
///
/// assert_eq!(encode(b"Hello"), "SGVsbG8=");
/// ```
pub fn encode(data: impl AsRef<[u8]>) -> String {
    BASE64_STANDARD.encode(data)
}

/// Encode a text message for transmission.
pub fn encode_text(message: &str) -> String {
    encode(message.as_bytes())
}

/// Decode a transport-safe payload back to raw bytes.
///
/// Surrounding whitespace is ignored; anything else outside the base64
/// alphabet is rejected.
///
/// # Errors
///
/// Returns [`Error::InvalidEncoding`] if the payload is not valid base64.
pub fn decode(encoded: impl AsRef<str>) -> Result<Vec<u8>> {
    let encoded = encoded.as_ref().trim();

    BASE64_STANDARD
        .decode(encoded)
        .map_err(|e| Error::InvalidEncoding {
            context: e.to_string(),
        })
}
