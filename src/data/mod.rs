//! Data types for session state and payloads.

pub mod message;
pub mod peripheral;

pub use message::{Message, SendOutcome};
pub use peripheral::PeripheralHandle;
