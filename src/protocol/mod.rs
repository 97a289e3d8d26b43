//! Wire protocol for characteristic values.

pub mod codec;

pub use codec::{decode, encode, encode_text};
