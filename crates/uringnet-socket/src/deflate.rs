//! Payload compression contracts.
//!
//! The socket does not implement a codec; callers register a driver and
//! the pipelines apply it: the write deflater compresses each payload
//! as it is accepted, the read inflater replaces each received payload
//! with its expansion.

use uringnet_core::error::Result;

/// Compresses outgoing payloads.
pub trait Deflater: Send + Sync {
    fn deflate(&self, input: &[u8]) -> Result<Vec<u8>>;
}

/// Expands incoming payloads.
pub trait Inflater: Send + Sync {
    fn inflate(&self, input: &[u8]) -> Result<Vec<u8>>;
}
