//! Recovery of readable content from damaged DEFLATE streams.
//!
//! Conventional decompressors cannot resume from an unknown mid-stream
//! position: DEFLATE defines its symbol tables per packet and its
//! back-references depend on output that may be lost. This crate finds
//! packet boundaries by brute force, reconstructs the Huffman trees of
//! packets whose headers are gone, and uses bidirectional n-gram models to
//! assign values to bytes that could not be decoded directly.
//!
//! The entry point is [`recovery::recover`]; each returned byte is tagged
//! as a literal, an inferred literal with a confidence level, or an
//! unresolved position.

#![deny(trivial_casts, trivial_numeric_casts, rust_2018_idioms)]

pub mod bits;
pub mod decoding;
pub mod deflate;
pub mod errors;
pub mod huffman;
pub mod models;
pub mod packet;
pub mod partial;
pub mod reconstruct;
pub mod recovery;
pub mod scanning;
pub mod symtab;
mod tests;

pub use decoding::{DecodeBuffer, DecodedByte, CONFIDENCE_LEVELS, CONFIDENCE_UNKNOWN};
pub use errors::RecoveryError;
pub use models::Models;
pub use recovery::{recover, RecoveryConfig, RecoveryResult};
