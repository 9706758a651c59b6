//! Decoding of located packets into a tagged output buffer.

pub mod decodebuffer;
pub mod stream;

pub use decodebuffer::{DecodeBuffer, DecodedByte, CONFIDENCE_LEVELS, CONFIDENCE_UNKNOWN};
pub use stream::decompress_packets;
