//! Brute-force location of DEFLATE packets in a damaged byte window.

pub mod corruption;
pub mod locator;
pub mod validator;

pub use corruption::{locate_corrupt_segments, DetectorContext, LanguageScorer};
pub use locator::{locate_packets, split_into_packets};
pub use validator::{classify_packet, valid_packet_header};
