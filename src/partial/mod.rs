//! Reconstruction of packets whose headers are missing or corrupted.
//!
//! The searcher walks backwards from a presumed end-of-data marker,
//! growing literal and distance tree hypotheses jointly with the symbol
//! stream they must explain. Tree hypotheses are immutable and interned;
//! search nodes are deduplicated before entering the frontier.

pub mod hypothesis;
pub mod queue;
pub mod search;
pub mod tree_hypothesis;

pub use queue::SearchMode;
pub use search::{
    longest_suffix_with_trees, search_partial_packet, PacketEvent, RecoveredPacket, SearchConfig,
};
