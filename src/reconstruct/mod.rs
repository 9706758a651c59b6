//! Statistical reconstruction of unresolved bytes in recovered output.

pub mod inference;
pub mod scores;
pub mod wildcards;

pub use inference::{DiscontinuityInfo, ReconstructionConfig, Reconstructor};
pub use wildcards::{TextEncoding, WildcardCollection, WildcardSet};
