//! The crate-level error type. Low-level validators report failures as
//! `None`/module errors and recovery keeps going; this type surfaces only
//! the outcomes a caller can meaningfully react to.

use crate::decoding::decodebuffer::BufferError;
use crate::huffman::HuffmanError;
use crate::packet::CorruptionKind;
use crate::symtab::SymbolTableError;

#[derive(Debug)]
pub enum RecoveryError {
    /// Packet-type bits are reserved or a dynamic header violates its
    /// constraints.
    InvalidHeader,
    /// A bit-length vector cannot form a canonical Huffman tree.
    InvalidTree(HuffmanError),
    /// A back-reference decodes out of range.
    InvalidSymbol,
    /// The bitstream ran out mid-packet without an end-of-data marker.
    UnexpectedEndOfStream,
    /// A detector fired; the offset is approximate.
    CorruptionDetected {
        offset: u64,
        kind: CorruptionKind,
    },
    /// The partial-packet search found nothing above the retention floor.
    ExhaustedSearch,
    /// A size or iteration cap was hit before recovery finished.
    ResourceLimit,
    /// The entire window yielded nothing decodable.
    NothingRecovered,
}

impl core::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RecoveryError::InvalidHeader => write!(f, "invalid packet header"),
            RecoveryError::InvalidTree(e) => write!(f, "invalid Huffman tree: {}", e),
            RecoveryError::InvalidSymbol => {
                write!(f, "back-reference length or distance out of range")
            }
            RecoveryError::UnexpectedEndOfStream => {
                write!(f, "bitstream ended mid-packet without end-of-data")
            }
            RecoveryError::CorruptionDetected { offset, kind } => {
                write!(f, "corruption ({}) detected near offset {}", kind, offset)
            }
            RecoveryError::ExhaustedSearch => {
                write!(f, "partial-packet search exhausted without a usable hypothesis")
            }
            RecoveryError::ResourceLimit => write!(f, "resource limit reached"),
            RecoveryError::NothingRecovered => {
                write!(f, "no DEFLATE packets could be recovered from the window")
            }
        }
    }
}

impl std::error::Error for RecoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecoveryError::InvalidTree(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HuffmanError> for RecoveryError {
    fn from(e: HuffmanError) -> Self {
        match e {
            HuffmanError::UnexpectedEnd => RecoveryError::UnexpectedEndOfStream,
            HuffmanError::InvalidCode => RecoveryError::InvalidSymbol,
            other => RecoveryError::InvalidTree(other),
        }
    }
}

impl From<SymbolTableError> for RecoveryError {
    fn from(e: SymbolTableError) -> Self {
        match e {
            SymbolTableError::InvalidHeader | SymbolTableError::InvalidBitLengths => {
                RecoveryError::InvalidHeader
            }
            SymbolTableError::InvalidTree(e) => RecoveryError::InvalidTree(e),
            SymbolTableError::UnexpectedEnd => RecoveryError::UnexpectedEndOfStream,
        }
    }
}

impl From<BufferError> for RecoveryError {
    fn from(_: BufferError) -> Self {
        RecoveryError::InvalidSymbol
    }
}
