//! The top-level recovery pipeline: locate packets in a damaged window,
//! decode what survives, reconstruct what does not.

use std::collections::HashMap;

use crate::decoding::decodebuffer::{DecodeBuffer, DecodedByte};
use crate::decoding::stream::decompress_packets;
use crate::errors::RecoveryError;
use crate::models::langmodel::Models;
use crate::packet::{CorruptionKind, PacketDescriptor};
use crate::partial::search::{search_partial_packet, PacketEvent, RecoveredPacket, SearchConfig};
use crate::reconstruct::inference::{DiscontinuityInfo, ReconstructionConfig, Reconstructor};
use crate::reconstruct::wildcards::TextEncoding;
use crate::scanning::corruption::{locate_corrupt_segments, DetectorContext, LanguageScorer};
use crate::scanning::locator::{locate_packets, split_into_packets};

/// Configuration bundle for one recovery run.
pub struct RecoveryConfig {
    pub perform_reconstruction: bool,
    /// Use the hypothesis search (instead of the cheap convergence scan)
    /// to resynchronize after mid-packet corruption, and attempt
    /// reconstruction of a headerless leading packet.
    pub reconstruct_partial_packet: bool,
    pub reconstruct_align_discontinuities: bool,
    pub use_word_model: bool,
    pub reconstruction_iterations: u32,
    /// Test fixtures may clip or corrupt known-good input; recovery proper
    /// never branches on this.
    pub test_mode: bool,
    pub deflate64: bool,
    pub encoding: TextEncoding,
    pub search: SearchConfig,
    /// Called every million search expansions.
    pub progress: Option<Box<dyn Fn(u64)>>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            perform_reconstruction: true,
            reconstruct_partial_packet: false,
            reconstruct_align_discontinuities: true,
            use_word_model: true,
            reconstruction_iterations: 1,
            test_mode: false,
            deflate64: false,
            encoding: TextEncoding::Latin1,
            search: SearchConfig::default(),
            progress: None,
        }
    }
}

/// A corrupted span, in compressed-byte offsets relative to its packet.
#[derive(Clone, Debug)]
pub struct CorruptionSpan {
    pub packet_bit_start: usize,
    pub start: u64,
    pub end: u64,
    pub kind: Option<CorruptionKind>,
}

/// The outcome of a recovery run.
pub struct RecoveryResult {
    /// Decoded output, each byte tagged with its provenance and
    /// confidence.
    pub bytes: Vec<DecodedByte>,
    pub corruption: Vec<CorruptionSpan>,
    pub packets: Vec<PacketDescriptor>,
    /// Every packet decoded without incident.
    pub clean: bool,
}

/// Replay a reconstructed headerless packet into the buffer: unknown
/// literal classes become shared unresolved origins, matches become
/// ordinary copies.
fn emit_recovered_packet(recovered: &RecoveredPacket, buffer: &mut DecodeBuffer) {
    let mut class_origins: HashMap<u16, u32> = HashMap::new();
    for event in &recovered.events {
        match *event {
            PacketEvent::UnknownLiteral { class } => match class_origins.get(&class) {
                Some(&origin) => buffer.push_unknown_again(origin),
                None => {
                    let origin = buffer.push_unknown();
                    class_origins.insert(class, origin);
                }
            },
            PacketEvent::Match { length, distance } => {
                if buffer.copy_reference(length, distance).is_err() {
                    // a mis-assigned symbol can push a copy out of range;
                    // keep what decoded so far
                    break;
                }
            }
        }
    }
}

/// Estimate lost output bytes per discontinuity from the corrupted spans
/// and the stream's overall compression ratio.
fn discontinuity_estimates(
    packets: &[PacketDescriptor],
    buffer: &DecodeBuffer,
    known_start: bool,
) -> Vec<DiscontinuityInfo> {
    let compressed_bytes: u64 = packets
        .iter()
        .map(|p| (p.length_bits() / 8) as u64)
        .sum::<u64>()
        .max(1);
    let output_bytes: u64 = packets.iter().map(|p| p.uncompressed_size).sum();
    let ratio = (output_bytes as f64 / compressed_bytes as f64).max(1.0);

    let spans: Vec<u64> = packets
        .iter()
        .filter(|p| p.contains_corruption())
        .map(|p| p.corruption_end.saturating_sub(p.corruption_start).max(1))
        .collect();
    let markers = buffer.discontinuities();
    let mut infos = Vec::with_capacity(markers.len());
    let mut span_iter = 0usize;
    for (i, &marker) in markers.iter().enumerate() {
        if i == 0 && !known_start {
            // the leading marker stands for the missing stream prefix, not
            // a measured span
            infos.push(DiscontinuityInfo {
                marker,
                approx_gap: buffer.reference_window() as u64,
                range: 0,
            });
            continue;
        }
        let span = spans.get(span_iter).copied().unwrap_or(64);
        span_iter = (span_iter + 1).min(spans.len().saturating_sub(1));
        let approx = (span as f64 * ratio) as u64;
        infos.push(DiscontinuityInfo {
            marker,
            approx_gap: approx,
            range: approx / 2 + 8,
        });
    }
    infos
}

/// Recover readable content from `window[bit_start..bit_end]`.
///
/// `known_start`/`known_end` say whether the window bounds are trusted
/// stream boundaries (a found container header, a found trailer) or merely
/// the edge of available data.
pub fn recover(
    window: &[u8],
    bit_start: usize,
    bit_end: usize,
    known_start: bool,
    known_end: bool,
    models: Option<&Models>,
    scorer: Option<&dyn LanguageScorer>,
    config: &RecoveryConfig,
) -> Result<RecoveryResult, RecoveryError> {
    let bit_end = bit_end.min(window.len() * 8);
    if bit_start >= bit_end {
        return Err(RecoveryError::NothingRecovered);
    }

    // segment the window into packets
    let mut packets: Vec<PacketDescriptor> = if known_end {
        locate_packets(window, bit_start, bit_end, config.deflate64)
    } else {
        split_into_packets(window, bit_start, bit_end, config.deflate64)
    };
    if known_end && known_start {
        // the region before the first located packet (or the whole window
        // when the backward scan found nothing) should itself be packets;
        // walk it forward
        let split_end = packets.first().map(|p| p.bit_start).unwrap_or(bit_end);
        if split_end > bit_start {
            let mut prefix = split_into_packets(window, bit_start, split_end, config.deflate64);
            prefix.extend(packets);
            packets = prefix;
        }
    }

    // a leading span with no parseable header may still hold most of a
    // packet; try to reconstruct its trees
    let mut leading_recovered: Option<RecoveredPacket> = None;
    if config.reconstruct_partial_packet {
        let search_end = packets.first().map(|p| p.bit_start).unwrap_or(bit_end);
        if search_end > bit_start + 64 {
            leading_recovered = search_partial_packet(
                window,
                bit_start,
                search_end,
                config.deflate64,
                &config.search,
                config.progress.as_deref(),
            );
        }
    }
    if packets.is_empty() && leading_recovered.is_none() {
        return Err(RecoveryError::NothingRecovered);
    }

    // flag corrupted spans inside the packets
    let word_model = if config.use_word_model {
        models.and_then(|m| m.word_model())
    } else {
        None
    };
    let ctx = DetectorContext {
        language: scorer,
        word_model,
        use_length_model: scorer.is_none() && word_model.is_none() && models.is_some(),
    };
    locate_corrupt_segments(window, &mut packets, &ctx);

    // decode
    let mut buffer = DecodeBuffer::new(config.deflate64);
    let mut clean = true;
    if let Some(recovered) = &leading_recovered {
        if !known_start || recovered.start_bit > bit_start {
            buffer.push_discontinuity(buffer.reference_window(), false);
        }
        emit_recovered_packet(recovered, &mut buffer);
        clean = false;
    }
    let effective_known_start = known_start && leading_recovered.is_none();
    if !decompress_packets(
        window,
        &packets,
        &mut buffer,
        effective_known_start || leading_recovered.is_some(),
        config.reconstruct_partial_packet,
    ) {
        clean = false;
    }
    if packets.iter().any(|p| p.contains_corruption()) {
        clean = false;
    }

    // reconstruct unresolved bytes
    if config.perform_reconstruction && buffer.num_origins() > 0 {
        let infos = discontinuity_estimates(&packets, &buffer, effective_known_start);
        let reconstruction = ReconstructionConfig {
            iterations: config.reconstruction_iterations,
            align_discontinuities: config.reconstruct_align_discontinuities,
            aggressive: true,
            use_local_models: true,
            encoding: config.encoding,
        };
        Reconstructor::new(models, reconstruction).reconstruct(&mut buffer, &infos);
    } else {
        buffer.finalize();
    }

    let corruption = packets
        .iter()
        .filter(|p| p.contains_corruption())
        .map(|p| CorruptionSpan {
            packet_bit_start: p.bit_start,
            start: p.corruption_start,
            end: p.corruption_end,
            kind: p.corruption_kind,
        })
        .collect();

    Ok(RecoveryResult {
        bytes: buffer.finalized_bytes(),
        corruption,
        packets,
        clean,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoding::decodebuffer::CONFIDENCE_LEVELS;

    fn deflate(data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut enc =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn text_sample(len: usize) -> Vec<u8> {
        let phrase = b"the five boxing wizards jump quickly over the lazy brown dog. ";
        (0..len).map(|i| phrase[i % phrase.len()]).collect()
    }

    #[test]
    fn round_trip_is_exact_and_fully_confident() {
        let text = text_sample(4000);
        let window = deflate(&text);
        let config = RecoveryConfig::default();
        let result = recover(
            &window,
            0,
            window.len() * 8,
            true,
            true,
            None,
            None,
            &config,
        )
        .unwrap();
        assert!(result.clean);
        assert!(result.corruption.is_empty());
        let recovered: Vec<u8> = result.bytes.iter().map(|b| b.byte_value()).collect();
        assert_eq!(recovered, text);
        assert!(result
            .bytes
            .iter()
            .all(|b| b.confidence() == CONFIDENCE_LEVELS));
    }

    #[test]
    fn zeroed_prefix_still_yields_tail_packets() {
        // compress enough low-redundancy text to span multiple packets,
        // then wipe the first quarter of the compressed stream
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::SmallRng::seed_from_u64(41);
        let text: Vec<u8> = (0..300_000)
            .map(|_| {
                let c = rng.gen_range(0..27u8);
                if c == 26 {
                    b' '
                } else {
                    b'a' + c
                }
            })
            .collect();
        let mut window = deflate(&text);
        let wipe = window.len() / 4;
        for b in window.iter_mut().take(wipe) {
            *b = 0;
        }
        let config = RecoveryConfig {
            perform_reconstruction: false,
            ..RecoveryConfig::default()
        };
        let result = recover(
            &window,
            0,
            window.len() * 8,
            false,
            true,
            None,
            None,
            &config,
        )
        .expect("packets after the wiped prefix must be recoverable");
        // the longest run of directly-decoded literals must be a substring
        // of the original text
        let values: Vec<(bool, u8)> = result
            .bytes
            .iter()
            .map(|b| (b.is_literal(), b.byte_value()))
            .collect();
        let mut best: (usize, usize) = (0, 0);
        let mut run_start = 0usize;
        for i in 0..=values.len() {
            let literal = i < values.len() && values[i].0;
            if !literal {
                if i - run_start > best.1 {
                    best = (run_start, i - run_start);
                }
                run_start = i + 1;
            }
        }
        assert!(best.1 >= 64, "expected a long run of decoded literals");
        let run: Vec<u8> = values[best.0..best.0 + best.1]
            .iter()
            .map(|&(_, v)| v)
            .collect();
        let found = text.windows(run.len()).any(|w| w == run.as_slice());
        assert!(found, "decoded literals must occur in the original text");
    }

    #[test]
    fn empty_window_is_an_error() {
        let window = [0u8; 0];
        let config = RecoveryConfig::default();
        assert!(matches!(
            recover(&window, 0, 0, true, true, None, None, &config),
            Err(RecoveryError::NothingRecovered)
        ));
    }

    #[test]
    fn junk_window_reports_nothing_recovered() {
        let window = [0xAEu8; 64];
        let config = RecoveryConfig::default();
        assert!(recover(
            &window,
            0,
            window.len() * 8,
            false,
            true,
            None,
            None,
            &config
        )
        .is_err());
    }
}
