//! End-to-end round trips: reference-encoded streams must recover exactly,
//! at full confidence.

use std::io::Write;

use rand::{Rng, SeedableRng};

use crate::decoding::decodebuffer::CONFIDENCE_LEVELS;
use crate::recovery::{recover, RecoveryConfig};

fn deflate_level(data: &[u8], level: u32) -> Vec<u8> {
    let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::new(level));
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn recover_all(window: &[u8]) -> Vec<u8> {
    let config = RecoveryConfig::default();
    let result = recover(window, 0, window.len() * 8, true, true, None, None, &config)
        .expect("stream must be recoverable");
    assert!(result.clean, "reference stream must decode cleanly");
    assert!(
        result.bytes.iter().all(|b| b.confidence() == CONFIDENCE_LEVELS),
        "all bytes of an intact stream carry full confidence"
    );
    result.bytes.iter().map(|b| b.byte_value()).collect()
}

#[test]
fn stored_packet_hello() {
    // header 01, sizes 0005/FAFF, then the payload
    let window = [0x01, 0x05, 0x00, 0xFA, 0xFF, b'H', b'e', b'l', b'l', b'o'];
    assert_eq!(recover_all(&window), b"Hello");
}

#[test]
fn fixed_packet_aaaa() {
    // header 011, four fixed-code 'a's, then the 7-bit end-of-data code
    let window = deflate_level(b"aaaa", 1);
    assert_eq!(recover_all(&window), b"aaaa");
}

#[test]
fn repetitive_text_with_backreferences() {
    let text: Vec<u8> = (0..20_000u32)
        .map(|i| b"we promptly judged antique ivory buckles for the next prize. "[i as usize % 61])
        .collect();
    for &level in &[1u32, 6, 9] {
        let window = deflate_level(&text, level);
        assert_eq!(recover_all(&window), text, "level {}", level);
    }
}

#[test]
fn random_bytes_round_trip() {
    let mut rng = rand::rngs::SmallRng::seed_from_u64(7);
    for &size in &[1usize, 17, 1000, 30_000] {
        let data: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
        let window = deflate_level(&data, 6);
        assert_eq!(recover_all(&window), data, "size {}", size);
    }
}

#[test]
fn multi_packet_stream_round_trips() {
    // low compression and enough data forces several packets
    let mut rng = rand::rngs::SmallRng::seed_from_u64(99);
    let data: Vec<u8> = (0..100_000)
        .map(|_| {
            let c = rng.gen_range(0..32u8);
            if c < 26 {
                b'a' + c
            } else {
                b' '
            }
        })
        .collect();
    let window = deflate_level(&data, 1);
    assert_eq!(recover_all(&window), data);
}

#[test]
fn mixed_stored_and_compressed_packets() {
    // flate2 with level 0 emits stored packets
    let data: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
    let window = deflate_level(&data, 0);
    assert_eq!(recover_all(&window), data);
}
