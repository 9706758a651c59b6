//! Recovery behavior on deliberately damaged streams.

use std::io::Write;

use crate::packet::CorruptionKind;
use crate::recovery::{recover, RecoveryConfig};

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn sample_text(len: usize) -> Vec<u8> {
    let phrase = b"grumpy wizards make toxic brew for the evil queen and jack. ";
    (0..len).map(|i| phrase[i % phrase.len()]).collect()
}

#[test]
fn overwritten_middle_is_flagged_and_prefix_survives() {
    // lightly-compressible text keeps the compressed stream large enough
    // to wipe a span without touching either end
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::SmallRng::seed_from_u64(5);
    let text: Vec<u8> = (0..60_000)
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
    assert!(window.len() > 2000, "need a reasonably sized stream");
    // wipe 300 compressed bytes in the middle with 0xFF, an unreadable
    // sector pattern
    let damage_start = window.len() / 2;
    for b in window.iter_mut().skip(damage_start).take(300) {
        *b = 0xFF;
    }
    let config = RecoveryConfig {
        perform_reconstruction: false,
        ..RecoveryConfig::default()
    };
    let result = recover(&window, 0, window.len() * 8, true, true, None, None, &config)
        .expect("partial recovery must succeed");
    assert!(!result.clean);
    assert!(
        result
            .corruption
            .iter()
            .any(|s| s.kind == Some(CorruptionKind::RepeatedBytes)),
        "the repeated-byte detector must flag the wiped span"
    );
    // the decoded output must reproduce the original text up to the damage
    let literals: Vec<u8> = result
        .bytes
        .iter()
        .take_while(|b| b.is_literal())
        .map(|b| b.byte_value())
        .collect();
    assert!(literals.len() > 1000, "a substantial prefix must decode");
    assert_eq!(&text[..literals.len()], literals.as_slice());
}

#[test]
fn truncated_stream_gets_a_banner() {
    let text = sample_text(20_000);
    let window = deflate(&text);
    // drop the final ten bytes: the last packet never finishes
    let truncated = &window[..window.len() - 10];
    let config = RecoveryConfig {
        perform_reconstruction: false,
        ..RecoveryConfig::default()
    };
    let result = recover(
        truncated,
        0,
        truncated.len() * 8,
        true,
        false,
        None,
        None,
        &config,
    );
    if let Ok(result) = result {
        let tail: Vec<u8> = result
            .bytes
            .iter()
            .rev()
            .take(300)
            .map(|b| b.byte_value())
            .collect();
        let tail: Vec<u8> = tail.into_iter().rev().collect();
        let needle = b"End of Compressed Stream";
        assert!(
            tail.windows(needle.len()).any(|w| w == needle),
            "truncated recovery must end with the stream notice"
        );
    }
}

#[test]
fn descriptor_chain_reports_offsets_in_order() {
    let text = sample_text(120_000);
    let window = deflate(&text);
    let config = RecoveryConfig {
        perform_reconstruction: false,
        ..RecoveryConfig::default()
    };
    let result = recover(&window, 0, window.len() * 8, true, true, None, None, &config).unwrap();
    let mut prev_end = 0usize;
    for p in &result.packets {
        assert!(p.bit_start >= prev_end, "packets must not overlap");
        prev_end = p.bit_end;
    }
    assert_eq!(
        result.packets.iter().filter(|p| p.is_last).count(),
        1,
        "exactly one terminal packet"
    );
    let total: u64 = result.packets.iter().map(|p| p.uncompressed_size).sum();
    assert_eq!(total, text.len() as u64);
}
