use criterion::{black_box, criterion_group, criterion_main, Criterion};

use reflate::bits::BitCursor;
use reflate::symtab::SymbolTable;

fn bitcursor_reads(c: &mut Criterion) {
    let data: Vec<u8> = (0..64 * 1024u32).map(|i| (i * 2654435761) as u8).collect();
    c.bench_function("next_bits_7", |b| {
        b.iter(|| {
            let mut cur = BitCursor::new(&data);
            let mut acc = 0u32;
            for _ in 0..(data.len() * 8 / 7) {
                acc = acc.wrapping_add(cur.next_bits(7));
            }
            black_box(acc)
        })
    });
    c.bench_function("get_bits_reversed_15", |b| {
        b.iter(|| {
            let mut acc = 0u32;
            for bit in (0..data.len() * 8 - 15).step_by(13) {
                acc = acc.wrapping_add(BitCursor::at_bit(&data, bit).get_bits_reversed(15));
            }
            black_box(acc)
        })
    });
}

fn fixed_tree_decode(c: &mut Criterion) {
    // decodable stream: fixed-huffman codes for a repeating byte sequence
    let symtab = SymbolTable::fixed(false);
    let mut bits: Vec<bool> = Vec::new();
    for i in 0..20_000u32 {
        let code = symtab
            .literal_tree()
            .code_for((b'a' + (i % 26) as u8) as u16)
            .unwrap();
        for k in (0..code.length()).rev() {
            bits.push((code.value() >> k) & 1 != 0);
        }
    }
    let mut data = vec![0u8; bits.len() / 8 + 1];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            data[i / 8] |= 1 << (i % 8);
        }
    }
    c.bench_function("fixed_tree_next_symbol", |b| {
        b.iter(|| {
            let mut cur = BitCursor::new(&data);
            let end = BitCursor::at_end(&data);
            let mut acc = 0u32;
            for _ in 0..20_000 {
                acc = acc.wrapping_add(symtab.next_symbol(&mut cur, &end).unwrap() as u32);
            }
            black_box(acc)
        })
    });
}

criterion_group!(benches, bitcursor_reads, fixed_tree_decode);
criterion_main!(benches);
