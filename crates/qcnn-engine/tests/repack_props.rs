// SPDX-License-Identifier: AGPL-3.0-only

//! Width conversion properties
//!
//! The ingest and egress stages rely on these: any W1 → W2 → W1 round trip
//! reproduces the original words, followed only by zero padding.

use proptest::prelude::*;
use qcnn_core::repack::{repack, repacked_len};
use qcnn_core::BitWord;

fn word_stream() -> impl Strategy<Value = (usize, Vec<BitWord>)> {
    (1usize..=96).prop_flat_map(|width| {
        let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
        (
            Just(width),
            prop::collection::vec(any::<u64>(), 0..24).prop_map(move |values| {
                values
                    .into_iter()
                    .map(|v| BitWord::from_u64(width, v & mask))
                    .collect()
            }),
        )
    })
}

proptest! {
    #[test]
    fn round_trip_keeps_prefix((w1, words) in word_stream(), w2 in 1usize..=600) {
        let there = repack(&words, w1, w2);
        prop_assert_eq!(there.len(), repacked_len(words.len(), w1, w2));

        let back = repack(&there, w2, w1);
        prop_assert!(back.len() >= words.len());
        prop_assert_eq!(&back[..words.len()], &words[..]);
        prop_assert!(back[words.len()..].iter().all(BitWord::is_zero));
    }

    #[test]
    fn total_ones_preserved((w1, words) in word_stream(), w2 in 1usize..=600) {
        let ones: u32 = words.iter().map(BitWord::count_ones).sum();
        let there: u32 = repack(&words, w1, w2).iter().map(BitWord::count_ones).sum();
        prop_assert_eq!(ones, there);
    }
}

#[test]
fn reference_ingest_conversion() {
    // 14 lines × 448 bits of 8-bit pixels become 784 pixel elements
    let lines: Vec<BitWord> = (0..14u64)
        .map(|i| BitWord::from_fields(8, &vec![i; 56]))
        .collect();
    let pixels = repack(&lines, 448, 8);
    assert_eq!(pixels.len(), 784);
    assert_eq!(pixels[56 * 3].get(0, 8), 3);
    assert_eq!(repack(&pixels, 8, 448), lines);
}
