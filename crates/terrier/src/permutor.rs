//! Keyed permutations over small integer ranges.
//!
//! [`IdPermutor`] streams every value of `[low, high]` exactly once per
//! cycle by encrypting a counter with a TEA-keyed balanced Feistel network,
//! cycle-walking past outputs that fall outside the range. The resolver
//! draws DNS transaction ids from it over `[1, 65535]`, so no id repeats
//! within 65535 consecutive queries on one socket.
//!
//! [`shuffle16`] is the companion tie-break shuffle: a tiny seeded Feistel
//! over 16-bit indices, used to randomize equal-priority nameserver
//! candidates deterministically for the lifetime of one iteration.

use rand::RngCore;

const TEA_DELTA: u32 = 0x9E37_79B9;
const TEA_ROUNDS: u32 = 32;
const FEISTEL_ROUNDS: u32 = 8;

fn tea_encrypt(mut v0: u32, mut v1: u32, key: &[u32; 4]) -> u32 {
    let mut sum = 0u32;
    for _ in 0..TEA_ROUNDS {
        sum = sum.wrapping_add(TEA_DELTA);
        v0 = v0.wrapping_add(
            (v1 << 4).wrapping_add(key[0]) ^ v1.wrapping_add(sum) ^ (v1 >> 5).wrapping_add(key[1]),
        );
        v1 = v1.wrapping_add(
            (v0 << 4).wrapping_add(key[2]) ^ v0.wrapping_add(sum) ^ (v0 >> 5).wrapping_add(key[3]),
        );
    }
    v0 ^ v1
}

/// A non-repeating id stream over `[low, high]`.
#[derive(Debug, Clone)]
pub struct IdPermutor {
    key: [u32; 4],
    counter: u32,
    low: u32,
    range: u32,
    half: u32,
    mask: u32,
}

impl IdPermutor {
    pub fn new(low: u16, high: u16, rng: &mut dyn RngCore) -> Self {
        let low = low as u32;
        let range = (high as u32) - low + 1;

        // Width is ceil(log2(range)) rounded up to even so the Feistel
        // halves are balanced.
        let mut width = 32 - (range - 1).leading_zeros();
        if width == 0 {
            width = 2;
        }
        if width % 2 != 0 {
            width += 1;
        }
        let half = width / 2;

        Self {
            key: [
                rng.next_u32() ^ rng.next_u32(),
                rng.next_u32() ^ rng.next_u32(),
                rng.next_u32() ^ rng.next_u32(),
                rng.next_u32() ^ rng.next_u32(),
            ],
            counter: 0,
            low,
            range,
            half,
            mask: (1u32 << half) - 1,
        }
    }

    /// The next id. Rejected (out of range) encryptions advance the counter
    /// and try again, so the accepted stream stays a permutation.
    pub fn step(&mut self) -> u16 {
        loop {
            let v = self.encrypt(self.counter);
            self.counter = (self.counter + 1) & ((1 << (self.half * 2)) - 1);
            if v < self.range {
                return (self.low + v) as u16;
            }
        }
    }

    fn encrypt(&self, x: u32) -> u32 {
        let mut l = (x >> self.half) & self.mask;
        let mut r = x & self.mask;
        for round in 0..FEISTEL_ROUNDS {
            let f = tea_encrypt(r, round, &self.key) & self.mask;
            (l, r) = (r, l ^ f);
        }
        (l << self.half) | r
    }
}

/// Deterministic rank for index `i` under `seed`: a 4-round Feistel over
/// the 16-bit index keyed from the seed. Sorting a set of indices by their
/// rank yields a seed-stable shuffle.
pub fn shuffle16(i: u16, seed: u32) -> u16 {
    let key = [
        seed,
        seed.rotate_left(11) ^ 0x5BD1_E995,
        !seed,
        seed.swap_bytes().wrapping_mul(0x0101_0101) | 1,
    ];
    let mut l = (i >> 8) as u32;
    let mut r = (i & 0xFF) as u32;
    for round in 0..4u32 {
        let f = tea_encrypt(r, round, &key) & 0xFF;
        (l, r) = (r, l ^ f);
    }
    ((l << 8) | r) as u16
}
