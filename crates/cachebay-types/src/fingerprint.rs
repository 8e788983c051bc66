//! Deterministic, order-dependent subtree fingerprints.
//!
//! A fingerprint is a pure function of (record-version, child-fingerprints)
//! using a fixed FNV-1a 32-bit mixer over each operand's little-endian
//! bytes. It is used for O(1) subtree-equality checks during structural
//! recycling (`spec.md` §4.7) and to gate re-emission to watchers.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Fingerprint(pub u32);

impl Fingerprint {
    pub const ZERO: Fingerprint = Fingerprint(0);
}

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a_fold(mut h: u32, bytes: &[u8]) -> u32 {
    for &b in bytes {
        h ^= b as u32;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Mixes a version (or other seed, e.g. 0 for plain arrays per `spec.md`
/// §4.5) with an ordered list of child fingerprints into a new fingerprint.
///
/// Order-dependent: `mix(v, [a, b])` and `mix(v, [b, a])` differ whenever
/// `a != b`. Deterministic: equal inputs always produce equal output,
/// which is what lets `Materializer` reuse a prior snapshot's object
/// reference instead of reconstructing an identical subtree.
pub fn mix(seed: u64, children: &[Fingerprint]) -> Fingerprint {
    let mut h = fnv1a_fold(FNV_OFFSET_BASIS, &seed.to_le_bytes());
    for child in children {
        h = fnv1a_fold(h, &child.0.to_le_bytes());
    }
    Fingerprint(h)
}

/// Fingerprints a leaf scalar value directly (no children), seeded by the
/// owning record's version so a scalar-only change still changes the
/// fingerprint even when no nested fingerprint participates.
pub fn mix_scalar(seed: u64, raw: &[u8]) -> Fingerprint {
    let h = fnv1a_fold(FNV_OFFSET_BASIS, &seed.to_le_bytes());
    Fingerprint(fnv1a_fold(h, raw))
}
