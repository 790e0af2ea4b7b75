//! Regional encryption variants and the patch-version hash used to obfuscate
//! stored offsets.

/// A regional encryption variant, fixing the 4-byte IV fed into the keystream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// Global MapleStory client.
    Gms,
    /// Europe/SEA-region client, historically using a distinct IV.
    Ems,
    /// "Base" MapleStory variant with an all-zero IV (no encryption).
    Bms,
}

impl Variant {
    /// Every variant, in the order auto-detection tries them.
    pub const ALL: [Variant; 3] = [Variant::Gms, Variant::Ems, Variant::Bms];

    /// The 4-byte initialization vector for this variant's keystream.
    pub const fn iv(self) -> [u8; 4] {
        match self {
            Variant::Gms => [0x4D, 0x23, 0xC7, 0x2B],
            Variant::Ems => [0xB9, 0x7D, 0x63, 0xE9],
            Variant::Bms => [0x00, 0x00, 0x00, 0x00],
        }
    }
}

/// The fixed 32-byte AES-256 key every variant's keystream is derived under.
///
/// Every fourth byte carries a non-zero value; the rest are zero. This is the
/// key used across the WZ tooling ecosystem and is not a per-archive secret.
pub const USER_KEY: [u8; 32] = [
    0x13, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0xB4, 0x00, 0x00, 0x00,
    0x1B, 0x00, 0x00, 0x00, 0x0F, 0x00, 0x00, 0x00, 0x33, 0x00, 0x00, 0x00, 0x52, 0x00, 0x00, 0x00,
];

/// Constant subtracted (mod 2^32) while obfuscating a stored directory/image offset.
pub const OFFSET_MAGIC: u32 = 0x581C3F6D;

/// Fixed copyright string written into every emitted archive's header.
pub const COPYRIGHT: &str = "Package file v1.0 Copyright 2002 Wizet, ZMS";

/// The lowest and highest 64-bit-client synthetic patch versions auto-detection tries.
pub const CANDIDATE_VERSIONS_64BIT: std::ops::Range<u16> = 770..780;

/// The synthetic version header written for a 64-bit-layout archive (read-only; the
/// writer never emits this form, per the 64-bit-write non-goal).
pub const SYNTHETIC_VERSION_HEADER_64BIT: u16 = 770;

/// Derives the 32-bit version hash from a patch version's decimal digits.
///
/// `hash = 0; for c in digits(version): hash = hash * 32 + c + 1 (mod 2^32)`.
pub fn version_hash(patch_version: u16) -> u32 {
    let mut hash: u32 = 0;
    for c in patch_version.to_string().bytes() {
        hash = hash
            .wrapping_mul(32)
            .wrapping_add(c as u32)
            .wrapping_add(1);
    }
    hash
}

/// Folds a version hash down to the single byte a classic-layout archive
/// stores as its "version header".
pub fn version_header_byte(hash: u32) -> u8 {
    let [b0, b1, b2, b3] = hash.to_le_bytes();
    !(b3 ^ b2 ^ b1 ^ b0)
}

/// Candidate patch versions auto-detection tries, for a classic (non-64-bit) archive,
/// in the order the original client tooling checks them: 83 first (the longest-lived
/// GMS patch era), then ascending from 1, skipping 83 on the second pass.
pub fn candidate_versions_classic() -> impl Iterator<Item = u16> {
    std::iter::once(83).chain((1..500u16).filter(|&v| v != 83))
}
