//! A growable byte buffer with the WZ-specific encodings mirroring
//! [`crate::reader::BinaryReader`], plus the string-interning caches the
//! archive writer needs to reproduce the reader's string-or-offset scheme.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};

use crate::{encryption::Keystream, reader::encrypted_offset_mask};

/// A growable output buffer with WZ-specific writers.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current length of the buffer, i.e. the position the next write lands at.
    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    /// Consumes the writer, returning the accumulated bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Overwrites 4 already-written bytes at `pos` with `v`, little-endian —
    /// for patching a length or offset placeholder once it's known (§4.7).
    pub fn patch_u32(&mut self, pos: usize, v: u32) {
        LittleEndian::write_u32(&mut self.buf[pos..pos + 4], v);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        let mut tmp = [0u8; 2];
        LittleEndian::write_u16(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_i16(&mut self, v: i16) {
        let mut tmp = [0u8; 2];
        LittleEndian::write_i16(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_i32(&mut self, v: i32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_i32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_u32(&mut self, v: u32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_u64(&mut self, v: u64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_u64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_i64(&mut self, v: i64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_i64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_f32(&mut self, v: f32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_f32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_f64(&mut self, v: f64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_f64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    /// The in-band sentinel value: when a compressed int/long's one-byte form
    /// would itself equal this, the full-width follower form must be used.
    const SENTINEL: i8 = -128;

    /// Writes a compressed (variable-length) signed 32-bit integer.
    pub fn write_compressed_int(&mut self, v: i32) {
        if (i8::MIN as i32 + 1..=i8::MAX as i32).contains(&v) && v != Self::SENTINEL as i32 {
            self.write_i8(v as i8);
        } else {
            self.write_i8(Self::SENTINEL);
            self.write_i32(v);
        }
    }

    /// Writes a compressed (variable-length) signed 64-bit integer.
    pub fn write_compressed_long(&mut self, v: i64) {
        if (i8::MIN as i64 + 1..=i8::MAX as i64).contains(&v) && v != Self::SENTINEL as i64 {
            self.write_i8(v as i8);
        } else {
            self.write_i8(Self::SENTINEL);
            self.write_i64(v);
        }
    }

    /// Writes the length-discriminated, keystream-masked string form read by
    /// [`crate::reader::BinaryReader::read_encrypted_string`]. Selects the
    /// narrow (8-bit) branch when every character is ASCII, the wide
    /// (UTF-16) branch otherwise — the same choice a reader must infer from
    /// the length byte it emits.
    pub fn write_encrypted_string(&mut self, s: &str, keystream: &Keystream) {
        if s.is_empty() {
            self.write_i8(0);
            return;
        }
        if s.chars().all(|c| (c as u32) < 128) {
            self.write_narrow_string(s, keystream);
        } else {
            self.write_wide_string(s, keystream);
        }
    }

    fn write_narrow_string(&mut self, s: &str, keystream: &Keystream) {
        let len = s.len();
        if len < 128 {
            self.write_i8(-(len as i8));
        } else {
            self.write_i8(Self::SENTINEL);
            self.write_i32(len as i32);
        }
        for (i, b) in s.bytes().enumerate() {
            let mask = 0xAAu8.wrapping_add(i as u8);
            let ks = keystream.byte_at(i);
            self.write_u8(b ^ mask ^ ks);
        }
    }

    fn write_wide_string(&mut self, s: &str, keystream: &Keystream) {
        let units: Vec<u16> = s.encode_utf16().collect();
        let len = units.len();
        if len < 127 {
            self.write_i8(len as i8);
        } else {
            self.write_i8(127);
            self.write_i32(len as i32);
        }
        for (i, unit) in units.iter().enumerate() {
            let mask = 0xAAAAu16.wrapping_add(i as u16);
            let ks = u16::from_le_bytes([keystream.byte_at(i * 2), keystream.byte_at(i * 2 + 1)]);
            self.write_u16(unit ^ mask ^ ks);
        }
    }

    /// Writes the masked form of an absolute `target` offset that
    /// [`crate::reader::BinaryReader::read_encrypted_offset`] will invert,
    /// given the position the field is being written at.
    pub fn write_encrypted_offset(&mut self, target: u32, data_start: usize, version_hash: u32) {
        let position = self.pos();
        let mask = encrypted_offset_mask(position, data_start, version_hash);
        let rel = target.wrapping_sub(2u32.wrapping_mul(data_start as u32));
        self.write_u32(mask ^ rel);
    }
}

/// Discriminator byte written before a directory-entry or property name's
/// inline form.
pub const WITHOUT_OFFSET: u8 = 0x00;
/// Discriminator byte written before a directory-entry or property name's
/// offset-reference form.
pub const WITH_OFFSET: u8 = 0x01;

/// Strings shorter than this are always written inline; deduplication only
/// pays for itself past a handful of characters.
const INTERN_MIN_LEN: usize = 4;

/// Deduplicates property-name and string-value writes within a single image,
/// per §4.7.1: a string seen more than once is written once inline and
/// referenced thereafter by an offset relative to the data-section start.
/// Cleared at each image boundary.
///
/// An image is serialized into its own buffer (Pass 1) before its absolute
/// position in the archive is known (Pass 2 assigns that), so a back-reference
/// written here can't yet resolve to a true data-start-relative offset. Instead
/// it's recorded as a patch site — a position in this image's own buffer
/// holding a placeholder, and the intra-image offset it should ultimately
/// point at — which the archive writer resolves once the image's base offset
/// is known, the same way a block-length placeholder is patched after the
/// fact.
#[derive(Debug, Default)]
pub struct PropertyStringCache {
    offsets: HashMap<String, usize>,
    patches: Vec<(usize, usize)>,
}

impl PropertyStringCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
        self.patches.clear();
    }

    /// Writes `s` as a string-or-offset block: inline with discriminator
    /// `0x73`/`0x00` the first time, by 4-byte offset (discriminator
    /// `0x01`/`0x1B`) on every later occurrence.
    pub fn write(&mut self, out: &mut ByteWriter, s: &str, keystream: &Keystream) {
        if s.chars().count() <= INTERN_MIN_LEN {
            out.write_u8(0x73);
            out.write_encrypted_string(s, keystream);
            return;
        }
        if let Some(&target) = self.offsets.get(s) {
            out.write_u8(0x1B);
            let patch_pos = out.pos();
            out.write_i32(0);
            self.patches.push((patch_pos, target));
            return;
        }
        out.write_u8(0x73);
        let target = out.pos();
        self.offsets.insert(s.to_string(), target);
        out.write_encrypted_string(s, keystream);
    }

    /// Drains the patch sites recorded since the last [`clear`](Self::clear),
    /// each a `(position in the image buffer, intra-image target offset)`
    /// pair. The caller resolves each to an absolute, data-start-relative
    /// value once the image's base offset in the archive is known, and
    /// overwrites the placeholder at that position.
    pub fn take_patches(&mut self) -> Vec<(usize, usize)> {
        std::mem::take(&mut self.patches)
    }
}

/// The kind of directory-entry name being interned, so a `dir` and an
/// `image` sharing a name don't alias (§4.7.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Dir,
    Image,
}

/// Deduplicates directory-entry names the way [`PropertyStringCache`]
/// deduplicates property strings, keyed by `(kind, name)` and never cleared
/// (directory-entry interning spans the whole archive write).
///
/// Each directory is serialized into its own buffer (§4.7 Pass 2) before its
/// own position in the archive — let alone another directory's — is known, so
/// a repeat name's reference can't be written as a true offset yet. As with
/// [`PropertyStringCache`], it's recorded as a patch site: which directory's
/// buffer the placeholder lives in, the position within it, and which
/// directory's buffer (and position within that one) holds the first inline
/// occurrence it should end up pointing at. The caller resolves every patch
/// once every directory's final position is known (Pass 3).
#[derive(Debug, Default)]
pub struct EntryNameCache<D> {
    first_seen: HashMap<(EntryKind, String), (D, usize)>,
    patches: Vec<(D, usize, D, usize)>,
}

impl<D: Copy> EntryNameCache<D> {
    pub fn new() -> Self {
        Self {
            first_seen: HashMap::new(),
            patches: Vec::new(),
        }
    }

    /// Writes a directory-entry name. The first occurrence of a long (>4
    /// char) name is written inline with discriminator 3 (`dir`) or 4
    /// (`image`); a later repeat is written with discriminator 2, the
    /// offset-reference form, pointing back at the first occurrence's
    /// discriminator byte (the reader's discriminator-2 branch does
    /// `skip(1)` before reading the string, to skip that byte). `origin`
    /// identifies the directory buffer `out` is writing into.
    pub fn write(
        &mut self,
        out: &mut ByteWriter,
        kind: EntryKind,
        name: &str,
        keystream: &Keystream,
        origin: D,
    ) {
        let discriminator = match kind {
            EntryKind::Dir => 3u8,
            EntryKind::Image => 4u8,
        };
        if name.chars().count() <= INTERN_MIN_LEN {
            out.write_u8(discriminator);
            out.write_encrypted_string(name, keystream);
            return;
        }
        let key = (kind, name.to_string());
        if let Some(&(target_dir, target_offset)) = self.first_seen.get(&key) {
            out.write_u8(2);
            let patch_pos = out.pos();
            out.write_i32(0);
            self.patches.push((origin, patch_pos, target_dir, target_offset));
            return;
        }
        let offset = out.pos();
        self.first_seen.insert(key, (origin, offset));
        out.write_u8(discriminator);
        out.write_encrypted_string(name, keystream);
    }

    /// Drains the patch sites recorded across the whole write: each a
    /// `(directory holding the placeholder, position within it, directory
    /// holding the target string, intra-buffer offset of that string)`
    /// tuple, to resolve once every directory's absolute position is known.
    pub fn take_patches(&mut self) -> Vec<(D, usize, D, usize)> {
        std::mem::take(&mut self.patches)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::version::Variant;

    #[test]
    fn compressed_int_sentinel_emits_exact_bytes() {
        let mut w = ByteWriter::new();
        w.write_compressed_int(-128);
        assert_eq!(w.into_bytes(), vec![0x80, 0x80, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn compressed_int_small_value_is_one_byte() {
        let mut w = ByteWriter::new();
        w.write_compressed_int(42);
        assert_eq!(w.into_bytes(), vec![42]);
    }

    #[test]
    fn empty_string_is_single_zero_byte() {
        let ks = Keystream::new(Variant::Bms.iv());
        let mut w = ByteWriter::new();
        w.write_encrypted_string("", &ks);
        assert_eq!(w.into_bytes(), vec![0u8]);
    }

    #[test]
    fn encrypted_string_roundtrips_through_reader() {
        use crate::reader::BinaryReader;

        let ks = Arc::new(Keystream::new(Variant::Bms.iv()));
        for s in ["", "n", "hello world", "unicode: \u{1F600}"] {
            let mut w = ByteWriter::new();
            w.write_encrypted_string(s, &ks);
            let bytes: Arc<[u8]> = w.into_bytes().into();
            let mut r = BinaryReader::new(bytes, 0, ks.clone(), 0, 1);
            assert_eq!(r.read_encrypted_string().unwrap(), s);
        }
    }
}
