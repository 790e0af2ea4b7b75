//! A positioned cursor over an immutable, shared archive buffer, plus the
//! WZ-specific variable-length encodings layered on top of it.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::{Error, encryption::Keystream, error::Result};

/// A reference-counted, read-only archive buffer, shared by every lazily
/// loaded image and canvas node so the tree never copies bytes it doesn't
/// need to. `Arc` (rather than `Rc`) keeps the tree transferable to another
/// thread by ownership, per the crate's concurrency model.
pub type SharedBuffer = Arc<[u8]>;

/// A cursor over a [`SharedBuffer`] with WZ-specific decoding built in.
///
/// Cheap to clone: cloning duplicates the `Arc` buffer handle and the current
/// cursor position, not the underlying bytes.
#[derive(Clone)]
pub struct BinaryReader {
    buf: SharedBuffer,
    pos: usize,
    keystream: Arc<Keystream>,
    /// Offset base ("fStart") every string-or-offset block and encrypted
    /// offset is relativized against.
    pub data_start: usize,
    pub version_hash: u32,
}

impl BinaryReader {
    /// Builds a reader positioned at `pos` over `buf`.
    pub fn new(
        buf: SharedBuffer,
        pos: usize,
        keystream: Arc<Keystream>,
        data_start: usize,
        version_hash: u32,
    ) -> Self {
        Self {
            buf,
            pos,
            keystream,
            data_start,
            version_hash,
        }
    }

    /// The full backing buffer.
    pub fn buffer(&self) -> &SharedBuffer {
        &self.buf
    }

    /// The keystream this reader decrypts strings with.
    pub fn keystream(&self) -> &Arc<Keystream> {
        &self.keystream
    }

    /// Current cursor position.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Moves the cursor to an absolute position.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Runs `f` with the cursor temporarily moved to `pos`, restoring the
    /// original position afterward regardless of `f`'s outcome.
    pub fn with_position_at<T>(
        &mut self,
        pos: usize,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let saved = self.pos;
        self.pos = pos;
        let result = f(self);
        self.pos = saved;
        result
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(Error::TruncatedInput { at: self.pos })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Reads `len` raw bytes without decryption.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    /// Skips `len` bytes without interpreting them.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len)?;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    /// Reads a null-terminated, single-byte-character string.
    pub fn read_cstring(&mut self) -> Result<String> {
        let start = self.pos;
        let nul = self.buf[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::TruncatedInput { at: start })?;
        let s = String::from_utf8_lossy(&self.buf[start..start + nul]).into_owned();
        self.pos = start + nul + 1;
        Ok(s)
    }

    /// Reads a fixed-length, single-byte-character string (no terminator).
    pub fn read_fixed_string(&mut self, len: usize) -> Result<String> {
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    /// Sentinel that, in place of the one-byte inline value, signals a
    /// following 4-byte `i32` (or `i64`, for compressed long) follower.
    const COMPRESSED_SENTINEL: i8 = -128;

    /// Reads a compressed (variable-length) signed 32-bit integer.
    pub fn read_compressed_int(&mut self) -> Result<i32> {
        let b = self.read_i8()?;
        if b == Self::COMPRESSED_SENTINEL {
            self.read_i32()
        } else {
            Ok(b as i32)
        }
    }

    /// Reads a compressed (variable-length) signed 64-bit integer.
    pub fn read_compressed_long(&mut self) -> Result<i64> {
        let b = self.read_i8()?;
        if b == Self::COMPRESSED_SENTINEL {
            self.read_i64()
        } else {
            Ok(b as i64)
        }
    }

    /// Reads the length-discriminated, keystream-masked string used for
    /// property names and string values (§4.2 "Encrypted string").
    pub fn read_encrypted_string(&mut self) -> Result<String> {
        let len_byte = self.read_i8()?;
        if len_byte == 0 {
            return Ok(String::new());
        }
        if len_byte > 0 {
            let len = if len_byte == 127 {
                self.read_i32()? as usize
            } else {
                len_byte as usize
            };
            self.read_wide_string(len)
        } else if len_byte == -128 {
            let len = self.read_i32()? as usize;
            self.read_narrow_string(len)
        } else {
            let len = (-(len_byte as i32)) as usize;
            self.read_narrow_string(len)
        }
    }

    fn read_wide_string(&mut self, len: usize) -> Result<String> {
        let mut units = Vec::with_capacity(len);
        for i in 0..len {
            let raw = self.read_u16()?;
            let mask = 0xAAAAu16.wrapping_add(i as u16);
            let ks = u16::from_le_bytes([
                self.keystream.byte_at(i * 2),
                self.keystream.byte_at(i * 2 + 1),
            ]);
            units.push(raw ^ mask ^ ks);
        }
        Ok(String::from_utf16_lossy(&units))
    }

    fn read_narrow_string(&mut self, len: usize) -> Result<String> {
        let mut bytes = Vec::with_capacity(len);
        for i in 0..len {
            let raw = self.read_u8()?;
            let mask = 0xAAu8.wrapping_add(i as u8);
            let ks = self.keystream.byte_at(i);
            bytes.push(raw ^ mask ^ ks);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads the discriminator-prefixed name block used for directory-entry
    /// and property names (§4.2 "String-or-offset block"): either an inline
    /// encrypted string, or a 4-byte offset (relative to `data_start`) to one
    /// stored elsewhere, with the cursor restored afterward.
    pub fn read_string_or_offset_block(&mut self) -> Result<String> {
        let discriminator = self.read_u8()?;
        match discriminator {
            0x00 | 0x73 => self.read_encrypted_string(),
            0x01 | 0x1B => {
                let rel = self.read_i32()?;
                let at = self.data_start + rel as usize;
                self.with_position_at(at, |r| r.read_encrypted_string())
            }
            _ => Ok(String::new()),
        }
    }

    /// Reads and un-obfuscates a 4-byte encrypted offset into an absolute
    /// buffer position (§4.2 "Encrypted offset").
    pub fn read_encrypted_offset(&mut self) -> Result<u32> {
        let read_pos = self.pos;
        let masked = encrypted_offset_mask(read_pos, self.data_start, self.version_hash);
        let stored = self.read_u32()?;
        let recovered = stored ^ masked;
        Ok(recovered.wrapping_add(2u32.wrapping_mul(self.data_start as u32)))
    }
}

/// The position-dependent XOR mask shared by reading and writing an
/// encrypted offset: `rotate_left(((pos_rel ^ !0) * version_hash) - MAGIC, low 5 bits)`.
pub(crate) fn encrypted_offset_mask(position: usize, data_start: usize, version_hash: u32) -> u32 {
    let pos_rel = (position - data_start) as u32;
    let x = pos_rel ^ 0xFFFF_FFFFu32;
    let x = x.wrapping_mul(version_hash);
    let x = x.wrapping_sub(crate::version::OFFSET_MAGIC);
    x.rotate_left(x & 0x1F)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Variant;

    #[test]
    fn compressed_int_roundtrips_small_and_sentinel() {
        let ks = Arc::new(Keystream::new(Variant::Bms.iv()));
        let mut data = vec![5i8 as u8];
        data.extend_from_slice(&[0x80, 0x80, 0xFF, 0xFF, 0xFF]);
        let shared: Arc<[u8]> = data.into();
        let mut r = BinaryReader::new(shared, 0, ks, 0, 1);
        assert_eq!(r.read_compressed_int().unwrap(), 5);
        assert_eq!(r.read_compressed_int().unwrap(), -128);
    }

    #[test]
    fn encrypted_offset_mask_inverts_with_same_position() {
        let version_hash = 0x6B4F_2A31u32;
        let data_start = 0x4Cusize;
        let position = 0x100usize;
        let target = 0x2000u32;

        let mask = encrypted_offset_mask(position, data_start, version_hash);
        let stored = mask ^ target.wrapping_sub(2 * data_start as u32);

        let recovered_mask = encrypted_offset_mask(position, data_start, version_hash);
        let recovered = (stored ^ recovered_mask).wrapping_add(2 * data_start as u32);
        assert_eq!(recovered, target);
    }

    #[test]
    fn empty_encrypted_string_is_single_zero_byte() {
        let shared: Arc<[u8]> = vec![0u8].into();
        let ks = Arc::new(Keystream::new(Variant::Bms.iv()));
        let mut r = BinaryReader::new(shared, 0, ks, 0, 1);
        assert_eq!(r.read_encrypted_string().unwrap(), "");
    }
}
