use std::sync::Mutex;

use aes::{
    Aes256,
    cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray},
};

use crate::version::USER_KEY;

/// Bytes generated per keystream extension.
const BATCH: usize = 4096;

/// An expandable XOR keystream keyed by a 4-byte IV and the crate's fixed
/// 32-byte user key.
///
/// If the IV is all zeros the stream is all zeros (the "no encryption"
/// variant). Otherwise the stream is the concatenation of repeated
/// AES-256 single-block encryptions: the first block is the IV tiled four
/// times, and every later block is the immediately preceding ciphertext.
/// Blocks are generated lazily in 4 KiB batches as callers request bytes
/// further into the stream.
pub struct Keystream {
    cipher: Option<Aes256>,
    iv: [u8; 4],
    bytes: Mutex<Vec<u8>>,
}

impl Keystream {
    /// Builds a keystream generator for the given IV. Construction is cheap;
    /// no key schedule or block encryption happens until a byte is requested.
    pub fn new(iv: [u8; 4]) -> Self {
        let cipher = if iv == [0, 0, 0, 0] {
            None
        } else {
            Some(Aes256::new(GenericArray::from_slice(&USER_KEY)))
        };
        Self {
            cipher,
            iv,
            bytes: Mutex::new(Vec::new()),
        }
    }

    /// Returns the keystream byte at index `i`, extending the stream in 4 KiB
    /// batches if it has not been generated that far yet.
    pub fn byte_at(&self, i: usize) -> u8 {
        self.ensure_len(i + 1);
        self.bytes.lock().unwrap()[i]
    }

    /// Copies `len` consecutive keystream bytes starting at `start` into `out`.
    pub fn fill(&self, start: usize, out: &mut [u8]) {
        self.ensure_len(start + out.len());
        out.copy_from_slice(&self.bytes.lock().unwrap()[start..start + out.len()]);
    }

    fn ensure_len(&self, min_len: usize) {
        let Some(cipher) = &self.cipher else {
            let mut bytes = self.bytes.lock().unwrap();
            if bytes.len() < min_len {
                bytes.resize(min_len, 0);
            }
            return;
        };

        let mut bytes = self.bytes.lock().unwrap();
        if bytes.len() >= min_len {
            return;
        }

        let mut block = if bytes.is_empty() {
            let mut tiled = [0u8; 16];
            for chunk in tiled.chunks_exact_mut(4) {
                chunk.copy_from_slice(&self.iv);
            }
            tiled
        } else {
            let mut last = [0u8; 16];
            last.copy_from_slice(&bytes[bytes.len() - 16..]);
            last
        };

        let target = min_len.div_ceil(BATCH) * BATCH;
        while bytes.len() < target {
            let mut ga = GenericArray::clone_from_slice(&block);
            cipher.encrypt_block(&mut ga);
            block.copy_from_slice(ga.as_slice());
            bytes.extend_from_slice(&block);
        }
    }
}
