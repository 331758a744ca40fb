//! AES-256 in counter mode, one stateful context per stream direction.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;

/// Key size in bytes.
pub const KEY_SIZE: usize = 32;
/// Initialisation vector (initial counter block) size in bytes.
pub const IVEC_SIZE: usize = 16;

const BLOCK_SIZE: usize = 16;

/// Stateful AES-256-CTR transform for one direction of a byte stream.
///
/// The context is a pure transform: [`crypt`](Self::crypt) XORs its input
/// with the keystream and advances the stream position by exactly the input
/// length, so encrypting and decrypting are the same operation. Installing
/// key or ivec material rewinds the keystream to the start.
pub struct AesCtrContext {
    cipher:      Option<Aes256>,
    ivec:        [u8; IVEC_SIZE],
    counter:     [u8; IVEC_SIZE],
    block:       [u8; BLOCK_SIZE],
    /// Bytes of `block` already consumed; `BLOCK_SIZE` forces a refill.
    used:        usize,
    description: &'static str,
}

impl AesCtrContext {
    pub fn new() -> Self {
        Self {
            cipher:      None,
            ivec:        [0u8; IVEC_SIZE],
            counter:     [0u8; IVEC_SIZE],
            block:       [0u8; BLOCK_SIZE],
            used:        BLOCK_SIZE,
            description: "",
        }
    }

    /// Attach a short label ("client read", …) used in log lines.
    pub fn set_description(&mut self, description: &'static str) {
        self.description = description;
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    pub fn has_key(&self) -> bool {
        self.cipher.is_some()
    }

    /// Install the 256-bit key. Rewinds the keystream.
    pub fn set_key(&mut self, key: &[u8; KEY_SIZE]) {
        self.cipher = Some(Aes256::new(GenericArray::from_slice(key)));
        self.rewind();
    }

    /// Install the initial counter block. Rewinds the keystream.
    pub fn set_ivec(&mut self, ivec: &[u8; IVEC_SIZE]) {
        self.ivec = *ivec;
        self.rewind();
    }

    fn rewind(&mut self) {
        self.counter = self.ivec;
        self.used = BLOCK_SIZE;
    }

    /// XOR `data` with the keystream, returning the transformed copy.
    pub fn crypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.crypt_in_place(&mut out);
        out
    }

    /// XOR `data` with the keystream in place.
    pub fn crypt_in_place(&mut self, data: &mut [u8]) {
        let Some(cipher) = self.cipher.as_ref() else {
            log::error!(
                "[aes-ctr] crypt() invoked before key material was installed ({})",
                self.description
            );
            return;
        };
        for byte in data.iter_mut() {
            if self.used == BLOCK_SIZE {
                self.block = self.counter;
                cipher.encrypt_block(GenericArray::from_mut_slice(&mut self.block));
                increment_be(&mut self.counter);
                self.used = 0;
            }
            *byte ^= self.block[self.used];
            self.used += 1;
        }
    }
}

impl Default for AesCtrContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AesCtrContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AesCtrContext({}, keyed: {})",
            self.description,
            self.has_key()
        )
    }
}

/// Big-endian increment of the counter block, as standard CTR requires.
fn increment_be(counter: &mut [u8; IVEC_SIZE]) {
    for byte in counter.iter_mut().rev() {
        let (next, overflow) = byte.overflowing_add(1);
        *byte = next;
        if !overflow {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // AES-256-CTR vector from NIST SP 800-38A, section F.5.5.
    const KEY: [u8; 32] = [
        0x60, 0x3d, 0xeb, 0x10, 0x15, 0xca, 0x71, 0xbe, 0x2b, 0x73, 0xae, 0xf0, 0x85, 0x7d,
        0x77, 0x81, 0x1f, 0x35, 0x2c, 0x07, 0x3b, 0x61, 0x08, 0xd7, 0x2d, 0x98, 0x10, 0xa3,
        0x09, 0x14, 0xdf, 0xf4,
    ];
    const IVEC: [u8; 16] = [
        0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd,
        0xfe, 0xff,
    ];

    fn keyed() -> AesCtrContext {
        let mut ctx = AesCtrContext::new();
        ctx.set_key(&KEY);
        ctx.set_ivec(&IVEC);
        ctx
    }

    #[test]
    fn nist_vector() {
        let plaintext: [u8; 32] = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73,
            0x93, 0x17, 0x2a, 0xae, 0x2d, 0x8a, 0x57, 0x1e, 0x03, 0xac, 0x9c, 0x9e, 0xb7,
            0x6f, 0xac, 0x45, 0xaf, 0x8e, 0x51,
        ];
        let expected: [u8; 32] = [
            0x60, 0x1e, 0xc3, 0x13, 0x77, 0x57, 0x89, 0xa5, 0xb7, 0xa7, 0xf5, 0x04, 0xbb,
            0xf3, 0xd2, 0x28, 0xf4, 0x43, 0xe3, 0xca, 0x4d, 0x62, 0xb5, 0x9a, 0xca, 0x84,
            0xe9, 0x90, 0xca, 0xca, 0xf5, 0xc5,
        ];
        let mut ctx = keyed();
        assert_eq!(ctx.crypt(&plaintext), expected);
    }

    #[test]
    fn crypt_is_length_preserving() {
        let mut ctx = keyed();
        for len in [0usize, 1, 7, 16, 17, 1000] {
            let data = vec![0xA5u8; len];
            assert_eq!(ctx.crypt(&data).len(), len);
        }
    }

    #[test]
    fn two_contexts_are_an_involution() {
        // Cycle each context independently over the same input length.
        let mut enc = keyed();
        let mut dec = keyed();
        let data: Vec<u8> = (0..200u16).map(|i| (i * 7) as u8).collect();

        // Feed in uneven chunks so the block boundary handling is exercised.
        let mut round_tripped = Vec::new();
        for chunk in data.chunks(13) {
            round_tripped.extend(dec.crypt(&enc.crypt(chunk)));
        }
        assert_eq!(round_tripped, data);
    }

    #[test]
    fn installing_material_rewinds_the_stream() {
        let mut ctx = keyed();
        let first = ctx.crypt(&[0u8; 48]);
        ctx.set_ivec(&IVEC);
        let second = ctx.crypt(&[0u8; 48]);
        assert_eq!(first, second);
    }

    #[test]
    fn unkeyed_context_leaves_data_untouched() {
        let mut ctx = AesCtrContext::new();
        assert!(!ctx.has_key());
        assert_eq!(ctx.crypt(&[1, 2, 3]), vec![1, 2, 3]);
    }
}
