//! Obfuscated-transport key material.
//!
//! The obfuscated MTProto transport opens with a 64-byte header sent by the
//! client. Bytes 8..56 are the AES-CTR key (32 bytes) and initial counter
//! block (16 bytes) for one direction; the byte-reversed copy of the same
//! span keys the opposite direction. Bytes 56..60 carry the protocol tag
//! that selects the inner framing.

use crate::{AesCtrContext, IVEC_SIZE, KEY_SIZE};

/// Protocol tag for abridged framing inside the obfuscated envelope.
pub const PROTO_TAG_ABRIDGED: [u8; 4] = [0xef, 0xef, 0xef, 0xef];

/// Offset of the key material inside the 64-byte header.
pub const SOURCE_OFFSET: usize = 8;
/// Offset of the protocol tag inside the 64-byte header.
pub const PROTO_TAG_OFFSET: usize = 56;

/// 4-byte header beginnings that would make the stream look like another
/// protocol; a fresh nonce must avoid them.
const RESERVED_BEGINNINGS: [[u8; 4]; 6] = [
    [0x48, 0x45, 0x41, 0x44], // HEAD
    [0x50, 0x4F, 0x53, 0x54], // POST
    [0x47, 0x45, 0x54, 0x20], // GET
    [0xee, 0xee, 0xee, 0xee],
    [0xdd, 0xdd, 0xdd, 0xdd],
    [0x16, 0x03, 0x01, 0x02], // TLS
];

/// Generate the client's 64-byte obfuscation header for the given protocol
/// tag. Retries the random draw until the reserved patterns are avoided.
pub fn generate_client_nonce(proto_tag: [u8; 4]) -> Result<[u8; 64], getrandom::Error> {
    let mut nonce = [0u8; 64];
    loop {
        getrandom::getrandom(&mut nonce)?;
        if nonce[0] == 0xef {
            continue;
        }
        let head: [u8; 4] = nonce[0..4].try_into().unwrap();
        if RESERVED_BEGINNINGS.contains(&head) {
            continue;
        }
        if nonce[4..8] == [0, 0, 0, 0] {
            continue;
        }
        break;
    }
    nonce[PROTO_TAG_OFFSET..PROTO_TAG_OFFSET + 4].copy_from_slice(&proto_tag);
    Ok(nonce)
}

/// Extract `(key, ivec)` from a 64-byte header in its given orientation.
pub fn extract_source(source: &[u8; 64]) -> ([u8; KEY_SIZE], [u8; IVEC_SIZE]) {
    let mut key = [0u8; KEY_SIZE];
    let mut ivec = [0u8; IVEC_SIZE];
    key.copy_from_slice(&source[SOURCE_OFFSET..SOURCE_OFFSET + KEY_SIZE]);
    ivec.copy_from_slice(&source[SOURCE_OFFSET + KEY_SIZE..SOURCE_OFFSET + KEY_SIZE + IVEC_SIZE]);
    (key, ivec)
}

/// Extract `(key, ivec)` from the byte-reversed copy of a 64-byte header.
/// Used for the opposite stream direction.
pub fn extract_reversed_source(source: &[u8; 64]) -> ([u8; KEY_SIZE], [u8; IVEC_SIZE]) {
    let mut reversed = *source;
    reversed.reverse();
    extract_source(&reversed)
}

/// Build a keyed context from extracted `(key, ivec)` material.
pub fn context_from_source(
    (key, ivec): ([u8; KEY_SIZE], [u8; IVEC_SIZE]),
    description: &'static str,
) -> AesCtrContext {
    let mut ctx = AesCtrContext::new();
    ctx.set_key(&key);
    ctx.set_ivec(&ivec);
    ctx.set_description(description);
    ctx
}
