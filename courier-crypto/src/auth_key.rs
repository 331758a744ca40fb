//! The 256-byte shared secret produced by the DH handshake.

use sha1::{Digest, Sha1};

/// An MTProto authorization key plus its pre-computed 64-bit identifier.
///
/// The identifier is the little-endian tail of the key's SHA-1 digest
/// (bytes 12..20); it prefixes every encrypted packet on the wire and is
/// how inbound frames are routed to the RPC layer. Two keys are considered
/// equal when their identifiers match.
#[derive(Clone)]
pub struct AuthKey {
    data:   [u8; 256],
    key_id: u64,
}

impl AuthKey {
    /// Construct from the raw 256-byte DH output.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        let digest = sha1(&data);
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&digest[12..]);
        Self {
            data,
            key_id: u64::from_le_bytes(id_bytes),
        }
    }

    /// The raw 256-byte representation.
    pub fn to_bytes(&self) -> [u8; 256] {
        self.data
    }

    /// The key identifier as the integer carried on the wire.
    pub fn key_id(&self) -> u64 {
        self.key_id
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(#{:016x})", self.key_id())
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_id() == other.key_id()
    }
}

fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}
