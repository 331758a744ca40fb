//! MTProto message framing types.

/// A 64-bit MTProto message identifier.
///
/// Time-derived: the upper 32 bits are Unix seconds, the lower 32 bits the
/// sub-second fraction scaled to 2^32. Client-produced ids have the two low
/// bits cleared; see [`SendHelper`](crate::SendHelper) for the monotonicity
/// rules.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MessageId(pub i64);

impl MessageId {
    /// Convert a millisecond Unix timestamp into the MTProto representation.
    pub(crate) fn from_unix_ms(ms: i64) -> Self {
        let secs = ms / 1000;
        let frac = ms % 1000;
        Self((secs << 32) | ((frac << 32) / 1000))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Read the 64-bit `auth_key_id` prefix of a decoded frame.
///
/// Zero routes the frame to the DH layer, nonzero to the RPC layer.
/// Returns `None` when the frame is too short to carry the prefix.
pub fn peek_auth_key_id(payload: &[u8]) -> Option<u64> {
    let prefix: [u8; 8] = payload.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(prefix))
}

/// A plaintext MTProto message, used before the key exchange completes.
#[derive(Debug)]
pub struct PlainMessage {
    pub message_id: MessageId,
    pub body:       Vec<u8>,
}

impl PlainMessage {
    pub fn new(message_id: MessageId, body: Vec<u8>) -> Self {
        Self { message_id, body }
    }

    /// Serialize into the plaintext wire format:
    ///
    /// ```text
    /// auth_key_id:long  (0 for plaintext)
    /// message_id:long
    /// message_data_length:int
    /// message_data:bytes
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 8 + 4 + self.body.len());
        buf.extend(0i64.to_le_bytes());
        buf.extend(self.message_id.0.to_le_bytes());
        buf.extend((self.body.len() as u32).to_le_bytes());
        buf.extend(&self.body);
        buf
    }
}
