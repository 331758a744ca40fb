//! Outgoing package helper: message-id assignment and transport forwarding.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use courier_crypto::AuthKey;

use crate::message::MessageId;

/// Who assigns the message id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendMode {
    Client,
    Server,
}

/// Destination for framed payloads; implemented by the transport handle.
pub trait PackageSink: Send + Sync {
    fn send_package(&self, payload: Vec<u8>);
}

/// Stamps outgoing messages with monotonic time-derived ids and forwards
/// them to the bound transport. One helper per connection; the DH and RPC
/// layers share it.
pub struct SendHelper {
    sink:            Mutex<Option<std::sync::Arc<dyn PackageSink>>>,
    last_message_id: Mutex<i64>,
    /// Offset between the local and the server clock, in seconds.
    delta_time:      AtomicI32,
    auth_key:        Mutex<Option<AuthKey>>,
    auth_id:         AtomicU64,
}

impl SendHelper {
    pub fn new() -> Self {
        Self {
            sink:            Mutex::new(None),
            last_message_id: Mutex::new(0),
            delta_time:      AtomicI32::new(0),
            auth_key:        Mutex::new(None),
            auth_id:         AtomicU64::new(0),
        }
    }

    pub fn bind_sink(&self, sink: std::sync::Arc<dyn PackageSink>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    /// Produce a fresh outgoing message id.
    ///
    /// Client ids derive from `unix_ms + delta_time` with the two low bits
    /// cleared, and are strictly greater than every id issued before; the
    /// naive value is advanced by 4 until that holds.
    pub fn new_message_id(&self, mode: SendMode) -> MessageId {
        let ms = unix_ms() + i64::from(self.delta_time()) * 1000;
        let mut id = MessageId::from_unix_ms(ms).0;
        match mode {
            SendMode::Client => id &= !3,
            SendMode::Server => {
                log::warn!("[send-helper] server send mode requested on a client helper");
            }
        }
        let mut last = self.last_message_id.lock().unwrap();
        if id <= *last {
            id = *last + 4;
        }
        *last = id;
        MessageId(id)
    }

    /// Signed offset in seconds between the local and the server clock,
    /// learned from the DH layer's first responses.
    pub fn delta_time(&self) -> i32 {
        self.delta_time.load(Ordering::Relaxed)
    }

    pub fn set_delta_time(&self, seconds: i32) {
        self.delta_time.store(seconds, Ordering::Relaxed);
    }

    /// Forward a framed payload to the bound transport.
    pub fn send_package(&self, payload: Vec<u8>) {
        match self.sink.lock().unwrap().as_ref() {
            Some(sink) => sink.send_package(payload),
            None => log::error!("[send-helper] no transport bound, dropping package"),
        }
    }

    /// The cached 64-bit key identifier; zero while no key is installed.
    pub fn auth_id(&self) -> u64 {
        self.auth_id.load(Ordering::Relaxed)
    }

    pub fn auth_key(&self) -> Option<AuthKey> {
        self.auth_key.lock().unwrap().clone()
    }

    pub fn set_auth_key(&self, key: AuthKey) {
        self.auth_id.store(key.key_id(), Ordering::Relaxed);
        *self.auth_key.lock().unwrap() = Some(key);
    }
}

impl Default for SendHelper {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
