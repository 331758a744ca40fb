//! Contract consumed from the Diffie-Hellman key-exchange layer.

use tokio::sync::watch;

/// Key-exchange progress, driven by the DH layer's own packet handling.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DhState {
    #[default]
    Idle,
    PqRequested,
    DhRequested,
    HasKey,
    Failed,
}

/// A server RSA public key handle. The padding scheme and fingerprint
/// arithmetic live in the DH layer; the connection only carries the key
/// from settings to the layer.
#[derive(Clone, Debug, Default)]
pub struct RsaKey {
    pub modulus:     Vec<u8>,
    pub exponent:    Vec<u8>,
    pub fingerprint: u64,
}

impl RsaKey {
    pub fn is_valid(&self) -> bool {
        !self.modulus.is_empty() && !self.exponent.is_empty()
    }
}

/// What the connection needs from the key-exchange layer.
///
/// An implementation drives the `req_pq` / `req_DH_params` /
/// `set_client_DH_params` exchange through the shared
/// [`SendHelper`](crate::SendHelper), installs the derived
/// [`AuthKey`](courier_crypto::AuthKey) on it, and reports progress through
/// the state watch.
pub trait DhLayer: Send + Sync {
    fn state(&self) -> DhState;

    /// Subscribe to state transitions. Values are observed in emission order.
    fn state_watch(&self) -> watch::Receiver<DhState>;

    fn set_server_rsa_key(&self, key: RsaKey);

    /// Begin the exchange by sending the first plaintext request.
    fn init(&self);

    /// Handle a plaintext frame (`auth_key_id == 0`). Returns `false` when
    /// the frame could not be parsed.
    fn process_plain_packet(&self, payload: &[u8]) -> bool;

    /// The server salt learned during the exchange.
    fn server_salt(&self) -> u64;
}
