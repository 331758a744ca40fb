//! Client settings consumed by the connection controller.

use std::time::Duration;

use courier_mtproto::RsaKey;

use crate::dc::DcOption;

/// Which transport framing new connections should use.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PreferredSessionType {
    /// Not set; the controller falls back to obfuscated with a warning.
    #[default]
    None,
    Abridged,
    Obfuscated,
}

/// Proxy endpoint placeholder. Connections are currently direct; the field
/// is carried so transports can grow proxy support without a settings
/// change.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Proxy {
    pub address: String,
    pub port:    u16,
}

impl Proxy {
    pub fn is_set(&self) -> bool {
        !self.address.is_empty() && self.port != 0
    }
}

/// Static client configuration: candidate servers, the server public key,
/// transport preference and keep-alive cadence.
#[derive(Clone, Debug)]
pub struct Settings {
    server_configuration:   Vec<DcOption>,
    server_rsa_key:         RsaKey,
    proxy:                  Proxy,
    preferred_session_type: PreferredSessionType,
    ping_interval:          Duration,
}

impl Settings {
    pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

    pub fn new(server_configuration: Vec<DcOption>, server_rsa_key: RsaKey) -> Self {
        Self {
            server_configuration,
            server_rsa_key,
            proxy: Proxy::default(),
            preferred_session_type: PreferredSessionType::default(),
            ping_interval: Self::DEFAULT_PING_INTERVAL,
        }
    }

    pub fn server_configuration(&self) -> &[DcOption] {
        &self.server_configuration
    }

    pub fn server_rsa_key(&self) -> RsaKey {
        self.server_rsa_key.clone()
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn set_proxy(&mut self, proxy: Proxy) {
        self.proxy = proxy;
    }

    pub fn preferred_session_type(&self) -> PreferredSessionType {
        self.preferred_session_type
    }

    pub fn set_preferred_session_type(&mut self, session_type: PreferredSessionType) {
        self.preferred_session_type = session_type;
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn set_ping_interval(&mut self, interval: Duration) {
        self.ping_interval = interval;
    }

    /// The controller refuses to start an attempt on invalid settings.
    pub fn is_valid(&self) -> bool {
        !self.server_configuration.is_empty()
            && self.server_configuration.iter().all(DcOption::is_valid)
            && self.server_rsa_key.is_valid()
    }
}
