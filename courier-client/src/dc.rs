//! Data-center endpoints and connection requests.

/// Properties of a DC endpoint, as reported by the server configuration.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct DcOptionFlags(u8);

impl DcOptionFlags {
    pub const IPV6: Self = Self(1);
    pub const MEDIA_ONLY: Self = Self(2);
    pub const TCPO_ONLY: Self = Self(4);
    pub const CDN: Self = Self(8);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// A candidate server endpoint. Immutable once set.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DcOption {
    pub id:      u32,
    pub address: String,
    pub port:    u16,
    pub flags:   DcOptionFlags,
}

impl DcOption {
    pub fn new(id: u32, address: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            address: address.into(),
            port,
            flags: DcOptionFlags::default(),
        }
    }

    /// An invalid option signals "no match" from the server configuration.
    pub fn is_valid(&self) -> bool {
        !self.address.is_empty() && self.port != 0
    }
}

impl std::fmt::Display for DcOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DC{} ({}:{})", self.id, self.address, self.port)
    }
}

/// Constraints on the endpoint a [`ConnectionSpec`] may resolve to.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct RequestFlags(u8);

impl RequestFlags {
    pub const IPV4_ONLY: Self = Self(1);
    pub const IPV6_ONLY: Self = Self(2);
    pub const MEDIA_ONLY: Self = Self(4);
    pub const CDN_RELATED: Self = Self(8);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// A request for a connection by DC role; the key of the controller's
/// connection cache. Equality is structural.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ConnectionSpec {
    pub dc_id: u32,
    pub flags: RequestFlags,
}

impl ConnectionSpec {
    pub fn new(dc_id: u32) -> Self {
        Self {
            dc_id,
            flags: RequestFlags::default(),
        }
    }
}

/// The ordered list of candidate endpoints for every DC.
#[derive(Clone, Debug, Default)]
pub struct ServerConfiguration {
    options: Vec<DcOption>,
}

impl ServerConfiguration {
    pub fn new(options: Vec<DcOption>) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &[DcOption] {
        &self.options
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Find an endpoint matching the spec. Returns an invalid option when
    /// no endpoint fits.
    pub fn get_option(&self, spec: ConnectionSpec) -> DcOption {
        self.options
            .iter()
            .filter(|option| option.id == spec.dc_id)
            .filter(|option| {
                !(spec.flags.contains(RequestFlags::IPV4_ONLY)
                    && option.flags.contains(DcOptionFlags::IPV6))
            })
            .filter(|option| {
                !(spec.flags.contains(RequestFlags::IPV6_ONLY)
                    && !option.flags.contains(DcOptionFlags::IPV6))
            })
            .find(|option| {
                if spec.flags.contains(RequestFlags::MEDIA_ONLY) {
                    option.flags.contains(DcOptionFlags::MEDIA_ONLY)
                } else {
                    true
                }
            })
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfiguration {
        let mut v6 = DcOption::new(2, "2001:db8::2", 443);
        v6.flags = DcOptionFlags::IPV6;
        let mut media = DcOption::new(2, "198.51.100.7", 443);
        media.flags = DcOptionFlags::MEDIA_ONLY;
        ServerConfiguration::new(vec![
            DcOption::new(1, "192.0.2.1", 443),
            v6,
            DcOption::new(2, "192.0.2.2", 443),
            media,
        ])
    }

    #[test]
    fn ipv4_only_skips_ipv6_endpoints() {
        let spec = ConnectionSpec {
            dc_id: 2,
            flags: RequestFlags::IPV4_ONLY,
        };
        let option = config().get_option(spec);
        assert_eq!(option.address, "192.0.2.2");
    }

    #[test]
    fn media_only_requires_a_media_endpoint() {
        let spec = ConnectionSpec {
            dc_id: 2,
            flags: RequestFlags::IPV4_ONLY.with(RequestFlags::MEDIA_ONLY),
        };
        let option = config().get_option(spec);
        assert_eq!(option.address, "198.51.100.7");
    }

    #[test]
    fn missing_dc_yields_an_invalid_option() {
        let option = config().get_option(ConnectionSpec::new(9));
        assert!(!option.is_valid());
    }
}
