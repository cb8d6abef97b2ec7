//! Bus addresses: `opensrf:<purpose>:<username>:<domain>:<remainder>`.

use std::fmt;
use std::str::FromStr;

/// What kind of peer an [`Address`] names, and therefore how it should be
/// routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Client,
    Service,
    Router,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Purpose::Client => "client",
            Purpose::Service => "service",
            Purpose::Router => "router",
        })
    }
}

impl FromStr for Purpose {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Purpose::Client),
            "service" => Ok(Purpose::Service),
            "router" => Ok(Purpose::Router),
            other => Err(AddressError::UnknownPurpose(other.to_owned())),
        }
    }
}

/// A parsed bus address.
///
/// `remainder` is free-form: a hostname/pid/random-hex triple for clients,
/// a service name for services, empty for routers. It is kept as the raw
/// trailing string rather than split further, since its shape varies by
/// purpose and nothing downstream needs to parse it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub purpose: Purpose,
    pub username: String,
    pub domain: String,
    pub remainder: String,
}

const PREFIX: &str = "opensrf";

impl Address {
    pub fn client(username: &str, domain: &str, hostname: &str, pid: u32, rand8: &str) -> Self {
        Address {
            purpose: Purpose::Client,
            username: username.to_owned(),
            domain: domain.to_owned(),
            remainder: format!("{hostname}:{pid}:{rand8}"),
        }
    }

    pub fn service(username: &str, domain: &str, service: &str) -> Self {
        Address {
            purpose: Purpose::Service,
            username: username.to_owned(),
            domain: domain.to_owned(),
            remainder: service.to_owned(),
        }
    }

    pub fn router(username: &str, domain: &str) -> Self {
        Address {
            purpose: Purpose::Router,
            username: username.to_owned(),
            domain: domain.to_owned(),
            remainder: String::new(),
        }
    }

    /// The service name carried in the remainder of a `service` address.
    /// Empty string for any other purpose.
    pub fn service_name(&self) -> &str {
        match self.purpose {
            Purpose::Service => &self.remainder,
            _ => "",
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.remainder.is_empty() {
            write!(f, "{PREFIX}:{}:{}:{}", self.purpose, self.username, self.domain)
        } else {
            write!(
                f,
                "{PREFIX}:{}:{}:{}:{}",
                self.purpose, self.username, self.domain, self.remainder
            )
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(5, ':');
        let prefix = parts.next().ok_or(AddressError::Malformed)?;
        if prefix != PREFIX {
            return Err(AddressError::Malformed);
        }
        let purpose = parts.next().ok_or(AddressError::Malformed)?.parse()?;
        let username = parts.next().ok_or(AddressError::Malformed)?.to_owned();
        let domain = parts.next().ok_or(AddressError::Malformed)?.to_owned();
        let remainder = parts.next().unwrap_or("").to_owned();
        Ok(Address {
            purpose,
            username,
            domain,
            remainder,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("malformed address")]
    Malformed,
    #[error("unknown address purpose: {0}")]
    UnknownPurpose(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_service_address() {
        let addr = Address::service("router", "private.localhost", "opensrf.math");
        let text = addr.to_string();
        assert_eq!(text, "opensrf:service:router:private.localhost:opensrf.math");
        let parsed: Address = text.parse().unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(parsed.service_name(), "opensrf.math");
    }

    #[test]
    fn client_remainder_keeps_embedded_colons() {
        let addr = Address::client("router", "private.localhost", "host1", 42, "deadbeef");
        let text = addr.to_string();
        let parsed: Address = text.parse().unwrap();
        assert_eq!(parsed.remainder, "host1:42:deadbeef");
    }

    #[test]
    fn router_address_has_no_trailing_colon() {
        let addr = Address::router("router", "private.localhost");
        assert_eq!(addr.to_string(), "opensrf:router:router:private.localhost");
    }

    #[test]
    fn rejects_bad_prefix() {
        assert_eq!(
            "foo:client:a:b:c".parse::<Address>(),
            Err(AddressError::Malformed)
        );
    }

    #[test]
    fn rejects_unknown_purpose() {
        assert_eq!(
            "opensrf:bogus:a:b:c".parse::<Address>(),
            Err(AddressError::UnknownPurpose("bogus".to_owned()))
        );
    }
}
