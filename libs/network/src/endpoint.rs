//! Endpoint addressing
//!
//! `tcp://host:port` and `tls://host:port`. A host of `*` binds every
//! interface.

use crate::{Result, TransportError};
use std::fmt;
use std::str::FromStr;
use url::Url;

const WILDCARD_HOST: &str = "*";
const WILDCARD_BIND: &str = "0.0.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Tls,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "tls",
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Tls)
    }
}

/// Where a hub listens or dials
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Tcp, host, port)
    }

    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Tls, host, port)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_wildcard(&self) -> bool {
        self.host == WILDCARD_HOST
    }

    /// Address to bind a listener to
    pub fn bind_address(&self) -> String {
        let host = if self.is_wildcard() {
            WILDCARD_BIND
        } else {
            self.host.as_str()
        };
        join_host_port(host, self.port)
    }

    /// Address to dial
    pub fn connect_address(&self) -> Result<String> {
        if self.is_wildcard() {
            return Err(TransportError::configuration(
                format!("cannot dial wildcard endpoint {}", self),
                Some("endpoint"),
            ));
        }
        Ok(join_host_port(&self.host, self.port))
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        // `*` is not a valid URL host; parse a placeholder and restore it
        let wildcard = s.contains("://*:");
        let normalized = if wildcard {
            s.replacen("://*:", &format!("://{}:", WILDCARD_BIND), 1)
        } else {
            s.to_string()
        };

        let url = Url::parse(&normalized).map_err(|e| {
            TransportError::configuration(format!("invalid endpoint '{}': {}", s, e), Some("endpoint"))
        })?;

        let scheme = match url.scheme() {
            "tcp" => Scheme::Tcp,
            "tls" => Scheme::Tls,
            other => {
                return Err(TransportError::configuration(
                    format!("unsupported endpoint scheme '{}'", other),
                    Some("endpoint"),
                ))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::configuration(format!("endpoint '{}' has no host", s), Some("endpoint")))?;
        let port = url
            .port()
            .ok_or_else(|| TransportError::configuration(format!("endpoint '{}' has no port", s), Some("endpoint")))?;

        let host = if wildcard {
            WILDCARD_HOST.to_string()
        } else {
            host.trim_start_matches('[').trim_end_matches(']').to_string()
        };

        Ok(Self::new(scheme, host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), join_host_port(&self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let endpoint: Endpoint = "tcp://127.0.0.1:5555".parse().unwrap();
        assert_eq!(endpoint.scheme(), Scheme::Tcp);
        assert_eq!(endpoint.host(), "127.0.0.1");
        assert_eq!(endpoint.port(), 5555);
        assert_eq!(endpoint.connect_address().unwrap(), "127.0.0.1:5555");
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:5555");
    }

    #[test]
    fn test_parse_wildcard() {
        let endpoint: Endpoint = "tls://*:7000".parse().unwrap();
        assert!(endpoint.is_wildcard());
        assert!(endpoint.scheme().is_secure());
        assert_eq!(endpoint.bind_address(), "0.0.0.0:7000");
        assert!(endpoint.connect_address().is_err());
        assert_eq!(endpoint.to_string(), "tls://*:7000");
    }

    #[test]
    fn test_parse_hostname_and_ipv6() {
        let endpoint: Endpoint = "tcp://hub.internal:80".parse().unwrap();
        assert_eq!(endpoint.host(), "hub.internal");

        let endpoint: Endpoint = "tcp://[::1]:9000".parse().unwrap();
        assert_eq!(endpoint.host(), "::1");
        assert_eq!(endpoint.connect_address().unwrap(), "[::1]:9000");
    }

    #[test]
    fn test_rejects_bad_endpoints() {
        assert!("udp://127.0.0.1:1".parse::<Endpoint>().is_err());
        assert!("tcp://127.0.0.1".parse::<Endpoint>().is_err());
        assert!("not an endpoint".parse::<Endpoint>().is_err());
    }
}
