//! Descriptors identifying network participants.

use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::Error;

/// List of possible reliable stream transports.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum TransportKind {
    /// Length-prefixed frames over a raw tcp stream
    Plain,
    /// Same framing, run over a tls session
    Secure,
}

impl Default for TransportKind {
    fn default() -> Self {
        TransportKind::Plain
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Secure => write!(f, "secure"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = Error;
    fn from_str(s: &str) -> core::result::Result<Self, Error> {
        match s.to_lowercase().as_str() {
            "plain" | "tcp" | "default" => Ok(Self::Plain),
            "secure" | "tls" | "ssl" => Ok(Self::Secure),
            _ => Err(Error::Other(format!(
                "failed parsing transport kind from string: {}",
                s
            ))),
        }
    }
}

/// Address, port and transport kind of a single participant.
///
/// Descriptors are immutable values compared structurally. A process
/// learns about a peer by decoding its descriptor from a discovery
/// datagram, and describes itself with one when announcing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct EndpointInfo {
    address: IpAddr,
    port: u16,
    kind: TransportKind,
}

impl EndpointInfo {
    pub fn new(address: IpAddr, port: u16, kind: TransportKind) -> Self {
        Self {
            address,
            port,
            kind,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, kind: TransportKind) -> Self {
        Self::new(addr.ip(), addr.port(), kind)
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl Display for EndpointInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.kind, self.socket_addr())
    }
}

impl FromStr for EndpointInfo {
    type Err = Error;
    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let (kind, addr) = if s.contains("://") {
            let split = s.splitn(2, "://").collect::<Vec<&str>>();
            (TransportKind::from_str(split[0])?, split[1])
        } else {
            (TransportKind::Plain, s)
        };
        let addr: SocketAddr = addr.parse()?;
        Ok(Self::from_socket_addr(addr, kind))
    }
}

#[test]
fn parse_endpoint_with_kind() {
    let info: EndpointInfo = "secure://10.0.0.4:8080".parse().unwrap();
    assert_eq!(info.kind(), TransportKind::Secure);
    assert_eq!(info.port(), 8080);
    assert_eq!(info.to_string(), "secure://10.0.0.4:8080");
}

#[test]
fn parse_bare_endpoint_defaults_to_plain() {
    let info: EndpointInfo = "127.0.0.1:9000".parse().unwrap();
    assert_eq!(info.kind(), TransportKind::Plain);
    assert!("quic://127.0.0.1:9000".parse::<EndpointInfo>().is_err());
}

#[test]
fn equality_covers_kind() {
    let plain: EndpointInfo = "plain://127.0.0.1:9000".parse().unwrap();
    let secure: EndpointInfo = "secure://127.0.0.1:9000".parse().unwrap();
    assert_ne!(plain, secure);
    assert_eq!(plain, "tcp://127.0.0.1:9000".parse::<EndpointInfo>().unwrap());
}
