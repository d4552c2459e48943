use std::net::SocketAddr;

use thiserror::Error;

use crate::{Encoding, TransportKind};

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur during fabric operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Peer closed or reset the connection, or it could not be reached.
    #[error("connection error: {0}")]
    Connection(#[source] std::io::Error),
    /// Received or outgoing frame is malformed.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("tls handshake failed: {0}")]
    Handshake(String),
    /// A descriptor or socket of the wrong transport kind was handed to a
    /// channel variant.
    #[error("transport kind mismatch: expected {expected}, got {found}")]
    TypeMismatch {
        expected: TransportKind,
        found: TransportKind,
    },
    #[error("failed decoding {encoding} payload: {reason}")]
    Deserialization { encoding: Encoding, reason: String },
    #[error("failed encoding {encoding} payload: {reason}")]
    Serialization { encoding: Encoding, reason: String },
    #[error("timed out")]
    TimedOut,
    /// A listening or datagram socket could not be acquired.
    #[error("{component} failed binding to {addr}: {source}")]
    Bind {
        component: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("channel is closed")]
    ClosedChannel,

    #[error("encoding unavailable: {0} (enable the matching crate feature)")]
    EncodingUnavailable(Encoding),
    #[error("codec mismatch: configured {configured}, got {given}")]
    EncodingMismatch { configured: Encoding, given: Encoding },
    #[error("secure transport requires a tls config: {0}")]
    MissingTlsConfig(&'static str),
    #[error("invalid tls config: {0}")]
    TlsConfig(String),
    #[error("engine failed: {0}")]
    Engine(String),

    #[error("failed parsing int: {0}")]
    IntParseError(#[from] std::num::ParseIntError),
    #[error("failed parsing address: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),
    #[error("failed parsing config: {0}")]
    ConfigError(#[from] toml::de::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("other: {0}")]
    Other(String),
}

impl Error {
    /// Whether the error is contained to a single connection or datagram.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::Protocol(_)
                | Error::Handshake(_)
                | Error::Deserialization { .. }
                | Error::TimedOut
                | Error::ClosedChannel
        )
    }
}

#[test]
fn bind_error_names_component_and_port() {
    let err = Error::Bind {
        component: "discovery",
        addr: "0.0.0.0:59119".parse().unwrap(),
        source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
    };
    let msg = err.to_string();
    assert!(msg.contains("discovery"));
    assert!(msg.contains("59119"));
    assert!(!err.is_local());
}
