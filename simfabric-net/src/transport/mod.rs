//! Reliable, framed byte-stream channels.
//!
//! A channel wraps exactly one connected stream and moves whole frames
//! across it. Every frame is a 4-byte unsigned length in network byte order
//! followed by exactly that many payload bytes. Zero-length frames are
//! legal.
//!
//! Two variants exist: [`PlainChannel`] frames a raw tcp stream, while
//! [`SecureChannel`] first completes a tls handshake and then hands the
//! encrypted stream to an inner plain channel for all of the framing. The
//! [`Channel`] enum picks the variant by matching on the
//! [`TransportKind`] of the endpoint (or accepted stream) it is given,
//! there is never a silent fallback from secure to plain.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use rustls::{ServerConnection, StreamOwned};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::encoding::Serializer;
use crate::{EndpointInfo, Error, Result, TransportKind};

mod plain;
mod secure;
mod tls;

pub use plain::PlainChannel;
pub use secure::{SecureChannel, TlsStream};
pub use tls::{TlsConfig, TlsConfigBuilder, DEFAULT_HANDSHAKE_TIMEOUT};

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Lifecycle of a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Unestablished,
    Handshaking,
    Open,
    Closed,
}

#[derive(Debug, Copy, Clone)]
pub struct ChannelConfig {
    /// Frames announcing a larger payload are rejected as protocol errors
    pub max_frame_len: usize,
    /// Bound for blocking reads, none waits forever
    pub read_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            read_timeout: None,
        }
    }
}

/// Abstraction over the byte streams a channel can frame.
pub trait ByteStream: Read + Write + Send {
    /// Shuts both halves of the stream down.
    fn shutdown(&mut self) -> io::Result<()>;
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl ByteStream for TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, dur)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

/// Contract shared by all channel variants.
pub trait MessageChannel {
    /// Blocks until a complete frame is available and returns its payload.
    ///
    /// Fails with `Error::TimedOut` if a timeout is set and expires first,
    /// leaving the channel open and any partially received frame intact.
    fn read_message(&mut self) -> Result<Vec<u8>>;

    /// Blocks until the whole frame has been flushed to the stream.
    fn write_message(&mut self, payload: &[u8]) -> Result<()>;

    /// Bounds subsequent blocking reads. `None` or a zero duration removes
    /// the bound.
    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Releases the underlying socket. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;

    fn kind(&self) -> TransportKind;

    fn state(&self) -> ChannelState;

    fn peer_addr(&self) -> Result<SocketAddr>;

    /// Writes a single frame and waits for the reply frame.
    fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.write_message(payload)?;
        self.read_message()
    }

    /// Encodes a message and sends it as one frame.
    fn send<S: Serializer, T: Serialize>(&mut self, serializer: &S, msg: &T) -> Result<()>
    where
        Self: Sized,
    {
        let bytes = serializer.encode(msg)?;
        self.write_message(&bytes)
    }

    /// Reads one frame and decodes it into a message.
    fn recv<S: Serializer, T: DeserializeOwned>(&mut self, serializer: &S) -> Result<T>
    where
        Self: Sized,
    {
        let bytes = self.read_message()?;
        serializer.decode(&bytes)
    }
}

/// Stream freshly accepted by a [`Listener`], not yet wrapped in a channel.
pub enum AcceptedStream {
    Plain(TcpStream),
    /// Tls session set up on the accepted socket, handshake still pending
    Secure {
        stream: Box<StreamOwned<ServerConnection, TcpStream>>,
        handshake_timeout: Duration,
    },
}

impl AcceptedStream {
    pub fn kind(&self) -> TransportKind {
        match self {
            AcceptedStream::Plain(_) => TransportKind::Plain,
            AcceptedStream::Secure { .. } => TransportKind::Secure,
        }
    }
}

/// Channel of either transport kind.
pub enum Channel {
    Plain(PlainChannel),
    Secure(SecureChannel),
}

impl Channel {
    /// Opens an outbound channel of the kind the endpoint declares.
    pub fn connect(
        endpoint: &EndpointInfo,
        tls: Option<&TlsConfig>,
        config: ChannelConfig,
    ) -> Result<Self> {
        let channel = match endpoint.kind() {
            TransportKind::Plain => Channel::Plain(PlainChannel::connect(endpoint, config)?),
            TransportKind::Secure => {
                let tls = tls.ok_or(Error::MissingTlsConfig("outbound secure connection"))?;
                Channel::Secure(SecureChannel::connect(endpoint, tls, config)?)
            }
        };
        Ok(channel)
    }

    /// Wraps an accepted stream in the channel variant matching its kind.
    pub fn from_accepted(accepted: AcceptedStream, config: ChannelConfig) -> Result<Self> {
        let channel = match accepted.kind() {
            TransportKind::Plain => Channel::Plain(PlainChannel::from_accepted(accepted, config)?),
            TransportKind::Secure => {
                Channel::Secure(SecureChannel::from_accepted(accepted, config)?)
            }
        };
        Ok(channel)
    }
}

impl MessageChannel for Channel {
    fn read_message(&mut self) -> Result<Vec<u8>> {
        match self {
            Channel::Plain(c) => c.read_message(),
            Channel::Secure(c) => c.read_message(),
        }
    }

    fn write_message(&mut self, payload: &[u8]) -> Result<()> {
        match self {
            Channel::Plain(c) => c.write_message(payload),
            Channel::Secure(c) => c.write_message(payload),
        }
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self {
            Channel::Plain(c) => c.set_timeout(timeout),
            Channel::Secure(c) => c.set_timeout(timeout),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            Channel::Plain(c) => c.close(),
            Channel::Secure(c) => c.close(),
        }
    }

    fn kind(&self) -> TransportKind {
        match self {
            Channel::Plain(c) => c.kind(),
            Channel::Secure(c) => c.kind(),
        }
    }

    fn state(&self) -> ChannelState {
        match self {
            Channel::Plain(c) => c.state(),
            Channel::Secure(c) => c.state(),
        }
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        match self {
            Channel::Plain(c) => c.peer_addr(),
            Channel::Secure(c) => c.peer_addr(),
        }
    }
}

/// Tcp listener accepting streams of a single transport kind.
///
/// The listener socket is non-blocking, `try_accept` returns immediately
/// so the owner is free to check for shutdown between polls.
pub struct Listener {
    inner: TcpListener,
    kind: TransportKind,
    tls: Option<Arc<TlsConfig>>,
}

impl Listener {
    /// Binds a new listener. Secure listeners need a tls config carrying a
    /// server identity.
    pub fn bind(addr: SocketAddr, kind: TransportKind, tls: Option<Arc<TlsConfig>>) -> Result<Self> {
        let tls = match kind {
            TransportKind::Plain => None,
            TransportKind::Secure => match tls {
                Some(t) if t.server_config().is_some() => Some(t),
                _ => {
                    return Err(Error::MissingTlsConfig(
                        "secure listener requires a server certificate and key",
                    ))
                }
            },
        };
        let inner = TcpListener::bind(addr).map_err(|source| Error::Bind {
            component: "simulation server",
            addr,
            source,
        })?;
        inner.set_nonblocking(true)?;
        trace!("bound {} listener to: {}", kind, inner.local_addr()?);
        Ok(Self { inner, kind, tls })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Accepts a pending connection, if there is one.
    ///
    /// Secure streams come back with the tls session created but the
    /// handshake not yet performed, so accepting never blocks on a slow
    /// peer.
    pub fn try_accept(&self) -> Result<Option<(AcceptedStream, SocketAddr)>> {
        let (stream, peer) = match self.inner.accept() {
            Ok(s) => s,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;

        let accepted = match &self.tls {
            None => AcceptedStream::Plain(stream),
            Some(tls) => {
                let server_config = tls
                    .server_config()
                    .ok_or(Error::MissingTlsConfig("secure listener lost its identity"))?;
                let conn = ServerConnection::new(server_config)
                    .map_err(|e| Error::Handshake(e.to_string()))?;
                AcceptedStream::Secure {
                    stream: Box::new(StreamOwned::new(conn, stream)),
                    handshake_timeout: tls.handshake_timeout(),
                }
            }
        };
        Ok(Some((accepted, peer)))
    }
}

/// Maps an io error from a read into the channel error taxonomy.
pub(crate) fn read_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::TimedOut,
        _ => Error::Connection(e),
    }
}
