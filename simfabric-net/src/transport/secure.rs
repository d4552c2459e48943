use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use rustls::{ClientConnection, ServerConnection, StreamOwned};

use super::{AcceptedStream, ByteStream, ChannelConfig, ChannelState, MessageChannel, PlainChannel};
use super::tls::TlsConfig;
use crate::{EndpointInfo, Error, Result, TransportKind};

/// One tls record read at a time, each bounded by the time left until the
/// deadline. A fatal error still flushes the alert rustls queued for it.
macro_rules! drive_handshake {
    ($s:expr, $deadline:expr) => {{
        let s = $s;
        while s.conn.is_handshaking() {
            while s.conn.wants_write() {
                s.conn.write_tls(&mut s.sock)?;
            }
            if !s.conn.is_handshaking() {
                break;
            }
            s.sock.set_read_timeout(Some(time_left($deadline)?))?;
            if s.conn.read_tls(&mut s.sock)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection during handshake",
                ));
            }
            if let Err(e) = s.conn.process_new_packets() {
                let _ = s.conn.write_tls(&mut s.sock);
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        }
        while s.conn.wants_write() {
            s.conn.write_tls(&mut s.sock)?;
        }
    }};
}

/// Tls session over a tcp stream, in either role.
pub enum TlsStream {
    Client(StreamOwned<ClientConnection, TcpStream>),
    Server(StreamOwned<ServerConnection, TcpStream>),
}

impl TlsStream {
    fn sock(&self) -> &TcpStream {
        match self {
            TlsStream::Client(s) => &s.sock,
            TlsStream::Server(s) => &s.sock,
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsStream::Client(s) => s.conn.is_handshaking(),
            TlsStream::Server(s) => s.conn.is_handshaking(),
        }
    }

    /// Drives the handshake to completion, failing with `TimedOut` once
    /// `deadline` passes, however the peer paces its records.
    fn complete_handshake(&mut self, deadline: Instant) -> io::Result<()> {
        match self {
            TlsStream::Client(s) => drive_handshake!(s, deadline),
            TlsStream::Server(s) => drive_handshake!(s, deadline),
        }
        Ok(())
    }

    /// Negotiated protocol version and cipher suite, for logging.
    pub fn session_summary(&self) -> String {
        let (version, suite) = match self {
            TlsStream::Client(s) => (s.conn.protocol_version(), s.conn.negotiated_cipher_suite()),
            TlsStream::Server(s) => (s.conn.protocol_version(), s.conn.negotiated_cipher_suite()),
        };
        format!(
            "protocol: {}, cipher suite: {}",
            version
                .map(|v| format!("{:?}", v))
                .unwrap_or_else(|| "none".to_string()),
            suite
                .map(|s| format!("{:?}", s.suite()))
                .unwrap_or_else(|| "none".to_string()),
        )
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TlsStream::Client(s) => s.read(buf),
            TlsStream::Server(s) => s.read(buf),
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TlsStream::Client(s) => s.write(buf),
            TlsStream::Server(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TlsStream::Client(s) => s.flush(),
            TlsStream::Server(s) => s.flush(),
        }
    }
}

impl ByteStream for TlsStream {
    fn shutdown(&mut self) -> io::Result<()> {
        match self {
            TlsStream::Client(s) => {
                s.conn.send_close_notify();
                while s.conn.wants_write() {
                    if s.conn.write_tls(&mut s.sock)? == 0 {
                        break;
                    }
                }
            }
            TlsStream::Server(s) => {
                s.conn.send_close_notify();
                while s.conn.wants_write() {
                    if s.conn.write_tls(&mut s.sock)? == 0 {
                        break;
                    }
                }
            }
        }
        self.sock().shutdown(Shutdown::Both)
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.sock().set_read_timeout(dur)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.sock().peer_addr()
    }
}

/// Time remaining until `deadline`, or `TimedOut` once it has passed.
fn time_left(deadline: Instant) -> io::Result<Duration> {
    match deadline.checked_duration_since(Instant::now()) {
        Some(left) if left > Duration::from_millis(0) => Ok(left),
        _ => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "handshake deadline passed",
        )),
    }
}

/// Channel running the plain framing over a tls session.
///
/// Construction only returns once the handshake has completed, every
/// later read, write and close goes verbatim to the inner plain channel.
pub struct SecureChannel {
    inner: PlainChannel<TlsStream>,
}

impl SecureChannel {
    /// Client mode: connects to a secure endpoint and performs the
    /// handshake.
    ///
    /// A non-secure endpoint is refused before any socket is opened.
    pub fn connect(endpoint: &EndpointInfo, tls: &TlsConfig, config: ChannelConfig) -> Result<Self> {
        if endpoint.kind() != TransportKind::Secure {
            return Err(Error::TypeMismatch {
                expected: TransportKind::Secure,
                found: endpoint.kind(),
            });
        }
        let client_config = tls
            .client_config()
            .ok_or(Error::MissingTlsConfig("no trust settings for client connections"))?;
        let server_name = tls.server_name_for(endpoint)?;

        let sock = TcpStream::connect(endpoint.socket_addr()).map_err(Error::Connection)?;
        sock.set_nodelay(true).map_err(Error::Connection)?;
        let conn = ClientConnection::new(client_config, server_name)
            .map_err(|e| Error::Handshake(e.to_string()))?;

        let stream = TlsStream::Client(StreamOwned::new(conn, sock));
        let channel = Self::establish(stream, tls.handshake_timeout(), config)?;
        debug!("opened secure channel to {}", endpoint);
        Ok(channel)
    }

    /// Server mode: wraps a stream accepted by a secure listener,
    /// completing its handshake.
    pub fn from_accepted(accepted: AcceptedStream, config: ChannelConfig) -> Result<Self> {
        match accepted {
            AcceptedStream::Secure {
                stream,
                handshake_timeout,
            } => Self::establish(TlsStream::Server(*stream), handshake_timeout, config),
            other => Err(Error::TypeMismatch {
                expected: TransportKind::Secure,
                found: other.kind(),
            }),
        }
    }

    fn establish(
        mut stream: TlsStream,
        handshake_timeout: Duration,
        config: ChannelConfig,
    ) -> Result<Self> {
        if stream.is_handshaking() {
            let deadline = Instant::now() + handshake_timeout;
            if let Err(e) = stream.complete_handshake(deadline) {
                let _ = stream.sock().shutdown(Shutdown::Both);
                return Err(match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Handshake(
                        format!("no response within {} ms", handshake_timeout.as_millis()),
                    ),
                    _ => Error::Handshake(e.to_string()),
                });
            }
            stream.set_read_timeout(None).map_err(Error::Connection)?;
        }
        info!(
            "tls session with {} established ({})",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown peer".to_string()),
            stream.session_summary()
        );
        Ok(Self {
            inner: PlainChannel::with_config(stream, config)?,
        })
    }

    pub fn session_summary(&self) -> String {
        self.inner.stream().session_summary()
    }
}

impl MessageChannel for SecureChannel {
    fn read_message(&mut self) -> Result<Vec<u8>> {
        self.inner.read_message()
    }

    fn write_message(&mut self, payload: &[u8]) -> Result<()> {
        self.inner.write_message(payload)
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_timeout(timeout)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Secure
    }

    fn state(&self) -> ChannelState {
        self.inner.state()
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.peer_addr()
    }
}
