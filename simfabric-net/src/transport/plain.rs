use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use super::{read_error, AcceptedStream, ByteStream, ChannelConfig, ChannelState, MessageChannel};
use crate::{EndpointInfo, Error, Result, TransportKind};

const LEN_PREFIX: usize = 4;
const READ_CHUNK: usize = 16 * 1024;

/// Length-prefixed framing over a byte stream.
///
/// By default the stream is a raw `TcpStream`. The secure variant reuses
/// this type over a tls stream.
pub struct PlainChannel<S: ByteStream = TcpStream> {
    stream: S,
    state: ChannelState,
    max_frame_len: usize,
    /// Bytes already read off the stream that don't yet make a whole frame
    buffer: Vec<u8>,
}

impl PlainChannel<TcpStream> {
    /// Connects to a plain endpoint.
    pub fn connect(endpoint: &EndpointInfo, config: ChannelConfig) -> Result<Self> {
        if endpoint.kind() != TransportKind::Plain {
            return Err(Error::TypeMismatch {
                expected: TransportKind::Plain,
                found: endpoint.kind(),
            });
        }
        let stream = TcpStream::connect(endpoint.socket_addr()).map_err(Error::Connection)?;
        stream.set_nodelay(true).map_err(Error::Connection)?;
        debug!("opened plain channel to {}", endpoint);
        Self::with_config(stream, config)
    }

    /// Wraps a stream accepted by a plain listener.
    pub fn from_accepted(accepted: AcceptedStream, config: ChannelConfig) -> Result<Self> {
        match accepted {
            AcceptedStream::Plain(stream) => Self::with_config(stream, config),
            other => Err(Error::TypeMismatch {
                expected: TransportKind::Plain,
                found: other.kind(),
            }),
        }
    }
}

impl<S: ByteStream> PlainChannel<S> {
    /// Wraps an already connected stream using default settings.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ChannelState::Open,
            max_frame_len: super::DEFAULT_MAX_FRAME_LEN,
            buffer: Vec::new(),
        }
    }

    pub fn with_config(stream: S, config: ChannelConfig) -> Result<Self> {
        let mut channel = Self::new(stream);
        channel.max_frame_len = config.max_frame_len;
        channel.set_timeout(config.read_timeout)?;
        Ok(channel)
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub(crate) fn stream(&self) -> &S {
        &self.stream
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ChannelState::Open => Ok(()),
            _ => Err(Error::ClosedChannel),
        }
    }

    /// Pulls a complete frame out of the buffer, if one is there.
    fn take_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = BigEndian::read_u32(&self.buffer[..LEN_PREFIX]) as usize;
        if len > self.max_frame_len {
            return Err(Error::Protocol(format!(
                "frame announces {} bytes, limit is {}",
                len, self.max_frame_len
            )));
        }
        let total = LEN_PREFIX + len;
        if self.buffer.len() < total {
            self.buffer.reserve(total - self.buffer.len());
            return Ok(None);
        }
        let frame = self.buffer[LEN_PREFIX..total].to_vec();
        self.buffer.drain(..total);
        Ok(Some(frame))
    }
}

impl<S: ByteStream> MessageChannel for PlainChannel<S> {
    fn read_message(&mut self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.take_frame()? {
                trace!("read {} byte frame", frame.len());
                return Ok(frame);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::Connection(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    )))
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_error(e)),
            }
        }
    }

    fn write_message(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if payload.len() > self.max_frame_len {
            return Err(Error::Protocol(format!(
                "payload of {} bytes exceeds frame limit of {}",
                payload.len(),
                self.max_frame_len
            )));
        }
        if payload.len() > u32::MAX as usize {
            return Err(Error::Protocol(format!(
                "payload of {} bytes can't be length-prefixed",
                payload.len()
            )));
        }
        let mut frame = vec![0u8; LEN_PREFIX + payload.len()];
        BigEndian::write_u32(&mut frame[..LEN_PREFIX], payload.len() as u32);
        frame[LEN_PREFIX..].copy_from_slice(payload);

        self.stream
            .write_all(&frame)
            .and_then(|_| self.stream.flush())
            .map_err(Error::Connection)?;
        trace!("wrote {} byte frame", payload.len());
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_open()?;
        let timeout = timeout.filter(|t| *t > Duration::from_millis(0));
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }
        self.state = ChannelState::Closed;
        self.buffer.clear();
        match self.stream.shutdown() {
            Ok(()) => Ok(()),
            // peer may have gone away already
            Err(ref e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => {
                debug!("failed shutting down stream: {}", e);
                Ok(())
            }
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Plain
    }

    fn state(&self) -> ChannelState {
        self.state
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        self.ensure_open()?;
        self.stream.peer_addr().map_err(Error::Connection)
    }
}

#[cfg(test)]
fn plain_pair() -> (PlainChannel, PlainChannel) {
    use std::net::TcpListener;
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (PlainChannel::new(client), PlainChannel::new(server))
}

#[test]
fn frames_arrive_intact_and_in_order() {
    let (mut a, mut b) = plain_pair();
    a.write_message(b"first").unwrap();
    a.write_message(b"").unwrap();
    a.write_message(&[7u8; 3]).unwrap();
    assert_eq!(b.read_message().unwrap(), b"first".to_vec());
    assert_eq!(b.read_message().unwrap(), Vec::<u8>::new());
    assert_eq!(b.read_message().unwrap(), vec![7u8; 3]);
}

#[test]
fn length_prefix_is_big_endian() {
    use std::io::Read;
    use std::net::TcpListener;
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (mut server, _) = listener.accept().unwrap();
    let mut channel = PlainChannel::new(client);
    channel.write_message(&[0xAB; 258]).unwrap();
    let mut header = [0u8; 4];
    server.read_exact(&mut header).unwrap();
    assert_eq!(header, [0, 0, 1, 2]);
}

#[test]
fn oversized_prefix_is_protocol_error() {
    use std::io::Write;
    use std::net::TcpListener;
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut raw = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    let mut channel = PlainChannel::with_config(
        server,
        ChannelConfig {
            max_frame_len: 1024,
            ..Default::default()
        },
    )
    .unwrap();
    raw.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
    match channel.read_message() {
        Err(Error::Protocol(_)) => (),
        other => panic!("expected protocol error, got {:?}", other),
    }
    assert!(channel.write_message(&[0u8; 1025]).is_err());
}

#[test]
fn peer_closing_is_connection_error() {
    let (a, mut b) = plain_pair();
    drop(a);
    match b.read_message() {
        Err(Error::Connection(_)) => (),
        other => panic!("expected connection error, got {:?}", other),
    }
}

#[test]
fn close_is_idempotent_and_final() {
    let (mut a, _b) = plain_pair();
    a.close().unwrap();
    a.close().unwrap();
    assert_eq!(a.state(), ChannelState::Closed);
    match a.write_message(b"late") {
        Err(Error::ClosedChannel) => (),
        other => panic!("expected closed channel error, got {:?}", other),
    }
    assert!(matches!(a.read_message(), Err(Error::ClosedChannel)));
}

#[test]
fn connect_rejects_secure_endpoint() {
    let info: EndpointInfo = "secure://127.0.0.1:1".parse().unwrap();
    match PlainChannel::connect(&info, ChannelConfig::default()) {
        Err(Error::TypeMismatch { expected, found }) => {
            assert_eq!(expected, TransportKind::Plain);
            assert_eq!(found, TransportKind::Secure);
        }
        Err(e) => panic!("expected type mismatch, got {:?}", e),
        Ok(_) => panic!("expected type mismatch"),
    }
}
