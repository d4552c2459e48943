//! Worker side simulation server.
//!
//! # Overview
//!
//! `SimServer` exposes a single listener of one transport kind. Every
//! accepted connection is served on its own thread: task payloads are read
//! off the channel one frame at a time, handed to the [`Engine`], and the
//! engine's result is written back as the reply frame.
//!
//! # Discoverable servers
//!
//! Setting `discovery_port` in the [`ServerConfig`] makes the server
//! discoverable. Next to the listener it then owns a [`DiscoveryService`]
//! announcing the server's own descriptor, so masters broadcasting on the
//! local network learn where to connect.
//!
//! # Failures
//!
//! Anything going wrong with a single connection, be it a failed
//! handshake, an undecodable frame, an engine error or the peer going
//! away, only ends that connection. The accept loop keeps going. Failing
//! to bind either the listener or the discovery socket fails `start`.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fnv::FnvHashSet;
use serde::Deserialize;

use crate::encoding::{Codec, Serializer};
use crate::transport::{
    AcceptedStream, Channel, ChannelConfig, Listener, MessageChannel, TlsConfig,
    DEFAULT_MAX_FRAME_LEN,
};
use crate::{util, DiscoveryService, EndpointInfo, Encoding, Error, Result, TransportKind};

/// Executes task payloads received by the server.
///
/// The engine is shared by all connection threads.
pub trait Engine: Send + Sync {
    fn execute(&self, task: &[u8]) -> Result<Vec<u8>>;
}

impl<F> Engine for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync,
{
    fn execute(&self, task: &[u8]) -> Result<Vec<u8>> {
        self(task)
    }
}

/// Configuration for the `SimServer`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name of the server, used for logging
    pub name: String,
    /// Address to bind the listener to
    pub address: IpAddr,
    /// Port to bind the listener to, zero picks any free port
    pub port: u16,
    /// Transport kind of accepted connections
    #[serde(deserialize_with = "util::from_str")]
    pub transport: TransportKind,

    /// Datagram port for discovery, none makes the server undiscoverable
    pub discovery_port: Option<u16>,
    /// Announced instead of the bound address when set
    pub advertise_address: Option<IpAddr>,

    /// Idle time after which a connection gets closed, none waits forever
    pub read_timeout_ms: Option<u64>,
    /// Delay between polling for new incoming connections
    pub accept_delay_ms: u64,
    /// Largest task payload accepted in a single frame
    pub max_frame_len: usize,
    /// Encoding used for discovery messages, the codec given at start
    /// has to match it
    #[serde(deserialize_with = "util::from_str")]
    pub encoding: Encoding,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            name: "".to_string(),
            address: Ipv4Addr::UNSPECIFIED.into(),
            port: 0,
            transport: TransportKind::Plain,

            discovery_port: None,
            advertise_address: None,

            read_timeout_ms: None,
            accept_delay_ms: 20,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            encoding: Encoding::Bincode,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            max_frame_len: self.max_frame_len,
            read_timeout: util::millis(self.read_timeout_ms),
        }
    }
}

/// Server accepting task connections from masters.
pub struct SimServer {
    config: ServerConfig,
    local_addr: SocketAddr,
    local_info: EndpointInfo,
    codec: Arc<Codec>,

    /// Present only for discoverable servers
    discovery: Option<DiscoveryService>,

    running: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl SimServer {
    /// Binds the listener, starts discovery if configured, and spawns the
    /// accept loop.
    ///
    /// Secure servers need a `tls` config holding a server identity. The
    /// `codec` must be of the configured encoding.
    pub fn start(
        config: ServerConfig,
        engine: Arc<dyn Engine>,
        tls: Option<Arc<TlsConfig>>,
        codec: Arc<Codec>,
    ) -> Result<Self> {
        if codec.kind() != config.encoding {
            return Err(Error::EncodingMismatch {
                configured: config.encoding,
                given: codec.kind(),
            });
        }
        let listener = Listener::bind(config.listen_addr(), config.transport, tls)?;
        let local_addr = listener.local_addr()?;
        let local_info = EndpointInfo::new(
            util::advertised_ip(local_addr.ip(), config.advertise_address),
            local_addr.port(),
            config.transport,
        );
        info!(
            "starting server {}on: {} (advertised as {})",
            if config.name.is_empty() {
                "".to_string()
            } else {
                format!("\"{}\" ", config.name)
            },
            local_addr,
            local_info
        );

        let discovery = match config.discovery_port {
            Some(port) => Some(DiscoveryService::start_at(
                SocketAddr::new(config.address, port),
                local_info,
                codec.clone(),
            )?),
            None => None,
        };

        let running = Arc::new(AtomicBool::new(true));
        let connections = Arc::new(AtomicUsize::new(0));

        let acceptor = Acceptor {
            listener,
            engine,
            channel_config: config.channel_config(),
            accept_delay: Duration::from_millis(config.accept_delay_ms),
            running: running.clone(),
            connections: connections.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("accept-{}", local_addr.port()))
            .spawn(move || acceptor.run())?;

        Ok(Self {
            config,
            local_addr,
            local_info,
            codec,
            discovery,
            running,
            connections,
            handle: Some(handle),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Descriptor masters should use to connect to this server.
    pub fn local_info(&self) -> EndpointInfo {
        self.local_info
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub fn discovery(&self) -> Option<&DiscoveryService> {
        self.discovery.as_ref()
    }

    /// Masters that announced themselves so far. Always empty for servers
    /// that aren't discoverable.
    pub fn known_masters(&self) -> FnvHashSet<EndpointInfo> {
        self.discovery
            .as_ref()
            .map(|d| d.known_masters())
            .unwrap_or_default()
    }

    /// Number of connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.handle.is_some()
    }

    /// Stops accepting connections and shuts down discovery.
    ///
    /// Connection threads still blocked on a read finish once their peer
    /// goes away or their read timeout expires.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("accept thread of server on {} panicked", self.local_addr);
            }
            info!("stopped server on: {}", self.local_addr);
        }
        if let Some(discovery) = &mut self.discovery {
            discovery.stop();
        }
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved into the accept loop thread.
struct Acceptor {
    listener: Listener,
    engine: Arc<dyn Engine>,
    channel_config: ChannelConfig,
    accept_delay: Duration,
    running: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
}

impl Acceptor {
    fn run(self) {
        while self.running.load(Ordering::SeqCst) {
            match self.listener.try_accept() {
                Ok(Some((accepted, peer))) => self.spawn_connection(accepted, peer),
                Ok(None) => thread::sleep(self.accept_delay),
                Err(e) => {
                    warn!("failed accepting connection: {}", e);
                    thread::sleep(self.accept_delay);
                }
            }
        }
        debug!("accept loop exiting");
    }

    fn spawn_connection(&self, accepted: AcceptedStream, peer: SocketAddr) {
        debug!("accepted {} connection from {}", accepted.kind(), peer);
        self.connections.fetch_add(1, Ordering::SeqCst);
        let guard = ConnectionGuard(self.connections.clone());
        let engine = self.engine.clone();
        let running = self.running.clone();
        let config = self.channel_config;
        let spawned = thread::Builder::new()
            .name(format!("conn-{}", peer))
            .spawn(move || {
                let _guard = guard;
                serve_connection(accepted, peer, engine, config, running)
            });
        if let Err(e) = spawned {
            error!("failed spawning thread for connection from {}: {}", peer, e);
        }
    }
}

/// Decrements the live connection count when dropped.
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn serve_connection(
    accepted: AcceptedStream,
    peer: SocketAddr,
    engine: Arc<dyn Engine>,
    config: ChannelConfig,
    running: Arc<AtomicBool>,
) {
    let kind = accepted.kind();
    let mut channel = match Channel::from_accepted(accepted, config) {
        Ok(c) => c,
        Err(e) => {
            warn!("failed establishing {} channel with {}: {}", kind, peer, e);
            return;
        }
    };

    let mut served = 0usize;
    while running.load(Ordering::SeqCst) {
        let task = match channel.read_message() {
            Ok(t) => t,
            Err(Error::Connection(ref e)) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("peer {} closed the connection", peer);
                break;
            }
            Err(Error::TimedOut) => {
                info!("connection with {} idle past its read timeout", peer);
                break;
            }
            Err(e) => {
                warn!("failed reading task from {}: {}", peer, e);
                break;
            }
        };
        let result = match engine.execute(&task) {
            Ok(r) => r,
            Err(e) => {
                warn!("engine failed on task from {}: {}", peer, e);
                break;
            }
        };
        if let Err(e) = channel.write_message(&result) {
            warn!("failed writing result to {}: {}", peer, e);
            break;
        }
        served += 1;
    }

    let _ = channel.close();
    debug!("connection with {} done, tasks served: {}", peer, served);
}

#[test]
fn config_defaults_when_fields_missing() {
    let config: ServerConfig = toml::from_str(
        r#"
        name = "worker-1"
        port = 7000
        transport = "tls"
        discovery_port = 59119
        read_timeout_ms = 0
        encoding = "msgpack"
        "#,
    )
    .unwrap();
    assert_eq!(config.name, "worker-1");
    assert_eq!(config.transport, TransportKind::Secure);
    assert_eq!(config.encoding, Encoding::MsgPack);
    assert_eq!(config.discovery_port, Some(59119));
    assert_eq!(config.accept_delay_ms, ServerConfig::default().accept_delay_ms);
    assert!(config.address.is_unspecified());
    assert_eq!(config.channel_config().read_timeout, None);
}

#[test]
fn config_rejects_unknown_transport() {
    assert!(toml::from_str::<ServerConfig>(r#"transport = "quic""#).is_err());
}

#[test]
fn closures_are_engines() {
    let engine: Arc<dyn Engine> =
        Arc::new(|task: &[u8]| -> Result<Vec<u8>> { Ok(task.iter().rev().cloned().collect()) });
    assert_eq!(engine.execute(b"abc").unwrap(), b"cba".to_vec());
}

#[test]
fn codec_must_match_configured_encoding() {
    let config = ServerConfig {
        address: Ipv4Addr::LOCALHOST.into(),
        encoding: Encoding::Json,
        ..Default::default()
    };
    let engine: Arc<dyn Engine> = Arc::new(|task: &[u8]| -> Result<Vec<u8>> { Ok(task.to_vec()) });
    match SimServer::start(config, engine, None, Arc::new(Codec::default())) {
        Err(Error::EncodingMismatch { configured, given }) => {
            assert_eq!(configured, Encoding::Json);
            assert_eq!(given, Encoding::Bincode);
        }
        Err(e) => panic!("expected encoding mismatch, got {:?}", e),
        Ok(_) => panic!("server started with a mismatched codec"),
    }
}
