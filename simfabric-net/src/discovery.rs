//! Connectionless discovery protocol.
//!
//! # Overview
//!
//! Masters find workers by sending an *announce* datagram to the known
//! discovery port of the workers (typically broadcast on the local
//! network). The announce carries the master's own [`EndpointInfo`],
//! encoded with the deployment's [`Codec`].
//!
//! A worker's [`DiscoveryService`] decodes the announce, records the master
//! in its [`Registry`], and answers the datagram's source address with the
//! worker's own descriptor, encoded the same way. The master then opens a
//! channel directly to the worker using that descriptor.
//!
//! There is no version negotiation, both ends have to run the same codec
//! and message shape. Datagrams may get lost, masters are expected to
//! announce again if they're missing workers.
//!
//! # Fault isolation
//!
//! A datagram that doesn't decode, or a reply that can't be delivered, is
//! logged and dropped. Neither ends the receive loop. Only failing to bind
//! the socket at startup is fatal, and that is reported to the caller of
//! [`DiscoveryService::start`].

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fnv::FnvHashSet;

use crate::encoding::{Codec, Serializer};
use crate::{EndpointInfo, Error, Result};

/// Port workers listen on for announces unless configured otherwise.
pub const DEFAULT_DISCOVERY_PORT: u16 = 59119;

/// Largest datagram payload that fits in a single udp packet.
const DATAGRAM_BUF_SIZE: usize = 65507;

/// Interval at which the receive loop checks whether it should stop.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Set of known peer descriptors.
///
/// Inserting a descriptor that is already present changes nothing. Reads
/// go through snapshot copies, so iterating never races with concurrent
/// inserts.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<FnvHashSet<EndpointInfo>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the descriptor, returning whether it was not known before.
    pub fn insert(&self, info: EndpointInfo) -> bool {
        self.lock().insert(info)
    }

    pub fn contains(&self, info: &EndpointInfo) -> bool {
        self.lock().contains(info)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Point-in-time copy of the registry contents.
    pub fn snapshot(&self) -> FnvHashSet<EndpointInfo> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FnvHashSet<EndpointInfo>> {
        // set operations can't leave the set half-updated
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Worker side of the discovery protocol.
///
/// Owns the datagram socket's receive loop, running on its own thread,
/// and the registry of masters that announced themselves.
pub struct DiscoveryService {
    local_addr: SocketAddr,
    own_info: EndpointInfo,
    registry: Arc<Registry>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DiscoveryService {
    /// Starts listening for announces on the given port on all interfaces.
    pub fn start(port: u16, own_info: EndpointInfo, codec: Arc<Codec>) -> Result<Self> {
        Self::start_at(
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
            own_info,
            codec,
        )
    }

    /// Starts listening for announces at the given address.
    ///
    /// Binding happens before this returns, a taken port is reported here.
    pub fn start_at(addr: SocketAddr, own_info: EndpointInfo, codec: Arc<Codec>) -> Result<Self> {
        let socket = UdpSocket::bind(addr).map_err(|source| Error::Bind {
            component: "discovery service",
            addr,
            source,
        })?;
        socket.set_read_timeout(Some(STOP_POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;
        info!(
            "listening for discovery messages on: {} (announcing {})",
            local_addr, own_info
        );

        let registry = Arc::new(Registry::new());
        let running = Arc::new(AtomicBool::new(true));

        let mut receiver = Receiver {
            socket,
            own_info,
            codec,
            registry: registry.clone(),
            running: running.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("discovery-{}", local_addr.port()))
            .spawn(move || receiver.run())?;

        Ok(Self {
            local_addr,
            own_info,
            registry,
            running,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn own_info(&self) -> EndpointInfo {
        self.own_info
    }

    /// Snapshot of the masters known at the time of the call.
    pub fn known_masters(&self) -> FnvHashSet<EndpointInfo> {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.handle.is_some()
    }

    /// Stops the receive loop and waits for its thread to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("discovery thread on {} panicked", self.local_addr);
            }
            info!("stopped discovery service on: {}", self.local_addr);
        }
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved into the receive loop thread.
struct Receiver {
    socket: UdpSocket,
    own_info: EndpointInfo,
    codec: Arc<Codec>,
    registry: Arc<Registry>,
    running: Arc<AtomicBool>,
}

impl Receiver {
    fn run(&mut self) {
        let mut buf = vec![0u8; DATAGRAM_BUF_SIZE];
        while self.running.load(Ordering::SeqCst) {
            let (len, src) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) => {
                    // e.g. icmp port unreachable surfacing from a previous reply
                    warn!("discovery receive failed: {}", e);
                    thread::sleep(STOP_POLL_INTERVAL);
                    continue;
                }
            };
            self.handle_announce(&buf[..len], src);
        }
        debug!("discovery receive loop exiting");
    }

    fn handle_announce(&self, bytes: &[u8], src: SocketAddr) {
        let master_info: EndpointInfo = match self.codec.decode(bytes) {
            Ok(info) => info,
            Err(e) => {
                warn!("discarding malformed announce from {}: {}", src, e);
                return;
            }
        };
        if self.registry.insert(master_info) {
            info!("discovered by master: {} (from {})", master_info, src);
        } else {
            debug!("repeated announce from master: {}", master_info);
        }

        let response = match self.codec.encode(&self.own_info) {
            Ok(r) => r,
            Err(e) => {
                error!("failed encoding discovery response: {}", e);
                return;
            }
        };
        match self.socket.send_to(&response, src) {
            Ok(_) => trace!("sent discovery response to {}", src),
            Err(e) => warn!("failed sending discovery response to {}: {}", src, e),
        }
        trace!("currently known masters: {}", self.registry.len());
    }
}

/// Master side of the discovery protocol.
///
/// Sends `own_info` to each of the targets (broadcast addresses included)
/// and gathers the distinct descriptors that come back before `wait`
/// elapses.
pub fn announce(
    own_info: &EndpointInfo,
    targets: &[SocketAddr],
    wait: Duration,
    codec: &Codec,
) -> Result<FnvHashSet<EndpointInfo>> {
    let bind_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0);
    let socket = UdpSocket::bind(bind_addr).map_err(|source| Error::Bind {
        component: "discovery announcer",
        addr: bind_addr,
        source,
    })?;
    socket.set_broadcast(true)?;

    let announce = codec.encode(own_info)?;
    for target in targets {
        match socket.send_to(&announce, target) {
            Ok(_) => debug!("sent announce to {}", target),
            Err(e) => warn!("failed sending announce to {}: {}", target, e),
        }
    }

    let mut found = FnvHashSet::default();
    let mut buf = vec![0u8; DATAGRAM_BUF_SIZE];
    let deadline = Instant::now() + wait;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        socket.set_read_timeout(Some(deadline - now))?;
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                break
            }
            Err(e) => {
                warn!("discovery response receive failed: {}", e);
                continue;
            }
        };
        match codec.decode::<EndpointInfo>(&buf[..len]) {
            Ok(worker) => {
                if found.insert(worker) {
                    info!("discovered worker: {} (from {})", worker, src);
                }
            }
            Err(e) => warn!("discarding malformed discovery response from {}: {}", src, e),
        }
    }
    Ok(found)
}

#[test]
fn registry_absorbs_duplicates() {
    use crate::TransportKind;
    let registry = Registry::new();
    let info = EndpointInfo::new("10.0.0.1".parse().unwrap(), 5000, TransportKind::Plain);
    assert!(registry.insert(info));
    assert!(!registry.insert(info));
    assert_eq!(registry.len(), 1);
    let other = EndpointInfo::new("10.0.0.1".parse().unwrap(), 5000, TransportKind::Secure);
    assert!(registry.insert(other));
    assert_eq!(registry.snapshot().len(), 2);
}

#[test]
fn registry_concurrent_inserts_keep_set_semantics() {
    use crate::TransportKind;
    let registry = Arc::new(Registry::new());
    // every thread inserts the same 50 descriptors
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || {
                for port in 0..50u16 {
                    registry.insert(EndpointInfo::new(
                        "10.0.0.2".parse().unwrap(),
                        port,
                        TransportKind::Plain,
                    ));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(registry.len(), 50);
}
