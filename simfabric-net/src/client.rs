use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::discovery::{self, DEFAULT_DISCOVERY_PORT};
use crate::encoding::{Codec, Serializer};
use crate::transport::{Channel, ChannelConfig, MessageChannel, TlsConfig, DEFAULT_MAX_FRAME_LEN};
use crate::{util, EndpointInfo, Encoding, Registry, Result, TransportKind};

/// Configuration for the `Master`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Address announced to workers, unspecified picks the default
    /// outbound interface
    pub address: IpAddr,
    /// Port announced to workers
    pub port: u16,
    /// Transport kind announced to workers
    #[serde(deserialize_with = "util::from_str")]
    pub transport: TransportKind,

    /// Addresses announces get sent to, broadcast included
    pub targets: Vec<SocketAddr>,
    /// Time spent collecting discovery responses
    pub discovery_wait_ms: u64,

    /// Bound on waiting for a task result, none waits forever
    pub read_timeout_ms: Option<u64>,
    pub max_frame_len: usize,
    #[serde(deserialize_with = "util::from_str")]
    pub encoding: Encoding,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            address: Ipv4Addr::UNSPECIFIED.into(),
            port: 0,
            transport: TransportKind::Plain,

            targets: vec![SocketAddr::new(
                Ipv4Addr::BROADCAST.into(),
                DEFAULT_DISCOVERY_PORT,
            )],
            discovery_wait_ms: 1000,

            read_timeout_ms: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            encoding: Encoding::Bincode,
        }
    }
}

/// Discovers workers and submits tasks to them.
///
/// Each submission opens its own channel, performs a single request and
/// closes the channel again. A `Master` holds no open connections between
/// calls, so a failing worker only affects the submissions sent its way.
pub struct Master {
    config: MasterConfig,
    info: EndpointInfo,
    codec: Arc<Codec>,
    tls: Option<Arc<TlsConfig>>,
    workers: Registry,
}

impl Master {
    /// Creates a new master, building the codec from the configured
    /// encoding.
    pub fn new(config: MasterConfig, tls: Option<Arc<TlsConfig>>) -> Result<Self> {
        let codec = Arc::new(Codec::new(config.encoding)?);
        Ok(Self::with_codec(config, tls, codec))
    }

    pub fn with_codec(config: MasterConfig, tls: Option<Arc<TlsConfig>>, codec: Arc<Codec>) -> Self {
        let info = EndpointInfo::new(
            util::advertised_ip(config.address, None),
            config.port,
            config.transport,
        );
        Self {
            config,
            info,
            codec,
            tls,
            workers: Registry::new(),
        }
    }

    /// Descriptor this master announces itself with.
    pub fn info(&self) -> EndpointInfo {
        self.info
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    /// Announces to the given targets and records every worker that
    /// answers within `wait`.
    ///
    /// Returns the workers that answered this round.
    pub fn discover(
        &self,
        targets: &[SocketAddr],
        wait: Duration,
    ) -> Result<FnvHashSet<EndpointInfo>> {
        let found = discovery::announce(&self.info, targets, wait, &self.codec)?;
        for worker in &found {
            if self.workers.insert(*worker) {
                debug!("new worker: {}", worker);
            }
        }
        info!(
            "discovery round found {} worker(s), {} known in total",
            found.len(),
            self.workers.len()
        );
        Ok(found)
    }

    /// Runs discovery against the configured targets.
    pub fn discover_configured(&self) -> Result<FnvHashSet<EndpointInfo>> {
        self.discover(
            &self.config.targets,
            Duration::from_millis(self.config.discovery_wait_ms),
        )
    }

    /// Workers discovered so far.
    pub fn known_workers(&self) -> FnvHashSet<EndpointInfo> {
        self.workers.snapshot()
    }

    /// Opens a channel of the worker's transport kind.
    pub fn connect(&self, worker: &EndpointInfo) -> Result<Channel> {
        let config = ChannelConfig {
            max_frame_len: self.config.max_frame_len,
            read_timeout: util::millis(self.config.read_timeout_ms),
        };
        Channel::connect(worker, self.tls.as_deref(), config)
    }

    /// Sends a raw task payload and waits for its result.
    pub fn submit(&self, worker: &EndpointInfo, task: &[u8]) -> Result<Vec<u8>> {
        let mut channel = self.connect(worker)?;
        let result = channel.request(task);
        let _ = channel.close();
        result
    }

    /// Encodes the task with the master's codec, submits it, and decodes
    /// the result.
    pub fn submit_typed<T: Serialize, R: DeserializeOwned>(
        &self,
        worker: &EndpointInfo,
        task: &T,
    ) -> Result<R> {
        let bytes = self.submit(worker, &self.codec.encode(task)?)?;
        self.codec.decode(&bytes)
    }
}

#[test]
fn master_config_from_toml() {
    let config: MasterConfig = toml::from_str(
        r#"
        targets = ["192.168.1.255:59119", "10.0.0.3:6000"]
        discovery_wait_ms = 250
        transport = "secure"
        "#,
    )
    .unwrap();
    assert_eq!(config.targets.len(), 2);
    assert_eq!(config.transport, TransportKind::Secure);
    assert_eq!(config.encoding, Encoding::Bincode);
}

#[test]
fn submit_to_unreachable_worker_is_connection_error() {
    use std::net::TcpListener;
    // grab a free port, then release it so nothing listens there
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let master = Master::new(MasterConfig::default(), None).unwrap();
    let worker = EndpointInfo::new("127.0.0.1".parse().unwrap(), port, TransportKind::Plain);
    match master.submit(&worker, b"task") {
        Err(crate::Error::Connection(_)) => (),
        other => panic!("expected connection error, got {:?}", other),
    }
}
