//! Deployment configuration read from a toml file.
//!
//! ```toml
//! [worker]
//! port = 7000
//! transport = "secure"
//! discovery_port = 59119
//!
//! [master]
//! targets = ["192.168.1.255:59119"]
//!
//! [tls]
//! cert = "worker.crt"
//! key = "worker.key"
//! roots = ["ca.crt"]
//! ```

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::transport::{TlsConfig, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::{Error, MasterConfig, Result, ServerConfig};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub worker: ServerConfig,
    pub master: MasterConfig,
    pub tls: Option<TlsFiles>,
}

impl FabricConfig {
    /// Reads the config from a toml file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| {
            Error::Other(format!("failed opening config {}: {}", path.display(), e))
        })?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let config = Self::from_toml(&content)?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Builds the tls config, if a `[tls]` section was present.
    pub fn tls_config(&self) -> Result<Option<TlsConfig>> {
        self.tls.as_ref().map(|t| t.to_tls_config()).transpose()
    }
}

/// Paths to PEM files along with tls session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsFiles {
    /// Certificate chain presented by secure listeners
    pub cert: Option<PathBuf>,
    /// Private key matching `cert`
    pub key: Option<PathBuf>,
    /// Certificates trusted when connecting to secure endpoints
    pub roots: Vec<PathBuf>,
    /// Setting this to false accepts any server certificate
    pub verify: bool,
    pub server_name: Option<String>,
    pub handshake_timeout_ms: u64,
}

impl Default for TlsFiles {
    fn default() -> Self {
        TlsFiles {
            cert: None,
            key: None,
            roots: Vec::new(),
            verify: true,
            server_name: None,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl TlsFiles {
    pub fn to_tls_config(&self) -> Result<TlsConfig> {
        let mut builder = TlsConfig::builder()
            .with_handshake_timeout(Duration::from_millis(self.handshake_timeout_ms));
        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => builder = builder.with_identity_files(cert, key)?,
            (None, None) => (),
            _ => {
                return Err(Error::TlsConfig(
                    "cert and key have to be provided together".to_string(),
                ))
            }
        }
        for root in &self.roots {
            builder = builder.with_roots_file(root)?;
        }
        if !self.verify {
            warn!("tls server certificate verification is disabled");
            builder = builder.dangerous_disable_verification();
        }
        if let Some(name) = &self.server_name {
            builder = builder.with_server_name(name);
        }
        builder.build()
    }
}

#[test]
fn full_config_from_toml() {
    let config = FabricConfig::from_toml(
        r#"
        [worker]
        name = "w1"
        port = 7000
        transport = "secure"
        discovery_port = 59119
        read_timeout_ms = 5000

        [master]
        targets = ["127.0.0.1:59119"]
        encoding = "json"

        [tls]
        verify = false
        server_name = "localhost"
        "#,
    )
    .unwrap();
    assert_eq!(config.worker.port, 7000);
    assert_eq!(config.worker.discovery_port, Some(59119));
    assert_eq!(config.master.encoding, crate::Encoding::Json);
    let tls = config.tls.as_ref().unwrap();
    assert!(!tls.verify);
    assert!(tls.roots.is_empty());
    assert!(config.tls_config().unwrap().unwrap().client_config().is_some());
}

#[test]
fn empty_config_uses_defaults() {
    let config = FabricConfig::from_toml("").unwrap();
    assert!(config.tls.is_none());
    assert_eq!(config.worker.discovery_port, None);
    assert!(config.tls_config().unwrap().is_none());
}

#[test]
fn cert_without_key_is_rejected() {
    let files = TlsFiles {
        cert: Some(PathBuf::from("worker.crt")),
        ..Default::default()
    };
    assert!(matches!(files.to_tls_config(), Err(Error::TlsConfig(_))));
}

#[test]
fn invalid_toml_is_config_error() {
    assert!(matches!(
        FabricConfig::from_toml("[worker\nport = 1"),
        Err(Error::ConfigError(_))
    ));
}
