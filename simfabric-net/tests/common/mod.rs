//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use simfabric_net::TlsConfig;

pub fn init_log() {
    let _ = simplelog::TestLogger::init(log::LevelFilter::Debug, simplelog::Config::default());
}

/// Self-signed identity valid for the loopback address.
pub struct Identity {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

impl Identity {
    pub fn generate() -> Self {
        let certified =
            rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string(), "localhost".to_string()])
                .unwrap();
        Identity {
            cert: certified.cert.der().clone(),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                certified.key_pair.serialize_der(),
            )),
        }
    }

    /// Config for a secure listener presenting this identity.
    pub fn server_config(&self) -> Arc<TlsConfig> {
        Arc::new(
            TlsConfig::builder()
                .with_identity(vec![self.cert.clone()], self.key.clone_key())
                .build()
                .unwrap(),
        )
    }

    /// Config for clients trusting only this identity.
    pub fn client_config(&self) -> Arc<TlsConfig> {
        Arc::new(
            TlsConfig::builder()
                .with_root(self.cert.clone())
                .build()
                .unwrap(),
        )
    }
}

/// Polls the condition until it holds or the timeout passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
