//! Masters submitting tasks to running simulation servers.

mod common;

use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use simfabric_net::{
    Codec, Engine, Error, Master, MasterConfig, MessageChannel, Result, ServerConfig, SimServer,
    TransportKind,
};

use common::{wait_for, Identity};

fn echo() -> Arc<dyn Engine> {
    Arc::new(|task: &[u8]| -> Result<Vec<u8>> { Ok(task.to_vec()) })
}

/// Echoes every task except `fail`, which it refuses.
fn picky() -> Arc<dyn Engine> {
    Arc::new(|task: &[u8]| -> Result<Vec<u8>> {
        if task == b"fail" {
            Err(Error::Engine("refusing task".to_string()))
        } else {
            Ok(task.to_vec())
        }
    })
}

fn loopback_config(transport: TransportKind) -> ServerConfig {
    ServerConfig {
        name: "test-worker".to_string(),
        address: "127.0.0.1".parse().unwrap(),
        transport,
        accept_delay_ms: 5,
        ..Default::default()
    }
}

fn master(tls: Option<Arc<simfabric_net::TlsConfig>>) -> Master {
    let config = MasterConfig {
        address: "127.0.0.1".parse().unwrap(),
        read_timeout_ms: Some(5000),
        ..Default::default()
    };
    Master::new(config, tls).unwrap()
}

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[test]
fn plain_server_echoes_tasks() {
    common::init_log();
    let server = SimServer::start(
        loopback_config(TransportKind::Plain),
        echo(),
        None,
        Arc::new(Codec::default()),
    )
    .unwrap();
    let info = server.local_info();
    assert_eq!(info.kind(), TransportKind::Plain);
    assert_eq!(info.port(), server.local_addr().port());

    let master = master(None);
    assert_eq!(master.submit(&info, b"step 1").unwrap(), b"step 1".to_vec());
    assert_eq!(master.submit(&info, b"").unwrap(), Vec::<u8>::new());

    let result: (u32, String) = master.submit_typed(&info, &(7u32, "agents".to_string())).unwrap();
    assert_eq!(result, (7, "agents".to_string()));
}

#[test]
fn secure_server_echoes_tasks() {
    common::init_log();
    let identity = Identity::generate();
    let server = SimServer::start(
        loopback_config(TransportKind::Secure),
        echo(),
        Some(identity.server_config()),
        Arc::new(Codec::default()),
    )
    .unwrap();
    let info = server.local_info();
    assert_eq!(info.kind(), TransportKind::Secure);

    let master = master(Some(identity.client_config()));
    let mut channel = master.connect(&info).unwrap();
    assert_eq!(channel.kind(), TransportKind::Secure);
    for i in 0..10u8 {
        assert_eq!(channel.request(&[i; 100]).unwrap(), vec![i; 100]);
    }
    channel.close().unwrap();
}

#[test]
fn secure_server_requires_identity() {
    let tls_without_identity = Identity::generate().client_config();
    match SimServer::start(
        loopback_config(TransportKind::Secure),
        echo(),
        Some(tls_without_identity),
        Arc::new(Codec::default()),
    ) {
        Err(Error::MissingTlsConfig(_)) => (),
        Err(e) => panic!("expected missing tls config, got {:?}", e),
        Ok(_) => panic!("secure server started without identity"),
    }
}

#[test]
fn failing_connection_leaves_others_served() {
    let server = SimServer::start(
        loopback_config(TransportKind::Plain),
        picky(),
        None,
        Arc::new(Codec::default()),
    )
    .unwrap();
    let info = server.local_info();
    let master = master(None);

    let mut healthy = master.connect(&info).unwrap();
    let mut failing = master.connect(&info).unwrap();
    assert_eq!(healthy.request(b"first").unwrap(), b"first".to_vec());

    match failing.request(b"fail") {
        Err(Error::Connection(_)) => (),
        other => panic!("expected connection error, got {:?}", other),
    }

    assert_eq!(healthy.request(b"second").unwrap(), b"second".to_vec());
    assert_eq!(master.submit(&info, b"fresh").unwrap(), b"fresh".to_vec());
}

#[test]
fn garbage_frame_closes_only_that_connection() {
    use std::io::Write;
    let server = SimServer::start(
        ServerConfig {
            max_frame_len: 1024,
            ..loopback_config(TransportKind::Plain)
        },
        echo(),
        None,
        Arc::new(Codec::default()),
    )
    .unwrap();
    let info = server.local_info();

    let mut raw = std::net::TcpStream::connect(info.socket_addr()).unwrap();
    raw.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();

    let master = master(None);
    assert_eq!(master.submit(&info, b"ok").unwrap(), b"ok".to_vec());
    assert!(server.is_running());
}

#[test]
fn connection_count_follows_clients() {
    let server = SimServer::start(
        loopback_config(TransportKind::Plain),
        echo(),
        None,
        Arc::new(Codec::default()),
    )
    .unwrap();
    let master = master(None);

    let mut channel = master.connect(&server.local_info()).unwrap();
    channel.request(b"hello").unwrap();
    assert_eq!(server.connection_count(), 1);

    channel.close().unwrap();
    assert!(wait_for(Duration::from_secs(2), || server.connection_count() == 0));
}

#[test]
fn idle_connection_is_closed_after_read_timeout() {
    let server = SimServer::start(
        ServerConfig {
            read_timeout_ms: Some(100),
            ..loopback_config(TransportKind::Plain)
        },
        echo(),
        None,
        Arc::new(Codec::default()),
    )
    .unwrap();
    let master = master(None);

    let mut channel = master.connect(&server.local_info()).unwrap();
    assert!(wait_for(Duration::from_secs(1), || server.connection_count() == 1));
    assert!(wait_for(Duration::from_secs(2), || server.connection_count() == 0));
    assert!(channel.request(b"too late").is_err());
}

#[test]
fn taken_port_is_bind_error() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let config = ServerConfig {
        port,
        ..loopback_config(TransportKind::Plain)
    };
    match SimServer::start(config, echo(), None, Arc::new(Codec::default())) {
        Err(Error::Bind { addr, .. }) => assert_eq!(addr.port(), port),
        Err(e) => panic!("expected bind error, got {:?}", e),
        Ok(_) => panic!("bound a taken port"),
    }
}

#[test]
fn taken_discovery_port_fails_start() {
    let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let config = ServerConfig {
        discovery_port: Some(port),
        ..loopback_config(TransportKind::Plain)
    };
    match SimServer::start(config, echo(), None, Arc::new(Codec::default())) {
        Err(Error::Bind { component, addr, .. }) => {
            assert!(component.contains("discovery"));
            assert_eq!(addr.port(), port);
        }
        Err(e) => panic!("expected bind error, got {:?}", e),
        Ok(_) => panic!("bound a taken discovery port"),
    }
}

#[test]
fn discoverable_server_is_found_and_serves() {
    common::init_log();
    let discovery_port = free_udp_port();
    let server = SimServer::start(
        ServerConfig {
            discovery_port: Some(discovery_port),
            ..loopback_config(TransportKind::Plain)
        },
        echo(),
        None,
        Arc::new(Codec::default()),
    )
    .unwrap();
    assert!(server.discovery().is_some());

    let master = master(None);
    let target: SocketAddr = format!("127.0.0.1:{}", discovery_port).parse().unwrap();
    let found = master
        .discover(&[target], Duration::from_millis(500))
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(found.contains(&server.local_info()));
    assert_eq!(master.known_workers(), found);
    assert!(server.known_masters().contains(&master.info()));

    let worker = *found.iter().next().unwrap();
    assert_eq!(master.submit(&worker, b"discovered").unwrap(), b"discovered".to_vec());
}

#[test]
fn undiscoverable_server_knows_no_masters() {
    let server = SimServer::start(
        loopback_config(TransportKind::Plain),
        echo(),
        None,
        Arc::new(Codec::default()),
    )
    .unwrap();
    assert!(server.discovery().is_none());
    assert!(server.known_masters().is_empty());
}

#[test]
fn stopped_server_refuses_connections() {
    let mut server = SimServer::start(
        loopback_config(TransportKind::Plain),
        echo(),
        None,
        Arc::new(Codec::default()),
    )
    .unwrap();
    let info = server.local_info();
    server.stop();
    assert!(!server.is_running());
    server.stop();

    let master = master(None);
    assert!(master.submit(&info, b"anyone?").is_err());
}
