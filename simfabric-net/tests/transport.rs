//! Framed channels over loopback, in both plain and secure flavors.

mod common;

use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use simfabric_net::transport::{PlainChannel, SecureChannel};
use simfabric_net::{
    Channel, ChannelConfig, ChannelState, EndpointInfo, Error, Listener, MessageChannel, TlsConfig,
    TransportKind,
};

use common::Identity;

const MAX_FRAME: usize = 4 * 1024 * 1024;

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn config() -> ChannelConfig {
    ChannelConfig {
        max_frame_len: MAX_FRAME,
        read_timeout: None,
    }
}

/// Connects a client channel to a freshly bound listener of the given
/// kind and returns both ends.
fn channel_pair(
    kind: TransportKind,
    server_tls: Option<Arc<TlsConfig>>,
    client_tls: Option<Arc<TlsConfig>>,
) -> (Channel, Channel) {
    let listener = Listener::bind(loopback(), kind, server_tls).unwrap();
    let endpoint = EndpointInfo::from_socket_addr(listener.local_addr().unwrap(), kind);

    let server = thread::spawn(move || loop {
        if let Some((accepted, _)) = listener.try_accept().unwrap() {
            return Channel::from_accepted(accepted, config()).unwrap();
        }
        thread::sleep(Duration::from_millis(5));
    });
    let client = Channel::connect(&endpoint, client_tls.as_deref(), config()).unwrap();
    (client, server.join().unwrap())
}

fn plain_pair() -> (Channel, Channel) {
    channel_pair(TransportKind::Plain, None, None)
}

fn secure_pair() -> (Channel, Channel) {
    let identity = Identity::generate();
    channel_pair(
        TransportKind::Secure,
        Some(identity.server_config()),
        Some(identity.client_config()),
    )
}

fn check_frame_fidelity(mut client: Channel, mut server: Channel) {
    let sizes = [0usize, 1, 65536, MAX_FRAME];
    let payloads: Vec<Vec<u8>> = sizes
        .iter()
        .map(|size| (0..*size).map(|i| (i % 251) as u8).collect())
        .collect();

    let expected = payloads.clone();
    let writer = thread::spawn(move || {
        for payload in &payloads {
            client.write_message(payload).unwrap();
        }
        client
    });
    for payload in &expected {
        let received = server.read_message().unwrap();
        assert_eq!(received.len(), payload.len());
        assert!(received == *payload, "payload of {} bytes corrupted", payload.len());
    }
    writer.join().unwrap();
}

#[test]
fn plain_frames_are_byte_identical() {
    common::init_log();
    let (client, server) = plain_pair();
    assert_eq!(client.kind(), TransportKind::Plain);
    check_frame_fidelity(client, server);
}

#[test]
fn secure_frames_are_byte_identical() {
    common::init_log();
    let (client, server) = secure_pair();
    assert_eq!(client.kind(), TransportKind::Secure);
    assert_eq!(server.kind(), TransportKind::Secure);
    check_frame_fidelity(client, server);
}

#[test]
fn secure_channel_replies_both_ways() {
    let (mut client, mut server) = secure_pair();
    let responder = thread::spawn(move || {
        let task = server.read_message().unwrap();
        server.write_message(&[task, b" done".to_vec()].concat()).unwrap();
        server
    });
    assert_eq!(client.request(b"task").unwrap(), b"task done".to_vec());
    let mut server = responder.join().unwrap();
    client.close().unwrap();
    assert!(matches!(server.read_message(), Err(Error::Connection(_))));
}

#[test]
fn secure_connect_with_plain_endpoint_opens_no_socket() {
    let listener = TcpListener::bind(loopback()).unwrap();
    listener.set_nonblocking(true).unwrap();
    let endpoint =
        EndpointInfo::from_socket_addr(listener.local_addr().unwrap(), TransportKind::Plain);
    let tls = Identity::generate().client_config();

    match SecureChannel::connect(&endpoint, &tls, ChannelConfig::default()) {
        Err(Error::TypeMismatch { expected, found }) => {
            assert_eq!(expected, TransportKind::Secure);
            assert_eq!(found, TransportKind::Plain);
        }
        Err(e) => panic!("expected type mismatch, got {:?}", e),
        Ok(_) => panic!("expected type mismatch"),
    }

    thread::sleep(Duration::from_millis(100));
    match listener.accept() {
        Err(ref e) if e.kind() == ErrorKind::WouldBlock => (),
        Err(e) => panic!("unexpected accept error: {}", e),
        Ok((_, peer)) => panic!("unexpected connection from {}", peer),
    }
}

#[test]
fn secure_endpoint_without_tls_config_is_rejected() {
    let endpoint: EndpointInfo = "secure://127.0.0.1:1".parse().unwrap();
    assert!(matches!(
        Channel::connect(&endpoint, None, ChannelConfig::default()),
        Err(Error::MissingTlsConfig(_))
    ));
    assert!(matches!(
        Listener::bind(loopback(), TransportKind::Secure, None),
        Err(Error::MissingTlsConfig(_))
    ));
}

#[test]
fn plain_channel_from_secure_accept_is_type_mismatch() {
    let identity = Identity::generate();
    let listener =
        Listener::bind(loopback(), TransportKind::Secure, Some(identity.server_config())).unwrap();
    let _raw = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let accepted = loop {
        if let Some((accepted, _)) = listener.try_accept().unwrap() {
            break accepted;
        }
        thread::sleep(Duration::from_millis(5));
    };
    assert!(matches!(
        PlainChannel::from_accepted(accepted, ChannelConfig::default()),
        Err(Error::TypeMismatch { .. })
    ));
}

#[test]
fn untrusted_certificate_fails_handshake() {
    common::init_log();
    let server_identity = Identity::generate();
    let other_identity = Identity::generate();

    let listener = Listener::bind(
        loopback(),
        TransportKind::Secure,
        Some(server_identity.server_config()),
    )
    .unwrap();
    let endpoint =
        EndpointInfo::from_socket_addr(listener.local_addr().unwrap(), TransportKind::Secure);
    let server = thread::spawn(move || loop {
        if let Some((accepted, _)) = listener.try_accept().unwrap() {
            return Channel::from_accepted(accepted, ChannelConfig::default()).is_err();
        }
        thread::sleep(Duration::from_millis(5));
    });

    let client_tls = other_identity.client_config();
    match Channel::connect(&endpoint, Some(&*client_tls), ChannelConfig::default()) {
        Err(Error::Handshake(_)) => (),
        Err(e) => panic!("expected handshake error, got {:?}", e),
        Ok(_) => panic!("handshake with untrusted certificate succeeded"),
    }
    assert!(server.join().unwrap(), "server side handshake should fail too");
}

#[test]
fn handshake_timeout_bounds_a_trickling_peer() {
    let identity = Identity::generate();
    let tls = Arc::new(
        TlsConfig::builder()
            .with_identity(vec![identity.cert.clone()], identity.key.clone_key())
            .with_handshake_timeout(Duration::from_millis(300))
            .build()
            .unwrap(),
    );
    let listener = Listener::bind(loopback(), TransportKind::Secure, Some(tls)).unwrap();
    let addr = listener.local_addr().unwrap();

    // record header announcing 512 bytes of client hello, then one byte
    // at a time, each well within the timeout
    let peer = thread::spawn(move || {
        let mut raw = TcpStream::connect(addr).unwrap();
        raw.write_all(&[0x16, 0x03, 0x01, 0x02, 0x00]).unwrap();
        for _ in 0..20 {
            thread::sleep(Duration::from_millis(100));
            if raw.write_all(&[0x01]).is_err() {
                break;
            }
        }
    });

    let accepted = loop {
        if let Some((accepted, _)) = listener.try_accept().unwrap() {
            break accepted;
        }
        thread::sleep(Duration::from_millis(5));
    };
    let start = Instant::now();
    match Channel::from_accepted(accepted, ChannelConfig::default()) {
        Err(Error::Handshake(_)) => (),
        Err(e) => panic!("expected handshake error, got {:?}", e),
        Ok(_) => panic!("handshake with a trickling peer succeeded"),
    }
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(800), "returned after {:?}", elapsed);
    peer.join().unwrap();
}

#[test]
fn read_timeout_leaves_channel_open() {
    let (mut client, mut server) = plain_pair();
    server.set_timeout(Some(Duration::from_millis(100))).unwrap();

    let start = Instant::now();
    match server.read_message() {
        Err(Error::TimedOut) => (),
        other => panic!("expected timeout, got {:?}", other),
    }
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(90), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(150), "returned after {:?}", elapsed);
    assert_eq!(server.state(), ChannelState::Open);

    client.write_message(b"late data").unwrap();
    assert_eq!(server.read_message().unwrap(), b"late data".to_vec());
}

#[test]
fn secure_read_timeout_leaves_channel_open() {
    let (mut client, mut server) = secure_pair();
    server.set_timeout(Some(Duration::from_millis(100))).unwrap();
    assert!(matches!(server.read_message(), Err(Error::TimedOut)));
    assert_eq!(server.state(), ChannelState::Open);
    client.write_message(b"still there").unwrap();
    assert_eq!(server.read_message().unwrap(), b"still there".to_vec());
}

#[test]
fn partial_frame_survives_timeout() {
    let listener = TcpListener::bind(loopback()).unwrap();
    let mut raw = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    let mut channel = PlainChannel::new(accepted);
    channel.set_timeout(Some(Duration::from_millis(100))).unwrap();

    raw.write_all(&[0, 0, 0, 6, b'h', b'a']).unwrap();
    assert!(matches!(channel.read_message(), Err(Error::TimedOut)));
    raw.write_all(b"lves").unwrap();
    assert_eq!(channel.read_message().unwrap(), b"halves".to_vec());
}

#[test]
fn failing_connection_leaves_sibling_untouched() {
    let (failing_client, mut failing_server) = plain_pair();
    let (mut client, mut server) = plain_pair();

    // peer goes away in the middle of the exchange
    drop(failing_client);
    assert!(matches!(
        failing_server.read_message(),
        Err(Error::Connection(_))
    ));

    client.write_message(b"ping").unwrap();
    assert_eq!(server.read_message().unwrap(), b"ping".to_vec());
    server.write_message(b"pong").unwrap();
    assert_eq!(client.read_message().unwrap(), b"pong".to_vec());
}

#[test]
fn closed_channel_refuses_io() {
    let (mut client, _server) = secure_pair();
    client.close().unwrap();
    client.close().unwrap();
    assert_eq!(client.state(), ChannelState::Closed);
    assert!(matches!(
        client.write_message(b"x"),
        Err(Error::ClosedChannel)
    ));
}
