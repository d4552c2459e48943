//! Announce/response exchange against a live discovery service.

mod common;

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use simfabric_net::{
    announce, Codec, DiscoveryService, EndpointInfo, Encoding, Error, Serializer, TransportKind,
};

fn worker_info() -> EndpointInfo {
    "secure://10.1.1.1:7000".parse().unwrap()
}

fn master_info(port: u16) -> EndpointInfo {
    EndpointInfo::new("10.2.2.2".parse().unwrap(), port, TransportKind::Plain)
}

fn start_service(codec: &Arc<Codec>) -> DiscoveryService {
    DiscoveryService::start_at("127.0.0.1:0".parse().unwrap(), worker_info(), codec.clone())
        .unwrap()
}

fn master_socket() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket
}

fn receive_response(socket: &UdpSocket, codec: &Codec) -> EndpointInfo {
    let mut buf = [0u8; 1024];
    let (len, _) = socket.recv_from(&mut buf).unwrap();
    codec.decode(&buf[..len]).unwrap()
}

#[test]
fn repeated_announce_registers_master_once() {
    common::init_log();
    let codec = Arc::new(Codec::default());
    let service = start_service(&codec);
    let socket = master_socket();
    let announce = codec.encode(&master_info(5000)).unwrap();

    for _ in 0..5 {
        socket.send_to(&announce, service.local_addr()).unwrap();
        assert_eq!(receive_response(&socket, &codec), worker_info());
    }
    let masters = service.known_masters();
    assert_eq!(masters.len(), 1);
    assert!(masters.contains(&master_info(5000)));
}

#[test]
fn distinct_masters_all_get_registered() {
    let codec = Arc::new(Codec::default());
    let service = start_service(&codec);
    let target = service.local_addr();

    let handles: Vec<_> = (0..6u16)
        .map(|i| {
            let codec = codec.clone();
            thread::spawn(move || {
                let socket = master_socket();
                let announce = codec.encode(&master_info(6000 + i)).unwrap();
                socket.send_to(&announce, target).unwrap();
                receive_response(&socket, &codec)
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), worker_info());
    }
    assert_eq!(service.known_masters().len(), 6);
}

#[test]
fn response_goes_to_announce_source() {
    let codec = Arc::new(Codec::new(Encoding::Json).unwrap());
    let service = start_service(&codec);
    let socket = master_socket();

    // the announced descriptor points somewhere else entirely
    let announce = codec.encode(&master_info(1)).unwrap();
    socket.send_to(&announce, service.local_addr()).unwrap();

    let mut buf = [0u8; 1024];
    let (len, from) = socket.recv_from(&mut buf).unwrap();
    assert_eq!(from, service.local_addr());
    let response: EndpointInfo = codec.decode(&buf[..len]).unwrap();
    assert_eq!(response, worker_info());
}

#[test]
fn failed_responses_do_not_stop_the_service() {
    let codec = Arc::new(Codec::default());
    let service = start_service(&codec);

    // masters going away right after announcing, their responses bounce
    for i in 0..3u16 {
        let gone = UdpSocket::bind("127.0.0.1:0").unwrap();
        let announce = codec.encode(&master_info(5200 + i)).unwrap();
        gone.send_to(&announce, service.local_addr()).unwrap();
    }
    assert!(common::wait_for(Duration::from_secs(2), || {
        service.known_masters().len() == 3
    }));

    let socket = master_socket();
    let announce = codec.encode(&master_info(5300)).unwrap();
    socket.send_to(&announce, service.local_addr()).unwrap();
    assert_eq!(receive_response(&socket, &codec), worker_info());
    assert_eq!(service.known_masters().len(), 4);
    assert!(service.is_running());
}

#[test]
fn malformed_announce_is_dropped() {
    let codec = Arc::new(Codec::default());
    let service = start_service(&codec);
    let socket = master_socket();

    socket.send_to(b"\x01garbage", service.local_addr()).unwrap();
    let announce = codec.encode(&master_info(5100)).unwrap();
    socket.send_to(&announce, service.local_addr()).unwrap();

    // only the valid announce gets answered
    assert_eq!(receive_response(&socket, &codec), worker_info());
    socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut buf = [0u8; 1024];
    assert!(socket.recv_from(&mut buf).is_err());

    assert!(service.is_running());
    assert_eq!(service.known_masters().len(), 1);
}

#[test]
fn taken_port_is_bind_error() {
    let codec = Arc::new(Codec::default());
    let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();
    match DiscoveryService::start_at(addr, worker_info(), codec) {
        Err(Error::Bind {
            component,
            addr: failed,
            ..
        }) => {
            assert!(component.contains("discovery"));
            assert_eq!(failed, addr);
        }
        Err(e) => panic!("expected bind error, got {:?}", e),
        Ok(_) => panic!("bound a taken port"),
    }
}

#[test]
fn announce_collects_distinct_workers() {
    let codec = Arc::new(Codec::default());
    let first = DiscoveryService::start_at(
        "127.0.0.1:0".parse().unwrap(),
        "plain://10.0.0.1:7001".parse().unwrap(),
        codec.clone(),
    )
    .unwrap();
    let second = DiscoveryService::start_at(
        "127.0.0.1:0".parse().unwrap(),
        "secure://10.0.0.2:7002".parse().unwrap(),
        codec.clone(),
    )
    .unwrap();

    let targets: Vec<SocketAddr> = vec![first.local_addr(), second.local_addr(), first.local_addr()];
    let me = master_info(5200);
    let workers = announce(&me, &targets, Duration::from_millis(500), &codec).unwrap();

    assert_eq!(workers.len(), 2);
    assert!(workers.contains(&first.own_info()));
    assert!(workers.contains(&second.own_info()));
    assert!(first.known_masters().contains(&me));
    assert!(second.known_masters().contains(&me));
}

#[test]
fn stopped_service_stops_answering() {
    let codec = Arc::new(Codec::default());
    let mut service = start_service(&codec);
    let addr = service.local_addr();
    service.stop();
    service.stop();
    assert!(!service.is_running());

    let socket = master_socket();
    socket
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let announce = codec.encode(&master_info(5300)).unwrap();
    let _ = socket.send_to(&announce, addr);
    let mut buf = [0u8; 1024];
    assert!(socket.recv_from(&mut buf).is_err());
}
