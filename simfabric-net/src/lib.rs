//! This library provides the networking fabric for distributed simulation
//! deployments made of *masters* and *workers*.
//!
//! Masters find workers on the network, hand them task payloads and collect
//! the results. Workers run a `SimServer` that accepts connections from
//! masters and forwards every received task to an execution `Engine`. The
//! engine itself is not part of this crate, anything implementing the
//! [`Engine`] trait can be plugged in.
//!
//!
//! # Networking constructs overview
//!
//! There are three layers here, each building on the previous one.
//!
//! *Discovery* is a connectionless announce/response exchange over
//! datagrams. A master sends its own [`EndpointInfo`] to the workers'
//! discovery port, each worker records the master in its [`Registry`] and
//! answers with its own descriptor.
//!
//! *Transport* provides reliable, framed channels. A [`Channel`] is either
//! plain, moving length-prefixed frames over tcp, or secure, running the
//! very same framing over a tls session. Which one gets built is decided by
//! the [`TransportKind`] carried by the endpoint descriptor.
//!
//! *Service* is where [`SimServer`] and [`Master`] live. A server can be
//! made discoverable simply by giving it a discovery port in its
//! [`ServerConfig`], in which case it owns a [`DiscoveryService`] next to
//! its listener.
//!
//!
//! # Serialization
//!
//! Anything that crosses the network as a typed message goes through a
//! [`Codec`], selected by [`Encoding`]. Bincode is always available,
//! MessagePack and JSON sit behind the `msgpack_encoding` and
//! `json_encoding` features. The codec is built once and passed explicitly
//! to the components that need it.

#[macro_use]
extern crate log;

mod client;
mod config;
mod discovery;
mod encoding;
mod endpoint;
mod error;
mod server;
mod util;

pub mod transport;

pub use client::{Master, MasterConfig};
pub use config::{FabricConfig, TlsFiles};
pub use discovery::{announce, DiscoveryService, Registry, DEFAULT_DISCOVERY_PORT};
pub use encoding::{BincodeSerializer, Codec, Encoding, Serializer};
#[cfg(feature = "json_encoding")]
pub use encoding::JsonSerializer;
#[cfg(feature = "msgpack_encoding")]
pub use encoding::MsgPackSerializer;
pub use endpoint::{EndpointInfo, TransportKind};
pub use server::{Engine, ServerConfig, SimServer};
pub use transport::{
    AcceptedStream, Channel, ChannelConfig, ChannelState, Listener, MessageChannel, TlsConfig,
};
pub use util::local_ip;

pub use error::{Error, Result};
