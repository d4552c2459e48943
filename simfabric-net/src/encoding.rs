//! Pluggable serialization boundary.
//!
//! Anything crossing the network, be it a discovery announce or a typed
//! task sent over a channel, is turned into bytes by a [`Serializer`].
//! Implementations are interchangeable and picked by configuration, using
//! the [`Encoding`] enumeration. [`Codec`] is the configured instance that
//! gets built once at startup and shared (usually behind an `Arc`) by all
//! the components of a process.
//!
//! No implementation promises compatibility across versions of the types
//! it encodes. Both ends of a deployment have to agree on encoding and
//! message shape.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::{Error, Result};

/// Default upper bound for a single bincode-encoded message.
pub const DEFAULT_BINCODE_LIMIT: u64 = 64 * 1024 * 1024;

/// List of possible formats for encoding data sent over the network.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum Encoding {
    /// Fast binary format, useful for communicating directly between Rust apps
    Bincode,
    /// Binary format with implementations in many different languages
    MsgPack,
    /// Very common but more verbose format
    Json,
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::Bincode
    }
}

impl FromStr for Encoding {
    type Err = Error;
    fn from_str(s: &str) -> core::result::Result<Self, Error> {
        let e = match s.to_lowercase().as_str() {
            "bincode" | "bin" => Self::Bincode,
            "msgpack" | "messagepack" | "rmp" => Self::MsgPack,
            "json" => Self::Json,
            _ => {
                return Err(Error::Other(format!(
                    "failed parsing encoding from string: {}",
                    s
                )))
            }
        };
        Ok(e)
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bincode => write!(f, "bincode"),
            Self::MsgPack => write!(f, "msgpack"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Converts in-memory messages to bytes and back.
///
/// Implementations hold no mutable state, calling `encode` and `decode`
/// from multiple threads on a shared instance is fine.
pub trait Serializer: Send + Sync {
    fn kind(&self) -> Encoding;
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>>;
    /// Fails with `Error::Deserialization` if the bytes are not a valid
    /// encoding of `T`, including truncated or trailing input.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

type BincodeOptions = bincode::config::WithOtherTrailing<
    bincode::config::WithOtherLimit<
        bincode::config::WithOtherIntEncoding<
            bincode::DefaultOptions,
            bincode::config::FixintEncoding,
        >,
        bincode::config::Bounded,
    >,
    bincode::config::RejectTrailing,
>;

/// Bincode with fixed-size integers and a size bound.
#[derive(Copy, Clone)]
pub struct BincodeSerializer {
    options: BincodeOptions,
}

impl BincodeSerializer {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_BINCODE_LIMIT)
    }

    /// Rejects messages encoding or decoding to more than `limit` bytes.
    pub fn with_limit(limit: u64) -> Self {
        let options = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(limit)
            .reject_trailing_bytes();
        Self { options }
    }
}

impl Default for BincodeSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for BincodeSerializer {
    fn kind(&self) -> Encoding {
        Encoding::Bincode
    }

    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>> {
        self.options
            .serialize(msg)
            .map_err(|e| Error::Serialization {
                encoding: Encoding::Bincode,
                reason: e.to_string(),
            })
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        self.options
            .deserialize(bytes)
            .map_err(|e| Error::Deserialization {
                encoding: Encoding::Bincode,
                reason: e.to_string(),
            })
    }
}

/// MessagePack, for talking to non-Rust peers.
#[cfg(feature = "msgpack_encoding")]
#[derive(Copy, Clone, Default)]
pub struct MsgPackSerializer;

#[cfg(feature = "msgpack_encoding")]
impl Serializer for MsgPackSerializer {
    fn kind(&self) -> Encoding {
        Encoding::MsgPack
    }

    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec(msg).map_err(|e| Error::Serialization {
            encoding: Encoding::MsgPack,
            reason: e.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        rmp_serde::from_read_ref(bytes).map_err(|e| Error::Deserialization {
            encoding: Encoding::MsgPack,
            reason: e.to_string(),
        })
    }
}

#[cfg(feature = "json_encoding")]
#[derive(Copy, Clone, Default)]
pub struct JsonSerializer;

#[cfg(feature = "json_encoding")]
impl Serializer for JsonSerializer {
    fn kind(&self) -> Encoding {
        Encoding::Json
    }

    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(msg).map_err(|e| Error::Serialization {
            encoding: Encoding::Json,
            reason: e.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization {
            encoding: Encoding::Json,
            reason: e.to_string(),
        })
    }
}

/// Serializer selected by configuration.
#[derive(Clone)]
pub enum Codec {
    Bincode(BincodeSerializer),
    #[cfg(feature = "msgpack_encoding")]
    MsgPack(MsgPackSerializer),
    #[cfg(feature = "json_encoding")]
    Json(JsonSerializer),
}

impl Codec {
    /// Builds the serializer for the given encoding. Fails if support for
    /// that encoding was not compiled in.
    pub fn new(encoding: Encoding) -> Result<Self> {
        let codec = match encoding {
            Encoding::Bincode => Codec::Bincode(BincodeSerializer::new()),
            #[cfg(feature = "msgpack_encoding")]
            Encoding::MsgPack => Codec::MsgPack(MsgPackSerializer),
            #[cfg(feature = "json_encoding")]
            Encoding::Json => Codec::Json(JsonSerializer),
            #[allow(unreachable_patterns)]
            _ => return Err(Error::EncodingUnavailable(encoding)),
        };
        Ok(codec)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::Bincode(BincodeSerializer::new())
    }
}

impl Serializer for Codec {
    fn kind(&self) -> Encoding {
        match self {
            Codec::Bincode(s) => s.kind(),
            #[cfg(feature = "msgpack_encoding")]
            Codec::MsgPack(s) => s.kind(),
            #[cfg(feature = "json_encoding")]
            Codec::Json(s) => s.kind(),
        }
    }

    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>> {
        match self {
            Codec::Bincode(s) => s.encode(msg),
            #[cfg(feature = "msgpack_encoding")]
            Codec::MsgPack(s) => s.encode(msg),
            #[cfg(feature = "json_encoding")]
            Codec::Json(s) => s.encode(msg),
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Codec::Bincode(s) => s.decode(bytes),
            #[cfg(feature = "msgpack_encoding")]
            Codec::MsgPack(s) => s.decode(bytes),
            #[cfg(feature = "json_encoding")]
            Codec::Json(s) => s.decode(bytes),
        }
    }
}

#[cfg(test)]
fn all_codecs() -> Vec<Codec> {
    vec![
        Codec::new(Encoding::Bincode).unwrap(),
        #[cfg(feature = "msgpack_encoding")]
        Codec::new(Encoding::MsgPack).unwrap(),
        #[cfg(feature = "json_encoding")]
        Codec::new(Encoding::Json).unwrap(),
    ]
}

#[test]
fn endpoint_survives_every_codec() {
    use crate::{EndpointInfo, TransportKind};
    let infos = vec![
        EndpointInfo::new("127.0.0.1".parse().unwrap(), 0, TransportKind::Plain),
        EndpointInfo::new("10.1.2.3".parse().unwrap(), 65535, TransportKind::Secure),
        EndpointInfo::new("::1".parse().unwrap(), 8080, TransportKind::Secure),
    ];
    for codec in all_codecs() {
        for info in &infos {
            let bytes = codec.encode(info).unwrap();
            let decoded: EndpointInfo = codec.decode(&bytes).unwrap();
            assert_eq!(&decoded, info, "codec: {}", codec.kind());
        }
    }
}

#[test]
fn truncated_input_is_a_deserialization_error() {
    use crate::{EndpointInfo, TransportKind};
    let info = EndpointInfo::new("192.168.0.10".parse().unwrap(), 4000, TransportKind::Plain);
    for codec in all_codecs() {
        let bytes = codec.encode(&info).unwrap();
        let res = codec.decode::<EndpointInfo>(&bytes[..bytes.len() - 1]);
        match res {
            Err(Error::Deserialization { encoding, .. }) => assert_eq!(encoding, codec.kind()),
            other => panic!("expected deserialization error, got {:?}", other),
        }
    }
}

#[test]
fn bincode_rejects_trailing_bytes() {
    let codec = BincodeSerializer::new();
    let mut bytes = codec.encode(&42u32).unwrap();
    bytes.push(0);
    assert!(codec.decode::<u32>(&bytes).is_err());
}

#[test]
fn bincode_limit_is_enforced() {
    let codec = BincodeSerializer::with_limit(16);
    assert!(codec.encode(&vec![0u8; 64]).is_err());
}

#[test]
fn parse_encoding() {
    assert_eq!(Encoding::from_str("BIN").unwrap(), Encoding::Bincode);
    assert_eq!(Encoding::from_str("rmp").unwrap(), Encoding::MsgPack);
    assert!(Encoding::from_str("xml").is_err());
}
