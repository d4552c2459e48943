use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use serde::{de, Deserialize, Deserializer};

/// Best guess at the address other hosts can reach this machine on.
///
/// Takes the address of the interface holding the default route, and
/// failing that the first non-loopback ipv4 interface.
pub fn local_ip() -> Option<IpAddr> {
    match local_ip_address::local_ip() {
        Ok(ip) if !ip.is_unspecified() && !ip.is_loopback() => return Some(ip),
        Ok(ip) => trace!("ignoring local address {}", ip),
        Err(e) => debug!("no default route address: {}", e),
    }
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(e) => {
            debug!("failed to list network interfaces: {}", e);
            return None;
        }
    };
    interfaces
        .into_iter()
        .map(|(_name, ip)| ip)
        .find(|ip| ip.is_ipv4() && !ip.is_loopback() && !ip.is_unspecified())
}

/// Address to advertise for a socket bound to `bound`.
pub(crate) fn advertised_ip(bound: IpAddr, advertise: Option<IpAddr>) -> IpAddr {
    match advertise {
        Some(ip) => ip,
        None if bound.is_unspecified() => {
            local_ip().unwrap_or_else(|| Ipv4Addr::LOCALHOST.into())
        }
        None => bound,
    }
}

/// Millisecond count from configuration, zero meaning none.
pub(crate) fn millis(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|ms| *ms > 0).map(Duration::from_millis)
}

/// Deserializes a value through its `FromStr` implementation.
pub(crate) fn from_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let s = String::deserialize(deserializer)?;
    T::from_str(&s).map_err(de::Error::custom)
}

#[test]
fn advertised_ip_prefers_override() {
    let bound: IpAddr = "0.0.0.0".parse().unwrap();
    let over: IpAddr = "10.0.0.7".parse().unwrap();
    assert_eq!(advertised_ip(bound, Some(over)), over);
    let lo: IpAddr = "127.0.0.1".parse().unwrap();
    assert_eq!(advertised_ip(lo, None), lo);
    assert!(!advertised_ip(bound, None).is_unspecified());
}

#[test]
fn zero_millis_is_none() {
    assert_eq!(millis(Some(0)), None);
    assert_eq!(millis(None), None);
    assert_eq!(millis(Some(150)), Some(Duration::from_millis(150)));
}

#[test]
fn local_ip_is_reachable_from_elsewhere() {
    if let Some(ip) = local_ip() {
        assert!(!ip.is_loopback());
        assert!(!ip.is_unspecified());
    }
}
