//! Transport endpoints and their `sockaddr` wire encoding.
//!
//! The kernel speaks `sockaddr_storage`; the rest of the runtime speaks
//! `Endpoint`. `encode()` and `decode()` are inverses for every endpoint
//! this runtime can bind or send to, a property the submission-preparation
//! and completion-dispatch paths both rely on.

use std::ffi::OsStr;
use std::fmt;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// The transport family of a datagram socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// UDP over IPv4.
    UdpIpv4,
    /// UDP over IPv6.
    UdpIpv6,
    /// Unix-domain datagram.
    LocalDatagram,
}

impl Transport {
    /// The address family passed to `socket(2)`.
    pub fn domain(&self) -> libc::c_int {
        match self {
            Transport::UdpIpv4 => libc::AF_INET,
            Transport::UdpIpv6 => libc::AF_INET6,
            Transport::LocalDatagram => libc::AF_UNIX,
        }
    }

    /// The protocol passed to `socket(2)`.
    pub fn protocol(&self) -> libc::c_int {
        match self {
            Transport::UdpIpv4 | Transport::UdpIpv6 => libc::IPPROTO_UDP,
            Transport::LocalDatagram => 0,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Transport::LocalDatagram)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::UdpIpv4 => write!(f, "udp/ipv4"),
            Transport::UdpIpv6 => write!(f, "udp/ipv6"),
            Transport::LocalDatagram => write!(f, "local/datagram"),
        }
    }
}

/// A source or destination address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// An IPv4 or IPv6 address and port.
    Ip(SocketAddr),
    /// A Unix-domain socket path. An empty path is the unnamed address.
    Local(PathBuf),
}

impl Endpoint {
    /// The transport this endpoint naturally belongs to.
    pub fn transport(&self) -> Transport {
        match self {
            Endpoint::Ip(SocketAddr::V4(_)) => Transport::UdpIpv4,
            Endpoint::Ip(SocketAddr::V6(_)) => Transport::UdpIpv6,
            Endpoint::Local(_) => Transport::LocalDatagram,
        }
    }

    /// The IPv4 or IPv6 port, if this is an IP endpoint.
    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Ip(addr) => Some(addr.port()),
            Endpoint::Local(_) => None,
        }
    }

    /// The wildcard endpoint (port 0) for a transport, used to let the
    /// system choose the source address.
    pub fn any(transport: Transport) -> Self {
        match transport {
            Transport::UdpIpv4 => {
                Endpoint::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
            }
            Transport::UdpIpv6 => Endpoint::Ip(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::UNSPECIFIED,
                0,
                0,
                0,
            ))),
            Transport::LocalDatagram => Endpoint::Local(PathBuf::new()),
        }
    }

    /// Encode into `storage`, returning the encoded length.
    ///
    /// The buffer is zeroed first; the result is suitable for `bind(2)`,
    /// `connect(2)`, and `msghdr::msg_name`.
    pub fn encode(&self, storage: &mut libc::sockaddr_storage) -> Result<libc::socklen_t> {
        unsafe {
            std::ptr::write_bytes(
                storage as *mut libc::sockaddr_storage as *mut u8,
                0,
                mem::size_of::<libc::sockaddr_storage>(),
            );
        }

        match self {
            Endpoint::Ip(SocketAddr::V4(v4)) => {
                let sin = storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = v4.port().to_be();
                    (*sin).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                }
                Ok(mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
            }
            Endpoint::Ip(SocketAddr::V6(v6)) => {
                let sin6 = storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = v6.port().to_be();
                    (*sin6).sin6_flowinfo = v6.flowinfo();
                    (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                    (*sin6).sin6_scope_id = v6.scope_id();
                }
                Ok(mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
            }
            Endpoint::Local(path) => {
                let bytes = path.as_os_str().as_bytes();
                let sun = storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_un;
                let capacity = unsafe { (*sun).sun_path.len() };
                if bytes.len() >= capacity {
                    return Err(Error::Invalid);
                }
                unsafe {
                    (*sun).sun_family = libc::AF_UNIX as libc::sa_family_t;
                    for (i, b) in bytes.iter().enumerate() {
                        (*sun).sun_path[i] = *b as libc::c_char;
                    }
                }
                let header = mem::size_of::<libc::sa_family_t>();
                Ok((header + bytes.len()) as libc::socklen_t)
            }
        }
    }

    /// Decode from `storage` as filled in by the kernel.
    pub fn decode(storage: &libc::sockaddr_storage, length: libc::socklen_t) -> Result<Self> {
        let length = length as usize;
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                if length < mem::size_of::<libc::sockaddr_in>() {
                    return Err(Error::Invalid);
                }
                let sin = storage as *const libc::sockaddr_storage as *const libc::sockaddr_in;
                let (port, raw) = unsafe { (u16::from_be((*sin).sin_port), (*sin).sin_addr.s_addr) };
                let ip = Ipv4Addr::from(raw.to_ne_bytes());
                Ok(Endpoint::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port))))
            }
            libc::AF_INET6 => {
                if length < mem::size_of::<libc::sockaddr_in6>() {
                    return Err(Error::Invalid);
                }
                let sin6 = storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6;
                let (port, octets, flowinfo, scope) = unsafe {
                    (
                        u16::from_be((*sin6).sin6_port),
                        (*sin6).sin6_addr.s6_addr,
                        (*sin6).sin6_flowinfo,
                        (*sin6).sin6_scope_id,
                    )
                };
                Ok(Endpoint::Ip(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flowinfo,
                    scope,
                ))))
            }
            libc::AF_UNIX => {
                let header = mem::size_of::<libc::sa_family_t>();
                let sun = storage as *const libc::sockaddr_storage as *const libc::sockaddr_un;
                if length <= header {
                    return Ok(Endpoint::Local(PathBuf::new()));
                }
                let bytes: Vec<u8> = unsafe {
                    let raw = &(&(*sun).sun_path)[..];
                    let mut path_len = (length - header).min(raw.len());
                    // The kernel may include the trailing NUL in the length.
                    while path_len > 0 && raw[path_len - 1] == 0 {
                        path_len -= 1;
                    }
                    raw[..path_len].iter().map(|c| *c as u8).collect()
                };
                Ok(Endpoint::Local(PathBuf::from(OsStr::from_bytes(&bytes))))
            }
            _ => Err(Error::Invalid),
        }
    }

    /// Query the system for the local name of `handle`.
    pub fn source_of(handle: libc::c_int) -> Result<Self> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                handle,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut length,
            )
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Self::decode(&storage, length)
    }

    /// Query the system for the remote name of `handle`.
    pub fn remote_of(handle: libc::c_int) -> Result<Self> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(
                handle,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut length,
            )
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Self::decode(&storage, length)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "{}", addr),
            Endpoint::Local(path) if path.as_os_str().is_empty() => {
                write!(f, "local:(unnamed)")
            }
            Endpoint::Local(path) => write!(f, "local:{}", path.display()),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Ip(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(endpoint: Endpoint) {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let length = endpoint.encode(&mut storage).unwrap();
        let decoded = Endpoint::decode(&storage, length).unwrap();
        assert_eq!(endpoint, decoded);
    }

    #[test]
    fn test_round_trip_ipv4() {
        round_trip(Endpoint::Ip("127.0.0.1:4500".parse().unwrap()));
        round_trip(Endpoint::Ip("0.0.0.0:0".parse().unwrap()));
    }

    #[test]
    fn test_round_trip_ipv6() {
        round_trip(Endpoint::Ip("[::1]:9999".parse().unwrap()));
        round_trip(Endpoint::Ip("[fe80::1]:53".parse().unwrap()));
    }

    #[test]
    fn test_round_trip_local() {
        round_trip(Endpoint::Local(PathBuf::from("/tmp/uringnet.sock")));
        round_trip(Endpoint::Local(PathBuf::new()));
    }

    #[test]
    fn test_local_path_too_long() {
        let long = "x".repeat(200);
        let endpoint = Endpoint::Local(PathBuf::from(long));
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        assert_eq!(endpoint.encode(&mut storage), Err(Error::Invalid));
    }

    #[test]
    fn test_any_matches_transport() {
        assert_eq!(Endpoint::any(Transport::UdpIpv4).transport(), Transport::UdpIpv4);
        assert_eq!(Endpoint::any(Transport::UdpIpv6).transport(), Transport::UdpIpv6);
        assert_eq!(
            Endpoint::any(Transport::LocalDatagram).transport(),
            Transport::LocalDatagram
        );
    }
}
