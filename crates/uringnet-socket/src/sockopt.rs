//! Socket option plumbing for the datagram socket.

use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use uringnet_core::error::{Error, Result};

// Linux option values not uniformly exported by libc.
const SO_ZEROCOPY: libc::c_int = 60;
const SO_TIMESTAMPING: libc::c_int = 37;

/// `SOF_TIMESTAMPING_*` generation flags.
pub mod timestamping {
    pub const TX_SOFTWARE: u32 = 1 << 1;
    pub const RX_SOFTWARE: u32 = 1 << 3;
    pub const SOFTWARE: u32 = 1 << 4;
    pub const OPT_ID: u32 = 1 << 7;
    pub const TX_SCHED: u32 = 1 << 8;
    pub const OPT_TSONLY: u32 = 1 << 11;
}

fn set_option<T>(
    handle: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: &T,
) -> Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            handle,
            level,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn set_reuse_address(handle: RawFd, enable: bool) -> Result<()> {
    let value: libc::c_int = enable as libc::c_int;
    set_option(handle, libc::SOL_SOCKET, libc::SO_REUSEADDR, &value)
}

pub fn set_keep_alive(handle: RawFd, enable: bool) -> Result<()> {
    let value: libc::c_int = enable as libc::c_int;
    set_option(handle, libc::SOL_SOCKET, libc::SO_KEEPALIVE, &value)
}

pub fn set_send_buffer_size(handle: RawFd, size: usize) -> Result<()> {
    let value: libc::c_int = size as libc::c_int;
    set_option(handle, libc::SOL_SOCKET, libc::SO_SNDBUF, &value)
}

pub fn set_receive_buffer_size(handle: RawFd, size: usize) -> Result<()> {
    let value: libc::c_int = size as libc::c_int;
    set_option(handle, libc::SOL_SOCKET, libc::SO_RCVBUF, &value)
}

/// Enable kernel zero-copy transmission. The kernel refusing the
/// option means zero-copy is not authorized for this socket.
pub fn set_zero_copy(handle: RawFd, enable: bool) -> Result<()> {
    let value: libc::c_int = enable as libc::c_int;
    set_option(handle, libc::SOL_SOCKET, SO_ZEROCOPY, &value)
        .map_err(|_| Error::NotAuthorized)
}

/// Program the `SO_TIMESTAMPING` generation mask from the two
/// direction toggles.
pub fn set_timestamping(handle: RawFd, outgoing: bool, incoming: bool) -> Result<()> {
    let mut mask: u32 = 0;
    if outgoing {
        mask |= timestamping::TX_SOFTWARE
            | timestamping::TX_SCHED
            | timestamping::SOFTWARE
            | timestamping::OPT_ID
            | timestamping::OPT_TSONLY;
    }
    if incoming {
        mask |= timestamping::RX_SOFTWARE | timestamping::SOFTWARE;
    }
    set_option(handle, libc::SOL_SOCKET, SO_TIMESTAMPING, &mask)
}

pub fn set_multicast_loopback(handle: RawFd, enable: bool) -> Result<()> {
    let value: libc::c_uchar = enable as libc::c_uchar;
    set_option(handle, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, &value)
}

pub fn set_multicast_time_to_live(handle: RawFd, hops: u32) -> Result<()> {
    let value: libc::c_uchar = hops.min(255) as libc::c_uchar;
    set_option(handle, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, &value)
}

pub fn set_multicast_interface(handle: RawFd, interface: Ipv4Addr) -> Result<()> {
    let value = libc::in_addr {
        s_addr: u32::from_ne_bytes(interface.octets()),
    };
    set_option(handle, libc::IPPROTO_IP, libc::IP_MULTICAST_IF, &value)
}

pub fn join_multicast_group(handle: RawFd, group: Ipv4Addr, interface: Ipv4Addr) -> Result<()> {
    let value = libc::ip_mreq {
        imr_multiaddr: libc::in_addr {
            s_addr: u32::from_ne_bytes(group.octets()),
        },
        imr_interface: libc::in_addr {
            s_addr: u32::from_ne_bytes(interface.octets()),
        },
    };
    set_option(handle, libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP, &value)
}

pub fn leave_multicast_group(handle: RawFd, group: Ipv4Addr, interface: Ipv4Addr) -> Result<()> {
    let value = libc::ip_mreq {
        imr_multiaddr: libc::in_addr {
            s_addr: u32::from_ne_bytes(group.octets()),
        },
        imr_interface: libc::in_addr {
            s_addr: u32::from_ne_bytes(interface.octets()),
        },
    };
    set_option(handle, libc::IPPROTO_IP, libc::IP_DROP_MEMBERSHIP, &value)
}
