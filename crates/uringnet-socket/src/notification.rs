//! Error-queue notifications: zero-copy ranges and transmit timestamps.
//!
//! The kernel reports zero-copy completion ranges and transmit
//! timestamps as ancillary messages on the socket error queue. The
//! socket drains the queue opportunistically after send completions and
//! routes each notification to the zero-copy ledger or the timestamp
//! correlator.

use std::mem;
use std::os::unix::io::RawFd;
use std::time::{Duration, SystemTime};

use crate::timestamp::{Timestamp, TimestampType};
use crate::zero_copy::{ZeroCopy, ZeroCopyType};

/// `struct sock_extended_err` from `<linux/errqueue.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SockExtendedErr {
    ee_errno: u32,
    ee_origin: u8,
    ee_type: u8,
    ee_code: u8,
    ee_pad: u8,
    ee_info: u32,
    ee_data: u32,
}

const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;

const SCM_TSTAMP_SND: u32 = 0;
const SCM_TSTAMP_SCHED: u32 = 1;
const SCM_TSTAMP_ACK: u32 = 2;

const IP_RECVERR: libc::c_int = 11;
const IPV6_RECVERR: libc::c_int = 25;

/// One decoded error-queue message.
#[derive(Debug, Clone, Copy)]
pub enum Notification {
    ZeroCopy(ZeroCopy),
    Timestamp(Timestamp),
}

/// Drain up to `max` messages from the error queue of `handle`.
pub fn drain_error_queue(handle: RawFd, max: usize) -> Vec<Notification> {
    let mut notifications = Vec::new();

    for _ in 0..max {
        let mut control = [0u8; 512];
        let mut message: libc::msghdr = unsafe { mem::zeroed() };
        message.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        message.msg_controllen = control.len();

        let rc = unsafe {
            libc::recvmsg(
                handle,
                &mut message,
                libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT,
            )
        };
        if rc < 0 {
            break;
        }

        decode_message(&message, &mut notifications);
    }

    notifications
}

/// Decode one error-queue message's control chain.
///
/// A timestamp report spans two control messages: the timestamping
/// block carries the clocks, the extended error carries the stage and
/// the send counter.
fn decode_message(message: &libc::msghdr, out: &mut Vec<Notification>) {
    let mut clocks: Option<SystemTime> = None;
    let mut stage: Option<(TimestampType, u32)> = None;

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(message);
        while !cmsg.is_null() {
            let level = (*cmsg).cmsg_level;
            let kind = (*cmsg).cmsg_type;

            if level == libc::SOL_SOCKET && kind == libc::SCM_TIMESTAMPING {
                // struct scm_timestamping { struct timespec ts[3]; }
                // with the software clock in ts[0].
                let ts = *(libc::CMSG_DATA(cmsg) as *const libc::timespec);
                if ts.tv_sec != 0 || ts.tv_nsec != 0 {
                    clocks = Some(
                        SystemTime::UNIX_EPOCH
                            + Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32),
                    );
                }
            } else if (level == libc::SOL_IP && kind == IP_RECVERR)
                || (level == libc::SOL_IPV6 && kind == IPV6_RECVERR)
                || (level == libc::SOL_PACKET)
            {
                let error = *(libc::CMSG_DATA(cmsg) as *const SockExtendedErr);
                match error.ee_origin {
                    SO_EE_ORIGIN_ZEROCOPY => {
                        let kind = if error.ee_code & SO_EE_CODE_ZEROCOPY_COPIED != 0 {
                            ZeroCopyType::Avoided
                        } else {
                            ZeroCopyType::Deferred
                        };
                        out.push(Notification::ZeroCopy(ZeroCopy {
                            from: error.ee_info as u64,
                            thru: error.ee_data as u64,
                            kind,
                        }));
                    }
                    SO_EE_ORIGIN_TIMESTAMPING => {
                        let kind = match error.ee_info {
                            SCM_TSTAMP_SND => Some(TimestampType::Sent),
                            SCM_TSTAMP_SCHED => Some(TimestampType::Scheduled),
                            SCM_TSTAMP_ACK => Some(TimestampType::Acknowledged),
                            _ => None,
                        };
                        if let Some(kind) = kind {
                            stage = Some((kind, error.ee_data));
                        }
                    }
                    _ => {}
                }
            }

            cmsg = libc::CMSG_NXTHDR(message, cmsg);
        }
    }

    if let (Some(time), Some((kind, id))) = (clocks, stage) {
        out.push(Notification::Timestamp(Timestamp { kind, id, time }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_err_layout() {
        assert_eq!(mem::size_of::<SockExtendedErr>(), 16);
    }

    #[test]
    fn test_drain_on_clean_socket_is_empty() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let notifications = drain_error_queue(fd, 8);
        assert!(notifications.is_empty());
        unsafe { libc::close(fd) };
    }
}
