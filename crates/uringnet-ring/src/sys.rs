//! Raw io_uring ABI: setup parameters, ring offsets, syscall wrappers.
//!
//! Everything in this module mirrors `<linux/io_uring.h>` exactly; no
//! translation happens here. Higher modules own the memory-mapping and
//! the producer/consumer protocol.

use std::mem;

/// Syscall numbers for io_uring.
pub const SYS_SETUP: libc::c_long = 425;
pub const SYS_ENTER: libc::c_long = 426;
pub const SYS_REGISTER: libc::c_long = 427;

/// Magic mmap offsets for the ring regions.
pub const OFF_SQ_RING: libc::off_t = 0;
pub const OFF_CQ_RING: libc::off_t = 0x0800_0000;
pub const OFF_SQES: libc::off_t = 0x1000_0000;

/// `io_uring_register` operation selecting the opcode probe.
pub const REGISTER_PROBE: libc::c_uint = 8;

bitflags::bitflags! {
    /// `io_uring_enter` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnterFlags: libc::c_uint {
        const GETEVENTS = 1 << 0;
        const SQ_WAKEUP = 1 << 1;
        const SQ_WAIT   = 1 << 2;
        const EXT_ARG   = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Feature bits reported by `io_uring_setup`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        const SINGLE_MMAP    = 1 << 0;
        const NODROP         = 1 << 1;
        const SUBMIT_STABLE  = 1 << 2;
        const RW_CUR_POS     = 1 << 3;
        const CUR_PERSONALITY = 1 << 4;
        const FAST_POLL      = 1 << 5;
        const POLL_32BITS    = 1 << 6;
        const SQPOLL_NONFIXED = 1 << 7;
        const EXT_ARG        = 1 << 8;
        const NATIVE_WORKERS = 1 << 9;
        const RSRC_TAGS      = 1 << 10;
    }
}

/// Async-cancel request flags (`sqe.cancel_flags`).
pub const ASYNC_CANCEL_ALL: u32 = 1 << 0;
pub const ASYNC_CANCEL_FD: u32 = 1 << 1;

/// Completion flags (`cqe.flags`).
pub const CQE_F_BUFFER: u32 = 1 << 0;
pub const CQE_F_MORE: u32 = 1 << 1;
pub const CQE_F_SOCK_NONEMPTY: u32 = 1 << 2;
pub const CQE_F_NOTIF: u32 = 1 << 3;

/// Send/receive request flags (`sqe.ioprio` for network opcodes).
pub const RECVSEND_POLL_FIRST: u16 = 1 << 0;
pub const SEND_ZC_REPORT_USAGE: u16 = 1 << 3;

/// Reported in the result of a zero-copy notification when the kernel
/// fell back to copying the pages.
pub const NOTIF_USAGE_ZC_COPIED: i32 = 1 << 31;

/// Operation codes this runtime submits or probes.
pub mod op {
    pub const NOP: u8 = 0;
    pub const SENDMSG: u8 = 9;
    pub const RECVMSG: u8 = 10;
    pub const TIMEOUT: u8 = 11;
    pub const ACCEPT: u8 = 13;
    pub const ASYNC_CANCEL: u8 = 14;
    pub const CONNECT: u8 = 16;
    pub const CLOSE: u8 = 19;
    pub const SHUTDOWN: u8 = 34;
    pub const SENDMSG_ZC: u8 = 48;

    /// One past the highest opcode the probe asks about.
    pub const PROBE_LAST: u8 = 64;
}

/// `struct io_sqring_offsets`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// `struct io_cqring_offsets`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// `struct io_uring_params`, filled in by `io_uring_setup`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RingParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqRingOffsets,
    pub cq_off: CqRingOffsets,
}

/// `struct io_uring_getevents_arg`, the extended-argument enter payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GetEventsArg {
    pub sigmask: u64,
    pub sigmask_sz: u32,
    pub pad: u32,
    pub ts: u64,
}

/// `__kernel_timespec`: 64-bit fields regardless of platform.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelTimespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

/// `io_uring_setup(2)`. Returns the ring descriptor or -1 with errno set.
pub fn setup(entries: u32, params: &mut RingParams) -> libc::c_int {
    unsafe {
        libc::syscall(
            SYS_SETUP,
            entries as libc::c_uint,
            params as *mut RingParams,
        ) as libc::c_int
    }
}

/// `io_uring_enter(2)` without a deadline.
pub fn enter(ring: libc::c_int, to_submit: u32, min_complete: u32) -> libc::c_int {
    let mut flags = EnterFlags::empty();
    if min_complete > 0 {
        flags |= EnterFlags::GETEVENTS;
    }
    unsafe {
        libc::syscall(
            SYS_ENTER,
            ring,
            to_submit as libc::c_uint,
            min_complete as libc::c_uint,
            flags.bits(),
            std::ptr::null::<libc::sigset_t>(),
            (mem::size_of::<libc::sigset_t>()) as libc::size_t,
        ) as libc::c_int
    }
}

/// `io_uring_enter(2)` with an extended-argument relative deadline.
///
/// Requires `Features::EXT_ARG`; callers on older kernels submit a
/// `TIMEOUT` record instead.
pub fn enter_timed(
    ring: libc::c_int,
    to_submit: u32,
    min_complete: u32,
    timespec: &KernelTimespec,
) -> libc::c_int {
    let mut flags = EnterFlags::EXT_ARG;
    if min_complete > 0 {
        flags |= EnterFlags::GETEVENTS;
    }

    let arg = GetEventsArg {
        sigmask: 0,
        sigmask_sz: 0,
        pad: 0,
        ts: timespec as *const KernelTimespec as u64,
    };

    unsafe {
        libc::syscall(
            SYS_ENTER,
            ring,
            to_submit as libc::c_uint,
            min_complete as libc::c_uint,
            flags.bits(),
            &arg as *const GetEventsArg,
            mem::size_of::<GetEventsArg>() as libc::size_t,
        ) as libc::c_int
    }
}

/// `io_uring_register(2)`.
pub fn register(
    ring: libc::c_int,
    operation: libc::c_uint,
    operand: *mut libc::c_void,
    count: libc::c_uint,
) -> libc::c_int {
    unsafe { libc::syscall(SYS_REGISTER, ring, operation, operand, count) as libc::c_int }
}

/// Whether the running kernel offers io_uring at all.
pub fn is_supported() -> bool {
    let rc = enter(-1, 0, 0);
    if rc == 0 {
        return true;
    }
    unsafe { *libc::__errno_location() != libc::ENOSYS }
}

/// The running kernel's `(major, minor)` version from `uname(2)`.
pub fn kernel_version() -> Option<(u32, u32)> {
    let mut name: libc::utsname = unsafe { mem::zeroed() };
    if unsafe { libc::uname(&mut name) } != 0 {
        return None;
    }
    let release: Vec<u8> = name
        .release
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    let text = String::from_utf8_lossy(&release);
    let mut parts = text.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_sizes() {
        assert_eq!(mem::size_of::<SqRingOffsets>(), 40);
        assert_eq!(mem::size_of::<CqRingOffsets>(), 40);
        assert_eq!(mem::size_of::<RingParams>(), 120);
        assert_eq!(mem::size_of::<GetEventsArg>(), 24);
        assert_eq!(mem::size_of::<KernelTimespec>(), 16);
    }

    #[test]
    fn test_kernel_version_parses() {
        let version = kernel_version();
        assert!(version.is_some());
        let (major, _minor) = version.unwrap();
        assert!(major >= 2);
    }
}
