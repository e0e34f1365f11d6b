//! Per-operation event records and their pool.
//!
//! An `Event` is the unit of outstanding work: it carries everything the
//! kernel needs to reference while an operation is in flight (inline
//! address storage, message header, scatter/gather descriptors, control
//! space) and everything the completion dispatcher needs afterward
//! (owning socket, retained payloads, byte counters, error slot).
//!
//! Events live on the heap (`Box<Event>`) so the addresses written into
//! submission records stay stable. The ring layer encodes the box address
//! as the submission's user data; the proactor reclaims the box when the
//! matching completion is popped, then returns it to the `EventPool`.
//!
//! # Status protocol
//!
//! `status` is atomic because cancellation races completion: a canceller
//! CAS-transitions Pending → Cancelled through a shared reference while
//! the kernel may be finishing the operation. All other transitions are
//! made by the single thread that owns the event at that moment.

use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use crossbeam_queue::ArrayQueue;

use crate::blob::Blob;
use crate::error::Error;
use crate::options::Data;
use crate::socket::ProactorSocket;

/// Inline scatter/gather capacity of one event.
pub const MAX_BUFFERS: usize = 16;

/// Inline ancillary-data capacity of one event, enough for one passed
/// descriptor plus a timestamping block.
pub const CONTROL_CAPACITY: usize = 128;

/// What kind of operation an event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Callback = 0,
    Accept   = 1,
    Connect  = 2,
    Send     = 3,
    Receive  = 4,
}

/// Where an event is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventStatus {
    Free      = 0,
    Pending   = 1,
    Complete  = 2,
    Cancelled = 3,
    Failed    = 4,
}

impl EventStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EventStatus::Free,
            1 => EventStatus::Pending,
            2 => EventStatus::Complete,
            3 => EventStatus::Cancelled,
            _ => EventStatus::Failed,
        }
    }
}

/// 8-byte-aligned ancillary storage so `cmsghdr` access is well formed.
#[repr(C, align(8))]
pub struct ControlStorage(pub [u8; CONTROL_CAPACITY]);

/// Ancillary data recovered from a received message.
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlData {
    /// A descriptor passed over a local-domain socket.
    pub foreign_handle: Option<RawFd>,
    /// A software receive timestamp reported by the kernel.
    pub timestamp: Option<SystemTime>,
}

/// The state of one outstanding operation.
pub struct Event {
    pub event_type: EventType,
    status: AtomicU8,

    /// The socket the operation belongs to. Weak so an in-flight event
    /// does not keep a closed socket alive.
    pub socket: Option<Weak<dyn ProactorSocket>>,

    /// The functor run on completion of a Callback event.
    pub function: Option<Box<dyn FnOnce() + Send>>,

    /// Inline storage for a socket address written by or for the kernel.
    pub address: libc::sockaddr_storage,
    /// In/out length of `address`.
    pub indicator: libc::socklen_t,
    /// The message header referencing the event's own storage.
    pub message: libc::msghdr,
    /// Scatter/gather descriptors referencing caller buffers.
    pub buffers: [libc::iovec; MAX_BUFFERS],
    /// Ancillary data space (descriptor passing, timestamps).
    pub control: ControlStorage,
    /// Relative timespec storage for timeout submissions.
    pub timespec: libc::timespec,

    /// A descriptor to pass with a send, when any.
    pub foreign_handle: Option<RawFd>,
    /// The handle produced by an accept completion.
    pub target: RawFd,

    pub bytes_attempted: u64,
    pub bytes_completed: u64,
    pub error: Option<Error>,
    /// Caller correlation value.
    pub user: u64,

    /// Set when the send was submitted on the zero-copy path; the
    /// matching ledger entry is keyed by `user`.
    pub zero_copy: bool,

    /// The destination blob retained across a receive.
    pub receive_blob: Option<Blob>,
    /// The source payload retained across a send.
    pub send_data: Option<Data>,
}

// The message header and scatter descriptors hold raw pointers into the
// event's own inline storage and into reference-counted payloads retained
// by `send_data`/`receive_blob`, so moving the box between threads cannot
// invalidate them.
unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    fn new() -> Self {
        Self {
            event_type: EventType::Callback,
            status: AtomicU8::new(EventStatus::Free as u8),
            socket: None,
            function: None,
            address: unsafe { mem::zeroed() },
            indicator: 0,
            message: unsafe { mem::zeroed() },
            buffers: unsafe { mem::zeroed() },
            control: ControlStorage([0; CONTROL_CAPACITY]),
            timespec: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            foreign_handle: None,
            target: -1,
            bytes_attempted: 0,
            bytes_completed: 0,
            error: None,
            user: 0,
            zero_copy: false,
            receive_blob: None,
            send_data: None,
        }
    }

    /// Reset to the Free state, dropping retained payloads.
    pub fn reset(&mut self) {
        self.event_type = EventType::Callback;
        self.status.store(EventStatus::Free as u8, Ordering::Relaxed);
        self.socket = None;
        self.function = None;
        self.address = unsafe { mem::zeroed() };
        self.indicator = 0;
        self.message = unsafe { mem::zeroed() };
        self.buffers = unsafe { mem::zeroed() };
        self.control.0 = [0; CONTROL_CAPACITY];
        self.timespec.tv_sec = 0;
        self.timespec.tv_nsec = 0;
        self.foreign_handle = None;
        self.target = -1;
        self.bytes_attempted = 0;
        self.bytes_completed = 0;
        self.error = None;
        self.user = 0;
        self.zero_copy = false;
        self.receive_blob = None;
        self.send_data = None;
    }

    pub fn status(&self) -> EventStatus {
        EventStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: EventStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Atomically transition `from` → `to`. Returns false if the event
    /// was no longer in `from`.
    pub fn transition(&self, from: EventStatus, to: EventStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Parse the control region of a completed receive.
    pub fn parse_control(&self) -> ControlData {
        let mut data = ControlData::default();

        let controllen = self.message.msg_controllen as usize;
        if controllen == 0 {
            return data;
        }

        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&self.message);
            while !cmsg.is_null() {
                let level = (*cmsg).cmsg_level;
                let kind = (*cmsg).cmsg_type;
                if level == libc::SOL_SOCKET && kind == libc::SCM_RIGHTS {
                    let fd = *(libc::CMSG_DATA(cmsg) as *const RawFd);
                    data.foreign_handle = Some(fd);
                } else if level == libc::SOL_SOCKET && kind == libc::SCM_TIMESTAMPING {
                    // struct scm_timestamping { struct timespec ts[3]; };
                    // ts[0] is the software timestamp.
                    let ts = *(libc::CMSG_DATA(cmsg) as *const libc::timespec);
                    if ts.tv_sec != 0 || ts.tv_nsec != 0 {
                        data.timestamp = Some(
                            SystemTime::UNIX_EPOCH
                                + std::time::Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32),
                        );
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&self.message, cmsg);
            }
        }

        data
    }
}

/// Convert an owned event box into the user-data value carried by a
/// submission record.
pub fn into_user_data(event: Box<Event>) -> u64 {
    Box::into_raw(event) as u64
}

/// Reclaim ownership of the event box a completion refers to.
///
/// # Safety
///
/// `user_data` must be a value produced by [`into_user_data`] that has not
/// been reclaimed yet, and no other thread may hold a borrow produced by
/// [`borrow_user_data`] across this call's use of the box.
pub unsafe fn from_user_data(user_data: u64) -> Box<Event> {
    Box::from_raw(user_data as *mut Event)
}

/// Borrow the event a submission's user data refers to without taking
/// ownership, for status inspection and cancellation CAS.
///
/// # Safety
///
/// `user_data` must refer to a live, unreclaimed event box.
pub unsafe fn borrow_user_data<'a>(user_data: u64) -> &'a Event {
    &*(user_data as *const Event)
}

/// A lock-free recycling pool of event boxes.
pub struct EventPool {
    free: ArrayQueue<Box<Event>>,
}

impl EventPool {
    pub fn new(depth: usize) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(depth.max(1)),
        })
    }

    /// Pop a recycled event or allocate a fresh one. The event is Free.
    pub fn allocate(&self) -> Box<Event> {
        match self.free.pop() {
            Some(event) => event,
            None => Box::new(Event::new()),
        }
    }

    /// Reset an event and return it to the pool; drops it when the pool
    /// is full.
    pub fn recycle(&self, mut event: Box<Event>) {
        event.reset();
        let _ = self.free.push(event);
    }

    pub fn cached(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let event = Event::new();
        assert_eq!(event.status(), EventStatus::Free);
        event.set_status(EventStatus::Pending);
        assert!(event.transition(EventStatus::Pending, EventStatus::Cancelled));
        assert!(!event.transition(EventStatus::Pending, EventStatus::Complete));
        assert_eq!(event.status(), EventStatus::Cancelled);
    }

    #[test]
    fn test_user_data_round_trip() {
        let pool = EventPool::new(4);
        let mut event = pool.allocate();
        event.user = 77;
        event.set_status(EventStatus::Pending);

        let user_data = into_user_data(event);
        assert_ne!(user_data, 0);

        unsafe {
            let borrowed = borrow_user_data(user_data);
            assert_eq!(borrowed.user, 77);
            assert_eq!(borrowed.status(), EventStatus::Pending);

            let owned = from_user_data(user_data);
            assert_eq!(owned.user, 77);
            pool.recycle(owned);
        }

        assert_eq!(pool.cached(), 1);
        let recycled = pool.allocate();
        assert_eq!(recycled.user, 0);
        assert_eq!(recycled.status(), EventStatus::Free);
    }

    #[test]
    fn test_pool_overflow_drops() {
        let pool = EventPool::new(1);
        pool.recycle(Box::new(Event::new()));
        pool.recycle(Box::new(Event::new()));
        assert_eq!(pool.cached(), 1);
    }
}
