//! Submission records and their preparation.
//!
//! A `Submission` is the 64-byte fixed-layout request descriptor the
//! kernel consumes from the submission queue. One `prepare_*` routine
//! exists per operation; each transitions its event to Pending, stores
//! the caller's context in the event, and fills the record fields.
//!
//! The record's `user_data` is assigned by the caller once the event box
//! is leaked into the kernel's custody (`event::into_user_data`); timer
//! and cancel records carry `user_data == 0`.

use std::fmt;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use uringnet_core::endpoint::Endpoint;
use uringnet_core::error::{Error, Result};
use uringnet_core::event::{self, Event, EventStatus, EventType, CONTROL_CAPACITY, MAX_BUFFERS};
use uringnet_core::options::{Data, ReceiveOptions, SendOptions};
use uringnet_core::socket::ProactorSocket;

use crate::sys;

/// Size in bytes of one submission record.
pub const SUBMISSION_SIZE: usize = 64;

/// How a submission reaches the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Write the record into shared memory only; the next `wait` enters
    /// the kernel.
    Deferred,
    /// Enter the kernel immediately after pushing.
    Immediate,
}

impl fmt::Display for SubmitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitMode::Deferred => write!(f, "DEFERRED"),
            SubmitMode::Immediate => write!(f, "IMMEDIATE"),
        }
    }
}

/// A submission queue entry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Submission {
    opcode: u8,
    flags: u8,
    priority: u16,
    fd: i32,
    off: u64,
    addr: u64,
    len: u32,
    options: u32,
    user_data: u64,
    reserved: [u64; 3],
}

const _: () = assert!(mem::size_of::<Submission>() == SUBMISSION_SIZE);

impl Default for Submission {
    fn default() -> Self {
        unsafe { mem::zeroed() }
    }
}

impl Submission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn handle(&self) -> RawFd {
        self.fd
    }

    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// Stamp the event address after the box has been leaked.
    pub fn set_user_data(&mut self, user_data: u64) {
        self.user_data = user_data;
    }

    /// A timeout record waking the ring after `deadline` or one
    /// completion, whichever is first. `timespec` is the caller's stable
    /// storage; the kernel reads it at execution time.
    pub fn prepare_timeout(&mut self, timespec: &mut libc::timespec, deadline: Instant) {
        let duration = deadline.saturating_duration_since(Instant::now());
        timespec.tv_sec = duration.as_secs() as libc::time_t;
        timespec.tv_nsec = duration.subsec_nanos() as libc::c_long;

        self.reset();
        self.opcode = sys::op::TIMEOUT;
        self.fd = -1;
        self.addr = timespec as *mut libc::timespec as u64;
        self.len = 1;
        // The count lives in the offset field: complete the timeout once
        // one other completion arrives, or when the clock expires.
        self.off = 1;
    }

    /// A no-op record whose completion runs `function`.
    pub fn prepare_callback(&mut self, event: &mut Event, function: Box<dyn FnOnce() + Send>) {
        debug_assert_eq!(event.status(), EventStatus::Free);

        event.event_type = EventType::Callback;
        event.set_status(EventStatus::Pending);
        event.function = Some(function);

        self.reset();
        self.opcode = sys::op::NOP;
        self.fd = -1;
    }

    /// An accept on a listening handle. The peer address lands in the
    /// event's inline storage.
    pub fn prepare_accept(
        &mut self,
        event: &mut Event,
        socket: &Arc<dyn ProactorSocket>,
        handle: RawFd,
    ) -> Result<()> {
        debug_assert_eq!(event.status(), EventStatus::Free);

        event.event_type = EventType::Accept;
        event.set_status(EventStatus::Pending);
        event.socket = Some(Arc::downgrade(socket));
        event.address = unsafe { mem::zeroed() };
        event.indicator = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        self.reset();
        self.opcode = sys::op::ACCEPT;
        self.fd = handle;
        self.addr = &mut event.address as *mut libc::sockaddr_storage as u64;
        self.off = &mut event.indicator as *mut libc::socklen_t as u64;
        self.options = libc::SOCK_CLOEXEC as u32;

        Ok(())
    }

    /// A connect to `endpoint`, encoded into the event's inline storage.
    pub fn prepare_connect(
        &mut self,
        event: &mut Event,
        socket: &Arc<dyn ProactorSocket>,
        handle: RawFd,
        endpoint: &Endpoint,
    ) -> Result<()> {
        debug_assert_eq!(event.status(), EventStatus::Free);

        event.event_type = EventType::Connect;
        event.set_status(EventStatus::Pending);
        event.socket = Some(Arc::downgrade(socket));

        let length = endpoint.encode(&mut event.address)?;
        event.indicator = length;

        self.reset();
        self.opcode = sys::op::CONNECT;
        self.fd = handle;
        self.addr = &event.address as *const libc::sockaddr_storage as u64;
        self.off = length as u64;

        Ok(())
    }

    /// A datagram send gathered from `data`.
    ///
    /// Scatter descriptors are capped at the smaller of `IOV_MAX`, the
    /// event's inline capacity, and the source's natural segment count;
    /// `options.max_bytes` caps the gathered byte total. File-backed
    /// sources are not yet translatable to datagram submissions.
    pub fn prepare_send(
        &mut self,
        event: &mut Event,
        socket: &Arc<dyn ProactorSocket>,
        handle: RawFd,
        data: Data,
        options: &SendOptions,
    ) -> Result<()> {
        debug_assert_eq!(event.status(), EventStatus::Free);

        if matches!(data, Data::File(_)) {
            return Err(Error::NotImplemented);
        }

        event.event_type = EventType::Send;
        event.set_status(EventStatus::Pending);
        event.socket = Some(Arc::downgrade(socket));
        event.zero_copy = options.zero_copy;
        event.user = options.correlation;

        let mut buffers_max = MAX_BUFFERS.min(libc::UIO_MAXIOV as usize);
        if options.max_buffers != 0 {
            buffers_max = buffers_max.min(options.max_buffers);
        }
        let bytes_max = if options.max_bytes != 0 {
            options.max_bytes
        } else {
            usize::MAX
        };

        // The source's segments are behind an Arc the event retains, so
        // the pointers gathered here stay valid while the kernel owns
        // the operation.
        let mut buffer_count = 0usize;
        let mut byte_count = 0usize;
        {
            let mut push = |buffers: &mut [libc::iovec], ptr: *const u8, available: usize| {
                if buffer_count == buffers_max || byte_count == bytes_max {
                    return;
                }
                let take = available.min(bytes_max - byte_count);
                if take == 0 {
                    return;
                }
                buffers[buffer_count] = libc::iovec {
                    iov_base: ptr as *mut libc::c_void,
                    iov_len: take,
                };
                buffer_count += 1;
                byte_count += take;
            };

            match &data {
                Data::Blob(blob) => push(&mut event.buffers, blob.as_slice().as_ptr(), blob.len()),
                Data::Bytes(bytes) => push(&mut event.buffers, bytes.as_ptr(), bytes.len()),
                Data::Text(text) => {
                    push(&mut event.buffers, text.as_bytes().as_ptr(), text.len())
                }
                Data::BufferArray(array) => {
                    for buffer in array.iter() {
                        push(&mut event.buffers, buffer.as_ptr(), buffer.len());
                    }
                }
                Data::File(_) => unreachable!(),
            }
        }

        event.send_data = Some(data);

        if buffer_count == 0 || byte_count == 0 {
            event.set_status(EventStatus::Free);
            event.send_data = None;
            return Err(Error::Invalid);
        }

        event.bytes_attempted = byte_count as u64;

        event.message = unsafe { mem::zeroed() };
        event.message.msg_iov = event.buffers.as_mut_ptr();
        event.message.msg_iovlen = buffer_count;

        if let Some(endpoint) = &options.endpoint {
            let length = endpoint.encode(&mut event.address)?;
            event.message.msg_name =
                &mut event.address as *mut libc::sockaddr_storage as *mut libc::c_void;
            event.message.msg_namelen = length;
        }

        if let Some(foreign) = options.foreign_handle {
            encode_foreign_handle(event, foreign)?;
            event.foreign_handle = Some(foreign);
        }

        self.reset();
        self.opcode = if options.zero_copy {
            sys::op::SENDMSG_ZC
        } else {
            sys::op::SENDMSG
        };
        if options.zero_copy {
            self.priority = sys::SEND_ZC_REPORT_USAGE;
        }
        self.fd = handle;
        self.addr = &event.message as *const libc::msghdr as u64;
        self.len = 1;
        self.options = libc::MSG_NOSIGNAL as u32;

        Ok(())
    }

    /// A datagram receive scattering into `blob`'s writable region.
    pub fn prepare_receive(
        &mut self,
        event: &mut Event,
        socket: &Arc<dyn ProactorSocket>,
        handle: RawFd,
        blob: uringnet_core::blob::Blob,
        options: &ReceiveOptions,
    ) -> Result<()> {
        debug_assert_eq!(event.status(), EventStatus::Free);

        event.event_type = EventType::Receive;
        event.set_status(EventStatus::Pending);
        event.socket = Some(Arc::downgrade(socket));
        event.receive_blob = Some(blob);

        let bytes_max = if options.max_bytes != 0 {
            options.max_bytes
        } else {
            usize::MAX
        };

        let (base, writable) = event.receive_blob.as_mut().unwrap().writable();
        let length = writable.min(bytes_max);
        if length == 0 {
            event.set_status(EventStatus::Free);
            return Err(Error::Invalid);
        }

        event.buffers[0] = libc::iovec {
            iov_base: base as *mut libc::c_void,
            iov_len: length,
        };
        event.bytes_attempted = length as u64;

        event.message = unsafe { mem::zeroed() };
        event.message.msg_iov = event.buffers.as_mut_ptr();
        event.message.msg_iovlen = 1;

        if options.want_endpoint {
            event.address = unsafe { mem::zeroed() };
            event.message.msg_name =
                &mut event.address as *mut libc::sockaddr_storage as *mut libc::c_void;
            event.message.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        }

        if options.want_foreign_handle || options.want_timestamp {
            event.message.msg_control = event.control.0.as_mut_ptr() as *mut libc::c_void;
            event.message.msg_controllen = CONTROL_CAPACITY;
        }

        self.reset();
        self.opcode = sys::op::RECVMSG;
        self.fd = handle;
        self.addr = &event.message as *const libc::msghdr as u64;
        self.len = 1;

        Ok(())
    }

    /// Cancel every operation outstanding against `handle`
    /// (kernels ≥ 5.19).
    pub fn prepare_cancel_by_handle(&mut self, handle: RawFd) {
        self.reset();
        self.opcode = sys::op::ASYNC_CANCEL;
        self.fd = handle;
        self.options = sys::ASYNC_CANCEL_ALL | sys::ASYNC_CANCEL_FD;
    }

    /// Cancel the single operation whose submission carried
    /// `target_user_data`. The caller has already transitioned that
    /// event Pending → Cancelled.
    pub fn prepare_cancel_by_event(&mut self, target_user_data: u64) {
        debug_assert_eq!(
            unsafe { event::borrow_user_data(target_user_data).status() },
            EventStatus::Cancelled
        );

        self.reset();
        self.opcode = sys::op::ASYNC_CANCEL;
        self.fd = -1;
        self.addr = target_user_data;
    }

    /// The record-level invariants: a usable handle, and user data
    /// present exactly when the operation is event-bearing.
    pub fn is_valid(&self) -> bool {
        if self.fd < -1 {
            return false;
        }

        if self.opcode == sys::op::TIMEOUT || self.opcode == sys::op::ASYNC_CANCEL {
            return self.user_data == 0;
        }

        if self.user_data == 0 {
            return false;
        }

        unsafe { event::borrow_user_data(self.user_data).status() == EventStatus::Pending }
    }
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("opcode", &self.opcode)
            .field("fd", &self.fd)
            .field("len", &self.len)
            .field("options", &self.options)
            .field("user_data", &format_args!("{:#x}", self.user_data))
            .finish()
    }
}

/// Encode one passed descriptor as `SCM_RIGHTS` ancillary data in the
/// event's control region.
fn encode_foreign_handle(event: &mut Event, foreign: RawFd) -> Result<()> {
    let space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    if space > CONTROL_CAPACITY {
        return Err(Error::Invalid);
    }

    event.message.msg_control = event.control.0.as_mut_ptr() as *mut libc::c_void;
    event.message.msg_controllen = space;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&event.message);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as libc::size_t;
        *(libc::CMSG_DATA(cmsg) as *mut RawFd) = foreign;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::Arc;
    use uringnet_core::blob::Blob;
    use uringnet_core::event::EventPool;

    struct StubSocket;

    impl ProactorSocket for StubSocket {
        fn handle(&self) -> RawFd {
            7
        }
        fn set_proactor_context(&self, _: Option<Arc<dyn Any + Send + Sync>>) {}
        fn proactor_context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
            None
        }
    }

    fn stub_socket() -> Arc<dyn ProactorSocket> {
        Arc::new(StubSocket)
    }

    #[test]
    fn test_record_size() {
        assert_eq!(mem::size_of::<Submission>(), 64);
    }

    #[test]
    fn test_prepare_timeout_fields() {
        let mut timespec = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let mut entry = Submission::new();
        entry.prepare_timeout(
            &mut timespec,
            Instant::now() + std::time::Duration::from_secs(2),
        );
        assert_eq!(entry.opcode(), sys::op::TIMEOUT);
        assert_eq!(entry.handle(), -1);
        assert_eq!(entry.user_data(), 0);
        assert!(timespec.tv_sec >= 1);
        assert!(entry.is_valid());
    }

    #[test]
    fn test_prepare_send_gathers_buffer_array() {
        let pool = EventPool::new(2);
        let mut event = pool.allocate();
        let socket = stub_socket();

        let data = Data::BufferArray(Arc::new(vec![vec![1u8; 10], vec![2u8; 20], vec![3u8; 30]]));
        let mut entry = Submission::new();
        entry
            .prepare_send(&mut event, &socket, 7, data, &SendOptions::default())
            .unwrap();

        assert_eq!(entry.opcode(), sys::op::SENDMSG);
        assert_eq!(event.message.msg_iovlen, 3);
        assert_eq!(event.bytes_attempted, 60);
        assert_eq!(event.status(), EventStatus::Pending);
    }

    #[test]
    fn test_prepare_send_respects_max_bytes() {
        let pool = EventPool::new(2);
        let mut event = pool.allocate();
        let socket = stub_socket();

        let data = Data::BufferArray(Arc::new(vec![vec![0u8; 10], vec![0u8; 10]]));
        let options = SendOptions {
            max_bytes: 15,
            ..Default::default()
        };
        let mut entry = Submission::new();
        entry
            .prepare_send(&mut event, &socket, 7, data, &options)
            .unwrap();

        assert_eq!(event.bytes_attempted, 15);
        assert_eq!(event.message.msg_iovlen, 2);
    }

    #[test]
    fn test_prepare_send_zero_copy_opcode() {
        let pool = EventPool::new(2);
        let mut event = pool.allocate();
        let socket = stub_socket();

        let data = Data::Bytes(Arc::new(vec![0u8; 64 * 1024]));
        let options = SendOptions {
            zero_copy: true,
            ..Default::default()
        };
        let mut entry = Submission::new();
        entry
            .prepare_send(&mut event, &socket, 7, data, &options)
            .unwrap();

        assert_eq!(entry.opcode(), sys::op::SENDMSG_ZC);
        assert!(event.zero_copy);
    }

    #[test]
    fn test_prepare_send_file_not_implemented() {
        let pool = EventPool::new(2);
        let mut event = pool.allocate();
        let socket = stub_socket();

        let data = Data::File(uringnet_core::options::FileRegion {
            fd: 3,
            offset: 0,
            length: 100,
        });
        let mut entry = Submission::new();
        assert_eq!(
            entry.prepare_send(&mut event, &socket, 7, data, &SendOptions::default()),
            Err(Error::NotImplemented)
        );
    }

    #[test]
    fn test_prepare_send_encodes_endpoint() {
        let pool = EventPool::new(2);
        let mut event = pool.allocate();
        let socket = stub_socket();

        let options = SendOptions {
            endpoint: Some(Endpoint::Ip("127.0.0.1:9000".parse().unwrap())),
            ..Default::default()
        };
        let data = Data::Bytes(Arc::new(b"ping".to_vec()));
        let mut entry = Submission::new();
        entry
            .prepare_send(&mut event, &socket, 7, data, &options)
            .unwrap();

        assert!(!event.message.msg_name.is_null());
        let decoded = Endpoint::decode(&event.address, event.message.msg_namelen).unwrap();
        assert_eq!(decoded, Endpoint::Ip("127.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn test_prepare_receive_scatters_into_blob() {
        let pool = EventPool::new(2);
        let mut event = pool.allocate();
        let socket = stub_socket();

        let blob = Blob::with_capacity(2048);
        let mut entry = Submission::new();
        entry
            .prepare_receive(&mut event, &socket, 7, blob, &ReceiveOptions::default())
            .unwrap();

        assert_eq!(entry.opcode(), sys::op::RECVMSG);
        assert!(event.bytes_attempted >= 2048);
        assert!(!event.message.msg_name.is_null());
        assert!(event.message.msg_control.is_null());
    }

    #[test]
    fn test_prepare_cancel_records_carry_no_user_data() {
        let mut by_handle = Submission::new();
        by_handle.prepare_cancel_by_handle(9);
        assert_eq!(by_handle.opcode(), sys::op::ASYNC_CANCEL);
        assert_eq!(by_handle.user_data(), 0);
        assert!(by_handle.is_valid());

        let pool = EventPool::new(2);
        let event = pool.allocate();
        event.set_status(EventStatus::Pending);
        assert!(event.transition(EventStatus::Pending, EventStatus::Cancelled));
        let user_data = event::into_user_data(event);

        let mut by_event = Submission::new();
        by_event.prepare_cancel_by_event(user_data);
        assert_eq!(by_event.handle(), -1);
        assert_eq!(by_event.user_data(), 0);
        assert!(by_event.is_valid());

        unsafe {
            pool.recycle(event::from_user_data(user_data));
        }
    }

    #[test]
    fn test_is_valid_rejects_free_event() {
        let pool = EventPool::new(2);
        let mut event = pool.allocate();
        let socket = stub_socket();

        let mut entry = Submission::new();
        entry
            .prepare_send(
                &mut event,
                &socket,
                7,
                Data::Bytes(Arc::new(b"x".to_vec())),
                &SendOptions::default(),
            )
            .unwrap();

        // Not yet stamped with user data: invalid.
        assert!(!entry.is_valid());

        let user_data = event::into_user_data(event);
        entry.set_user_data(user_data);
        assert!(entry.is_valid());

        unsafe {
            let event = event::from_user_data(user_data);
            event.set_status(EventStatus::Free);
            assert!(!entry.is_valid());
            pool.recycle(event);
        }
    }
}
