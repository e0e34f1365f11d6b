//! The asynchronous datagram socket.
//!
//! A `DatagramSocket` owns two deferred-work queues (send, receive), a
//! flow-control state, a shutdown state machine, a zero-copy ledger, a
//! timestamp correlator, and optional rate limiters with relief timers.
//! The proactor drives the kernel; this type owns ordering, back
//! pressure, and the exactly-once callback contract.
//!
//! Locking: all socket state sits behind one mutex; session
//! announcements and user callbacks are collected while locked and run
//! after the lock is released. The proactor's queues are acquired under
//! the socket mutex, never the other way around.

use std::any::Any;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Instant, SystemTime};

use log::{debug, trace, warn};

use uringnet_core::blob::{Blob, BlobPool};
use uringnet_core::endpoint::{Endpoint, Transport};
use uringnet_core::error::{Error, Result};
use uringnet_core::options::{
    Data, ReceiveContext, ReceiveOptions, SendContext, SendOptions, ShutdownMode, ShutdownOrigin,
    ShutdownType,
};
use uringnet_core::socket::ProactorSocket;

use uringnet_proactor::{Proactor, TimerHandle};

use crate::deflate::{Deflater, Inflater};
use crate::flow::{FlowControlState, FlowControlType};
use crate::limiter::RateLimiter;
use crate::notification::{drain_error_queue, Notification};
use crate::options::DatagramSocketOptions;
use crate::receive_queue::{ReceiveCallback, ReceiveQueue, ReceiveQueueEntry, ReceiveWaiter};
use crate::send_queue::{SendCallback, SendQueue, SendQueueEntry};
use crate::session::{DatagramSocketSession, Resolver};
use crate::shutdown::{ShutdownContext, ShutdownState};
use crate::sockopt;
use crate::timestamp::TimestampCorrelator;
use crate::zero_copy::{ZeroCopy, ZeroCopyQueue, ZeroCopyType};

/// Identifies one queued send for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendToken(u64);

/// Identifies one pending receive callback for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveToken(u64);

/// Invoked exactly once with the outcome of a connect.
pub type ConnectCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Deferred user-visible work, run after the state lock is released.
type Action = Box<dyn FnOnce() + Send>;

/// The kernel send currently in flight. At most one exists, which is
/// what preserves FIFO departure of the send queue.
struct ActiveSend {
    payload: Arc<Blob>,
    endpoint: Option<Endpoint>,
    foreign_handle: Option<RawFd>,
    length: usize,
    callback: Option<SendCallback>,
    zero_copy_counter: Option<u64>,
}

struct State {
    transport: Option<Transport>,
    source_endpoint: Option<Endpoint>,
    remote_endpoint: Option<Endpoint>,

    send_queue: SendQueue,
    receive_queue: ReceiveQueue,
    flow: FlowControlState,
    shutdown: ShutdownState,

    zero_copy: ZeroCopyQueue,
    zero_copy_threshold: Option<usize>,
    zero_copy_disabled: bool,

    correlator: TimestampCorrelator,
    timestamp_outgoing: bool,
    timestamp_incoming: bool,
    timestamp_counter: u32,

    write_limiter: Option<Box<dyn RateLimiter>>,
    read_limiter: Option<Box<dyn RateLimiter>>,
    send_rate_timer: Option<TimerHandle>,
    receive_rate_timer: Option<TimerHandle>,

    write_deflater: Option<Arc<dyn Deflater>>,
    read_inflater: Option<Arc<dyn Inflater>>,

    active_send: Option<ActiveSend>,
    receive_pending: bool,

    connect_callback: Option<ConnectCallback>,
    close_callback: Option<Action>,
    release_callback: Option<Box<dyn FnOnce(RawFd) + Send>>,

    keep_half_open: bool,
    detach_initiated: bool,
    error: Option<Error>,
}

pub struct DatagramSocket {
    me: Weak<DatagramSocket>,
    proactor: Arc<Proactor>,
    options: DatagramSocketOptions,
    handle: AtomicI32,
    state: Mutex<State>,
    session: Mutex<Option<Arc<dyn DatagramSocketSession>>>,
    resolver: Mutex<Option<Arc<dyn Resolver>>>,
    proactor_context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    blob_pool: Arc<BlobPool>,
}

impl DatagramSocket {
    pub fn create(proactor: Arc<Proactor>, options: DatagramSocketOptions) -> Arc<Self> {
        let blob_pool = BlobPool::new(options.max_datagram_size, options.blob_pool_depth);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            handle: AtomicI32::new(-1),
            state: Mutex::new(State {
                transport: None,
                source_endpoint: None,
                remote_endpoint: None,
                send_queue: SendQueue::new(
                    options.write_queue_low_watermark,
                    options.write_queue_high_watermark,
                ),
                receive_queue: ReceiveQueue::new(
                    options.read_queue_low_watermark,
                    options.read_queue_high_watermark,
                ),
                flow: FlowControlState::new(),
                shutdown: ShutdownState::new(),
                zero_copy: ZeroCopyQueue::new(),
                zero_copy_threshold: options.zero_copy_threshold,
                zero_copy_disabled: false,
                correlator: TimestampCorrelator::new(),
                timestamp_outgoing: options.timestamp_outgoing_data,
                timestamp_incoming: options.timestamp_incoming_data,
                timestamp_counter: 0,
                write_limiter: None,
                read_limiter: None,
                send_rate_timer: None,
                receive_rate_timer: None,
                write_deflater: None,
                read_inflater: None,
                active_send: None,
                receive_pending: false,
                connect_callback: None,
                close_callback: None,
                release_callback: None,
                keep_half_open: options.keep_half_open,
                detach_initiated: false,
                error: None,
            }),
            session: Mutex::new(None),
            resolver: Mutex::new(None),
            proactor_context: Mutex::new(None),
            blob_pool,
            options,
            proactor,
        })
    }

    // ── Observers and collaborators ─────────────────────────────────

    pub fn register_session(&self, session: Arc<dyn DatagramSocketSession>) {
        *self.session.lock().unwrap() = Some(session);
    }

    pub fn deregister_session(&self) {
        *self.session.lock().unwrap() = None;
    }

    pub fn set_resolver(&self, resolver: Arc<dyn Resolver>) {
        *self.resolver.lock().unwrap() = Some(resolver);
    }

    pub fn transport(&self) -> Option<Transport> {
        self.state.lock().unwrap().transport
    }

    pub fn source_endpoint(&self) -> Option<Endpoint> {
        self.state.lock().unwrap().source_endpoint.clone()
    }

    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.state.lock().unwrap().remote_endpoint.clone()
    }

    // ── Open / bind / connect ───────────────────────────────────────

    /// Acquire a fresh system socket for `transport` and attach it to
    /// the proactor.
    pub fn open(&self, transport: Transport) -> Result<()> {
        self.open_internal(transport, None)
    }

    /// Adopt a caller-provided handle instead of creating one.
    pub fn open_with_handle(&self, transport: Transport, handle: RawFd) -> Result<()> {
        if handle < 0 {
            return Err(Error::Invalid);
        }
        self.open_internal(transport, Some(handle))
    }

    fn open_internal(&self, transport: Transport, existing: Option<RawFd>) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.transport.is_some() {
                return Err(Error::Invalid);
            }
        }

        let handle = match existing {
            Some(handle) => handle,
            None => {
                let handle = unsafe {
                    libc::socket(
                        transport.domain(),
                        libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                        transport.protocol(),
                    )
                };
                if handle < 0 {
                    return Err(Error::last_os_error());
                }
                handle
            }
        };

        if let Err(error) = self.configure(handle, transport) {
            if existing.is_none() {
                unsafe { libc::close(handle) };
            }
            return Err(error);
        }

        self.handle.store(handle, Ordering::Release);

        let socket = self.as_proactor_socket();
        if let Err(error) = self.proactor.attach_socket(&socket) {
            self.handle.store(-1, Ordering::Release);
            if existing.is_none() {
                unsafe { libc::close(handle) };
            }
            return Err(error);
        }

        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.transport = Some(transport);
            state.source_endpoint = Endpoint::source_of(handle).ok();
            self.ensure_receive(&mut state);
        }
        run(&mut actions);

        debug!("datagram socket {} opened ({})", handle, transport);
        Ok(())
    }

    fn configure(&self, handle: RawFd, transport: Transport) -> Result<()> {
        if self.options.reuse_address && !transport.is_local() {
            sockopt::set_reuse_address(handle, true)?;
        }
        if let Some(size) = self.options.send_buffer_size {
            sockopt::set_send_buffer_size(handle, size)?;
        }
        if let Some(size) = self.options.receive_buffer_size {
            sockopt::set_receive_buffer_size(handle, size)?;
        }
        if self.options.keep_alive {
            sockopt::set_keep_alive(handle, true).ok();
        }

        if transport == Transport::UdpIpv4 {
            if let Some(enable) = self.options.multicast_loopback {
                sockopt::set_multicast_loopback(handle, enable)?;
            }
            if let Some(hops) = self.options.multicast_time_to_live {
                sockopt::set_multicast_time_to_live(handle, hops)?;
            }
            if let Some(interface) = self.options.multicast_interface {
                sockopt::set_multicast_interface(handle, interface)?;
            }
        }

        if self.options.zero_copy_threshold.is_some() {
            if let Err(error) = sockopt::set_zero_copy(handle, true) {
                warn!("zero-copy refused on {}: {}", handle, error);
                let mut state = self.state.lock().unwrap();
                state.zero_copy_disabled = true;
            }
        }

        if self.options.timestamp_outgoing_data || self.options.timestamp_incoming_data {
            sockopt::set_timestamping(
                handle,
                self.options.timestamp_outgoing_data,
                self.options.timestamp_incoming_data,
            )
            .ok();
        }

        Ok(())
    }

    /// Bind to `endpoint` and record the effective source endpoint.
    pub fn bind(&self, endpoint: &Endpoint) -> Result<()> {
        let handle = self.handle()?;

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let length = endpoint.encode(&mut storage)?;
        let rc = unsafe {
            libc::bind(
                handle,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                length,
            )
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }

        let source = Endpoint::source_of(handle)?;
        self.state.lock().unwrap().source_endpoint = Some(source.clone());
        self.announce(|session| session.on_endpoint_resolved(&source));
        Ok(())
    }

    /// Resolve `name` with the registered resolver, then bind.
    pub fn bind_name(&self, name: &str) -> Result<()> {
        let resolver = self.resolver.lock().unwrap().clone().ok_or(Error::Invalid)?;
        let endpoint = resolver.resolve(name)?;
        self.bind(&endpoint)
    }

    /// Connect asynchronously; the callback fires exactly once.
    pub fn connect(&self, endpoint: &Endpoint, callback: Option<ConnectCallback>) -> Result<()> {
        self.handle()?;

        {
            let mut state = self.state.lock().unwrap();
            if state.connect_callback.is_some() {
                return Err(Error::Invalid);
            }
            state.connect_callback = callback;
        }

        let socket = self.as_proactor_socket();
        if let Err(error) = self.proactor.connect(&socket, endpoint) {
            self.state.lock().unwrap().connect_callback = None;
            return Err(error);
        }
        Ok(())
    }

    /// Resolve `name` with the registered resolver, then connect.
    pub fn connect_name(&self, name: &str, callback: Option<ConnectCallback>) -> Result<()> {
        let resolver = self.resolver.lock().unwrap().clone().ok_or(Error::Invalid)?;
        let endpoint = resolver.resolve(name)?;
        self.connect(&endpoint, callback)
    }

    // ── Send pipeline ───────────────────────────────────────────────

    /// Send `data`, optionally to `options.endpoint`. The happy path
    /// hands the payload straight to the kernel; back pressure queues
    /// it. Returns a token usable with [`cancel_send`].
    pub fn send(
        &self,
        data: Data,
        options: &SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<SendToken> {
        self.handle()?;

        let mut actions: Vec<Action> = Vec::new();
        let token;
        {
            let mut state = self.state.lock().unwrap();

            if !state.shutdown.can_send() {
                return Err(Error::Invalid);
            }

            let payload = self.payload_of(&state, &data)?;
            let deflated = state.write_deflater.is_some();
            let length = payload.len();
            if length == 0 {
                return Err(Error::Invalid);
            }

            let id = state.send_queue.generate_entry_id();
            token = SendToken(id);

            let now = Instant::now();
            let rate_limited = match state.write_limiter.as_mut() {
                Some(limiter) => limiter.would_overflow(length as u64, now),
                None => false,
            };

            let direct = !rate_limited
                && state.active_send.is_none()
                && !state.send_queue.has_entry()
                && state.flow.wants_send();

            if direct {
                match self.start_transmission(
                    &mut state,
                    payload,
                    options.endpoint.clone(),
                    options.foreign_handle,
                    callback,
                ) {
                    Ok(()) => {}
                    Err((error, callback)) => {
                        if let Some(callback) = callback {
                            let context = SendContext {
                                bytes_sendable: length as u64,
                                ..Default::default()
                            };
                            actions.push(Box::new(move || callback(Err(error), context)));
                        }
                        run(&mut actions);
                        return Err(error);
                    }
                }
            } else {
                let timer = options.deadline.map(|deadline| {
                    let weak = self.me.clone();
                    self.schedule_timer(deadline, move || {
                        if let Some(socket) = weak.upgrade() {
                            socket.process_send_deadline(id);
                        }
                    })
                });

                let entry = SendQueueEntry {
                    id,
                    data: Some(payload),
                    endpoint: options.endpoint.clone(),
                    foreign_handle: options.foreign_handle,
                    deadline: options.deadline,
                    timer,
                    length,
                    callback,
                    timestamp: now,
                    deflated,
                };

                state.send_queue.push_entry(entry);
                trace!("send {} queued ({} bytes)", id, length);

                if state.send_queue.authorize_high_watermark_event() {
                    let context = state.send_queue.context();
                    self.announce_deferred(&mut actions, move |session| {
                        session.on_write_queue_high_watermark(context)
                    });
                }

                if rate_limited {
                    self.throttle_send(&mut state, &mut actions, now);
                } else {
                    self.drive_send(&mut state, &mut actions);
                }
            }
        }
        run(&mut actions);
        Ok(token)
    }

    /// Remove a queued send. An entry already handed to the kernel is
    /// not recalled.
    pub fn cancel_send(&self, token: SendToken) -> Result<()> {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Some(mut entry) = state.send_queue.remove(token.0) else {
                return Err(Error::Invalid);
            };
            if let Some(timer) = entry.timer.take() {
                self.proactor.chronology().cancel(timer);
            }
            let length = entry.length;
            if let Some(callback) = entry.callback.take() {
                let context = SendContext {
                    bytes_sendable: length as u64,
                    ..Default::default()
                };
                actions.push(Box::new(move || callback(Err(Error::Cancelled), context)));
            }
            self.note_send_queue_drained(&mut state, &mut actions);
        }
        run(&mut actions);
        Ok(())
    }

    fn payload_of(&self, state: &State, data: &Data) -> Result<Arc<Blob>> {
        let raw: Arc<Blob> = match data {
            Data::Blob(blob) => Arc::clone(blob),
            Data::Bytes(bytes) => Arc::new(Blob::from_slice(bytes)),
            Data::Text(text) => Arc::new(Blob::from_slice(text.as_bytes())),
            Data::BufferArray(buffers) => {
                let total = buffers.iter().map(|b| b.len()).sum();
                let mut blob = Blob::with_capacity(total);
                for buffer in buffers.iter() {
                    blob.extend_from_slice(buffer);
                }
                Arc::new(blob)
            }
            Data::File(_) => return Err(Error::NotImplemented),
        };

        match &state.write_deflater {
            Some(deflater) => {
                let compressed = deflater.deflate(raw.as_slice())?;
                Ok(Arc::new(Blob::from_vec(compressed)))
            }
            None => Ok(raw),
        }
    }

    /// Hand one payload to the kernel. On failure the callback is
    /// returned so the caller can settle it outside the lock.
    fn start_transmission(
        &self,
        state: &mut State,
        payload: Arc<Blob>,
        endpoint: Option<Endpoint>,
        foreign_handle: Option<RawFd>,
        callback: Option<SendCallback>,
    ) -> std::result::Result<(), (Error, Option<SendCallback>)> {
        debug_assert!(state.active_send.is_none());

        let length = payload.len();
        let engage_zero_copy = !state.zero_copy_disabled
            && state
                .zero_copy_threshold
                .map(|threshold| length >= threshold)
                .unwrap_or(false);

        let correlation = if engage_zero_copy {
            state.zero_copy.next_counter()
        } else {
            0
        };

        if state.timestamp_outgoing {
            let counter = state.timestamp_counter;
            state.correlator.save_before_send(counter, SystemTime::now());
            state.timestamp_counter += 1;
        }

        if let Some(limiter) = state.write_limiter.as_mut() {
            limiter.submit(length as u64, Instant::now());
        }

        let send_options = SendOptions {
            endpoint,
            foreign_handle,
            zero_copy: engage_zero_copy,
            correlation,
            ..Default::default()
        };

        let socket = self.as_proactor_socket();
        if let Err(error) = self
            .proactor
            .send(&socket, Data::Blob(Arc::clone(&payload)), &send_options)
        {
            return Err((error, callback));
        }

        let (callback, zero_copy_counter) = if engage_zero_copy {
            let context = SendContext {
                bytes_sendable: length as u64,
                bytes_sent: 0,
                zero_copy: true,
            };
            let counter = state.zero_copy.push(Arc::clone(&payload), context, callback);
            debug_assert_eq!(counter, correlation);
            trace!("zero-copy send {} started", counter);
            (None, Some(counter))
        } else {
            (callback, None)
        };

        state.active_send = Some(ActiveSend {
            payload,
            endpoint: send_options.endpoint,
            foreign_handle,
            length,
            callback,
            zero_copy_counter,
        });

        Ok(())
    }

    /// Pump the send queue while the socket may transmit.
    fn drive_send(&self, state: &mut State, actions: &mut Vec<Action>) {
        loop {
            if state.active_send.is_some() || !state.flow.wants_send() {
                return;
            }
            if state.send_queue.front().is_none() {
                return;
            }

            if state.send_queue.front().unwrap().is_sentinel() {
                state.send_queue.pop_entry();
                // The graceful shutdown point: queued writes before the
                // sentinel have drained.
                if let Some(context) = state
                    .shutdown
                    .try_shutdown_send(state.keep_half_open, ShutdownOrigin::Source)
                {
                    self.shutdown_sequence(state, context, actions);
                }
                continue;
            }

            let length = state.send_queue.front().unwrap().length;
            let now = Instant::now();
            let throttled = match state.write_limiter.as_mut() {
                Some(limiter) => limiter.would_overflow(length as u64, now),
                None => false,
            };
            if throttled {
                self.throttle_send(state, actions, now);
                return;
            }

            let mut entry = state.send_queue.pop_entry().unwrap();
            if let Some(timer) = entry.timer.take() {
                self.proactor.chronology().cancel(timer);
            }

            let payload = entry.data.take().unwrap();
            match self.start_transmission(
                state,
                payload,
                entry.endpoint.take(),
                entry.foreign_handle,
                entry.callback.take(),
            ) {
                Ok(()) => {
                    self.note_send_queue_drained(state, actions);
                    return;
                }
                Err((error, callback)) => {
                    warn!("transmission failed to start: {}", error);
                    if let Some(callback) = callback {
                        let context = SendContext {
                            bytes_sendable: length as u64,
                            ..Default::default()
                        };
                        actions.push(Box::new(move || callback(Err(error), context)));
                    }
                    self.note_send_queue_drained(state, actions);
                }
            }
        }
    }

    /// The write budget is exhausted: announce once, pause the send
    /// direction, and arm the relief timer.
    fn throttle_send(&self, state: &mut State, actions: &mut Vec<Action>, now: Instant) {
        if state.send_rate_timer.is_some() {
            return;
        }

        let context = state.send_queue.context();
        self.announce_deferred(actions, move |session| {
            session.on_write_rate_limit_applied(context)
        });

        if state.flow.apply(FlowControlType::Send, false).send_changed {
            self.announce_deferred(actions, |session| {
                session.on_flow_control_applied(FlowControlType::Send)
            });
        }

        let pending = state
            .send_queue
            .front()
            .map(|entry| entry.length as u64)
            .unwrap_or(1);
        let resume = state
            .write_limiter
            .as_mut()
            .map(|limiter| limiter.time_to_submit(pending, now))
            .unwrap_or(now);

        let weak = self.me.clone();
        let timer = self.schedule_timer(resume, move || {
            if let Some(socket) = weak.upgrade() {
                socket.process_send_rate_timer();
            }
        });
        state.send_rate_timer = Some(timer);
    }

    fn process_send_rate_timer(&self) {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.send_rate_timer = None;

            let context = state.send_queue.context();
            self.announce_deferred(&mut actions, move |session| {
                session.on_write_rate_limit_relaxed(context)
            });

            if state.flow.relax(FlowControlType::Send, false).send_changed {
                self.announce_deferred(&mut actions, |session| {
                    session.on_flow_control_relaxed(FlowControlType::Send)
                });
            }

            self.drive_send(&mut state, &mut actions);
        }
        run(&mut actions);
    }

    fn process_send_deadline(&self, id: u64) {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            // An entry already handed to the kernel is not recalled;
            // only its queue residence is cut short.
            let Some(mut entry) = state.send_queue.remove(id) else {
                return;
            };
            entry.timer = None;
            let length = entry.length;
            if let Some(callback) = entry.callback.take() {
                let context = SendContext {
                    bytes_sendable: length as u64,
                    ..Default::default()
                };
                actions.push(Box::new(move || callback(Err(Error::WouldBlock), context)));
            }
            self.note_send_queue_drained(&mut state, &mut actions);
        }
        run(&mut actions);
    }

    fn note_send_queue_drained(&self, state: &mut State, actions: &mut Vec<Action>) {
        if state.send_queue.authorize_low_watermark_event() {
            let context = state.send_queue.context();
            self.announce_deferred(actions, move |session| {
                session.on_write_queue_low_watermark(context)
            });
        }
    }

    // ── Receive pipeline ────────────────────────────────────────────

    /// Receive one datagram through `callback`, which fires exactly
    /// once: with a datagram, with `WouldBlock` when the deadline
    /// expires first, with `Eof` on receive shutdown, or with
    /// `Cancelled`.
    pub fn receive(
        &self,
        options: &ReceiveOptions,
        callback: ReceiveCallback,
    ) -> Result<ReceiveToken> {
        self.handle()?;

        let mut actions: Vec<Action> = Vec::new();
        let token;
        {
            let mut state = self.state.lock().unwrap();

            if !state.shutdown.can_receive() {
                return Err(Error::Eof);
            }

            let id = state.receive_queue.generate_waiter_id();
            token = ReceiveToken(id);

            if let Some(entry) = state.receive_queue.pop_entry() {
                let context = receive_context(&entry);
                actions.push(Box::new(move || {
                    callback(Ok(()), Some(entry.blob), context)
                }));
                self.note_receive_queue_drained(&mut state, &mut actions);
            } else {
                let timer = options.deadline.map(|deadline| {
                    let weak = self.me.clone();
                    self.schedule_timer(deadline, move || {
                        if let Some(socket) = weak.upgrade() {
                            socket.process_receive_deadline(id);
                        }
                    })
                });
                state.receive_queue.push_waiter(ReceiveWaiter {
                    id,
                    callback: Some(callback),
                    deadline: options.deadline,
                    timer,
                });
            }

            self.ensure_receive(&mut state);
        }
        run(&mut actions);
        Ok(token)
    }

    /// Synchronous poll: the next buffered datagram, or `WouldBlock`.
    pub fn receive_sync(&self) -> Result<(Blob, ReceiveContext)> {
        let mut actions: Vec<Action> = Vec::new();
        let result;
        {
            let mut state = self.state.lock().unwrap();
            if !state.shutdown.can_receive() && !state.receive_queue.has_entry() {
                return Err(Error::Eof);
            }
            match state.receive_queue.pop_entry() {
                Some(entry) => {
                    let context = receive_context(&entry);
                    self.note_receive_queue_drained(&mut state, &mut actions);
                    self.ensure_receive(&mut state);
                    result = Ok((entry.blob, context));
                }
                None => result = Err(Error::WouldBlock),
            }
        }
        run(&mut actions);
        result
    }

    /// Remove a pending receive callback.
    pub fn cancel_receive(&self, token: ReceiveToken) -> Result<()> {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Some(mut waiter) = state.receive_queue.remove_waiter(token.0) else {
                return Err(Error::Invalid);
            };
            if let Some(timer) = waiter.timer.take() {
                self.proactor.chronology().cancel(timer);
            }
            if let Some(callback) = waiter.callback.take() {
                actions.push(Box::new(move || {
                    callback(Err(Error::Cancelled), None, ReceiveContext::default())
                }));
            }
        }
        run(&mut actions);
        Ok(())
    }

    fn process_receive_deadline(&self, id: u64) {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Some(mut waiter) = state.receive_queue.remove_waiter(id) else {
                return;
            };
            waiter.timer = None;
            if let Some(callback) = waiter.callback.take() {
                actions.push(Box::new(move || {
                    callback(Err(Error::WouldBlock), None, ReceiveContext::default())
                }));
            }
        }
        run(&mut actions);
    }

    /// Keep exactly one kernel receive outstanding while the socket
    /// wants readability.
    fn ensure_receive(&self, state: &mut State) {
        if state.receive_pending
            || !state.flow.wants_receive()
            || !state.shutdown.can_receive()
            || state.transport.is_none()
        {
            return;
        }

        let blob = self.blob_pool.allocate();
        let options = ReceiveOptions {
            want_endpoint: state.remote_endpoint.is_none(),
            want_foreign_handle: state
                .transport
                .map(|transport| transport.is_local())
                .unwrap_or(false),
            want_timestamp: state.timestamp_incoming,
            ..Default::default()
        };

        let socket = self.as_proactor_socket();
        match self.proactor.receive(&socket, blob, &options) {
            Ok(()) => state.receive_pending = true,
            Err(error) => warn!("receive submission failed: {}", error),
        }
    }

    fn note_receive_queue_drained(&self, state: &mut State, actions: &mut Vec<Action>) {
        if state.receive_queue.authorize_low_watermark_event() {
            let context = state.receive_queue.context();
            self.announce_deferred(actions, move |session| {
                session.on_read_queue_low_watermark(context)
            });

            // Readability interest was parked at the high watermark;
            // the drain re-arms it.
            if state.flow.relax(FlowControlType::Receive, false).receive_changed {
                self.announce_deferred(actions, |session| {
                    session.on_flow_control_relaxed(FlowControlType::Receive)
                });
            }
        }
    }

    fn process_receive_rate_timer(&self) {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.receive_rate_timer = None;

            let context = state.receive_queue.context();
            self.announce_deferred(&mut actions, move |session| {
                session.on_read_rate_limit_relaxed(context)
            });

            if state.flow.relax(FlowControlType::Receive, false).receive_changed {
                self.announce_deferred(&mut actions, |session| {
                    session.on_flow_control_relaxed(FlowControlType::Receive)
                });
            }

            self.ensure_receive(&mut state);
        }
        run(&mut actions);
    }

    // ── Flow control ────────────────────────────────────────────────

    /// Disable the named directions until relaxed.
    pub fn apply_flow_control(&self, direction: FlowControlType) {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let context = state.flow.apply(direction, false);
            if context.send_changed {
                self.announce_deferred(&mut actions, |session| {
                    session.on_flow_control_applied(FlowControlType::Send)
                });
            }
            if context.receive_changed {
                self.announce_deferred(&mut actions, |session| {
                    session.on_flow_control_applied(FlowControlType::Receive)
                });
            }
        }
        run(&mut actions);
    }

    /// Re-enable the named directions where shutdown has not locked
    /// them off.
    pub fn relax_flow_control(&self, direction: FlowControlType) {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let context = state.flow.relax(direction, false);
            if context.send_changed {
                self.announce_deferred(&mut actions, |session| {
                    session.on_flow_control_relaxed(FlowControlType::Send)
                });
                self.drive_send(&mut state, &mut actions);
            }
            if context.receive_changed {
                self.announce_deferred(&mut actions, |session| {
                    session.on_flow_control_relaxed(FlowControlType::Receive)
                });
                self.ensure_receive(&mut state);
            }
        }
        run(&mut actions);
    }

    // ── Configuration setters ───────────────────────────────────────

    pub fn set_write_rate_limiter(&self, limiter: Option<Box<dyn RateLimiter>>) {
        self.state.lock().unwrap().write_limiter = limiter;
    }

    pub fn set_read_rate_limiter(&self, limiter: Option<Box<dyn RateLimiter>>) {
        self.state.lock().unwrap().read_limiter = limiter;
    }

    pub fn set_write_queue_watermarks(&self, low: usize, high: usize) -> Result<()> {
        if low > high {
            return Err(Error::Invalid);
        }
        let mut state = self.state.lock().unwrap();
        state.send_queue.set_low_watermark(low);
        state.send_queue.set_high_watermark(high);
        Ok(())
    }

    pub fn set_read_queue_watermarks(&self, low: usize, high: usize) -> Result<()> {
        if low > high {
            return Err(Error::Invalid);
        }
        let mut state = self.state.lock().unwrap();
        state.receive_queue.set_low_watermark(low);
        state.receive_queue.set_high_watermark(high);
        Ok(())
    }

    /// Payloads at least `threshold` bytes long engage zero-copy.
    /// `None` disables the path.
    pub fn set_zero_copy_threshold(&self, threshold: Option<usize>) -> Result<()> {
        if threshold.is_some() {
            if let Ok(handle) = self.handle() {
                sockopt::set_zero_copy(handle, true)?;
            }
        }
        let mut state = self.state.lock().unwrap();
        state.zero_copy_threshold = threshold;
        Ok(())
    }

    /// Toggle transmit timestamping. Disabling clears the correlator
    /// and resets the counter.
    pub fn timestamp_outgoing_data(&self, enable: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Ok(handle) = self.handle() {
            sockopt::set_timestamping(handle, enable, state.timestamp_incoming)?;
        }
        if state.timestamp_outgoing != enable {
            state.timestamp_outgoing = enable;
            state.timestamp_counter = 0;
            if !enable {
                state.correlator.reset();
            }
        }
        Ok(())
    }

    /// Toggle receive timestamping.
    pub fn timestamp_incoming_data(&self, enable: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Ok(handle) = self.handle() {
            sockopt::set_timestamping(handle, state.timestamp_outgoing, enable)?;
        }
        state.timestamp_incoming = enable;
        Ok(())
    }

    pub fn set_write_deflater(&self, deflater: Option<Arc<dyn Deflater>>) {
        self.state.lock().unwrap().write_deflater = deflater;
    }

    pub fn set_read_inflater(&self, inflater: Option<Arc<dyn Inflater>>) {
        self.state.lock().unwrap().read_inflater = inflater;
    }

    pub fn set_multicast_loopback(&self, enable: bool) -> Result<()> {
        sockopt::set_multicast_loopback(self.handle()?, enable)
    }

    pub fn set_multicast_time_to_live(&self, hops: u32) -> Result<()> {
        sockopt::set_multicast_time_to_live(self.handle()?, hops)
    }

    pub fn set_multicast_interface(&self, interface: Ipv4Addr) -> Result<()> {
        sockopt::set_multicast_interface(self.handle()?, interface)
    }

    pub fn join_multicast_group(&self, group: Ipv4Addr, interface: Ipv4Addr) -> Result<()> {
        sockopt::join_multicast_group(self.handle()?, group, interface)
    }

    pub fn leave_multicast_group(&self, group: Ipv4Addr, interface: Ipv4Addr) -> Result<()> {
        sockopt::leave_multicast_group(self.handle()?, group, interface)
    }

    // ── Shutdown / close / release ──────────────────────────────────

    /// Shut down one or both directions. A graceful send shutdown with
    /// queued writes defers the half-close behind a sentinel entry.
    pub fn shutdown(&self, direction: ShutdownType, mode: ShutdownMode) -> Result<()> {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();

            if direction.includes_send() && state.shutdown.can_send() {
                if mode == ShutdownMode::Graceful && state.send_queue.has_entry() {
                    state.shutdown.note_send_draining();
                    let id = state.send_queue.generate_entry_id();
                    state.send_queue.push_entry(SendQueueEntry {
                        id,
                        data: None,
                        endpoint: None,
                        foreign_handle: None,
                        deadline: None,
                        timer: None,
                        length: 0,
                        callback: None,
                        timestamp: Instant::now(),
                        deflated: false,
                    });
                } else {
                    let keep_half_open = state.keep_half_open;
                    if let Some(context) = state
                        .shutdown
                        .try_shutdown_send(keep_half_open, ShutdownOrigin::Source)
                    {
                        self.shutdown_sequence(&mut state, context, &mut actions);
                    }
                }
            }

            if direction.includes_receive() && state.shutdown.can_receive() {
                let keep_half_open = state.keep_half_open;
                if let Some(context) = state
                    .shutdown
                    .try_shutdown_receive(keep_half_open, ShutdownOrigin::Source)
                {
                    self.shutdown_sequence(&mut state, context, &mut actions);
                }
            }
        }
        run(&mut actions);
        Ok(())
    }

    /// Cancel everything, shut down both directions, detach, close the
    /// handle, and invoke `callback` exactly once.
    pub fn close(&self, callback: Option<Box<dyn FnOnce() + Send>>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.close_callback.is_none() {
                state.close_callback = callback;
            } else if let Some(callback) = callback {
                // A second close observes completion along with the
                // first.
                let previous = state.close_callback.take().unwrap();
                state.close_callback = Some(Box::new(move || {
                    previous();
                    callback();
                }));
            }

            let already_closed = state.transport.is_none()
                || (state.shutdown.completed() && self.handle.load(Ordering::Acquire) < 0);
            if already_closed {
                // Never opened, or detachment already finished: there
                // is nothing left to wait for.
                let callback = state.close_callback.take();
                drop(state);
                if let Some(callback) = callback {
                    callback();
                }
                return;
            }
        }

        let socket = self.as_proactor_socket();
        let _ = self.proactor.cancel(&socket);
        let _ = self.shutdown(ShutdownType::Both, ShutdownMode::Immediate);
    }

    /// Like `close`, but the OS handle is handed to `callback` instead
    /// of being released.
    pub fn release(&self, callback: Box<dyn FnOnce(RawFd) + Send>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.release_callback.is_some() {
                return Err(Error::Invalid);
            }
            state.release_callback = Some(callback);
        }
        self.close(None);
        Ok(())
    }

    /// One shutdown transition's obligations, with the state lock held.
    fn shutdown_sequence(
        &self,
        state: &mut State,
        context: ShutdownContext,
        actions: &mut Vec<Action>,
    ) {
        if context.initiated {
            self.announce_deferred(actions, |session| session.on_shutdown_initiated());
        }

        if context.send {
            if let Some(timer) = state.send_rate_timer.take() {
                self.proactor.chronology().cancel(timer);
            }

            // Abandon the zero-copy ledger; the kernel may still hold
            // pages but the callbacks settle now.
            let mut abandoned = Vec::new();
            state.zero_copy.clear(&mut abandoned);
            for (context, callback) in abandoned {
                if let Some(callback) = callback {
                    actions.push(Box::new(move || callback(Err(Error::Cancelled), context)));
                }
            }

            if let Some(mut active) = state.active_send.take() {
                if let Some(callback) = active.callback.take() {
                    let context = SendContext {
                        bytes_sendable: active.length as u64,
                        ..Default::default()
                    };
                    actions.push(Box::new(move || callback(Err(Error::Cancelled), context)));
                }
            }

            let mut entries = Vec::new();
            let discarded = state.send_queue.remove_all(&mut entries);
            for mut entry in entries {
                if let Some(timer) = entry.timer.take() {
                    self.proactor.chronology().cancel(timer);
                }
                let length = entry.length;
                if let Some(callback) = entry.callback.take() {
                    let context = SendContext {
                        bytes_sendable: length as u64,
                        ..Default::default()
                    };
                    actions.push(Box::new(move || callback(Err(Error::Cancelled), context)));
                }
            }
            if discarded {
                let context = state.send_queue.context();
                self.announce_deferred(actions, move |session| {
                    session.on_write_queue_discarded(context)
                });
            }

            if state.flow.apply(FlowControlType::Send, true).send_changed {
                self.announce_deferred(actions, |session| {
                    session.on_flow_control_applied(FlowControlType::Send)
                });
            }

            let socket = self.as_proactor_socket();
            let _ = self.proactor.shutdown(&socket, ShutdownType::Send);

            self.announce_deferred(actions, |session| session.on_shutdown_send());
        }

        if context.receive {
            if let Some(timer) = state.receive_rate_timer.take() {
                self.proactor.chronology().cancel(timer);
            }

            let mut entries = Vec::new();
            let mut waiters = Vec::new();
            state.receive_queue.remove_all(&mut entries, &mut waiters);

            for entry in entries {
                self.blob_pool.recycle(entry.blob);
            }
            for mut waiter in waiters {
                if let Some(timer) = waiter.timer.take() {
                    self.proactor.chronology().cancel(timer);
                }
                if let Some(callback) = waiter.callback.take() {
                    actions.push(Box::new(move || {
                        callback(Err(Error::Eof), None, ReceiveContext::default())
                    }));
                }
            }

            // One final low-watermark announcement lets observers see
            // the end of the read stream.
            let queue_context = state.receive_queue.context();
            self.announce_deferred(actions, move |session| {
                session.on_read_queue_low_watermark(queue_context)
            });

            if state.flow.apply(FlowControlType::Receive, true).receive_changed {
                self.announce_deferred(actions, |session| {
                    session.on_flow_control_applied(FlowControlType::Receive)
                });
            }

            let socket = self.as_proactor_socket();
            let _ = self.proactor.shutdown(&socket, ShutdownType::Receive);

            self.announce_deferred(actions, |session| session.on_shutdown_receive());
        }

        if context.completed && !state.detach_initiated {
            state.detach_initiated = true;
            let weak = self.me.clone();
            actions.push(Box::new(move || {
                if let Some(socket) = weak.upgrade() {
                    let proactor_socket = socket.as_proactor_socket();
                    let _ = socket.proactor.cancel(&proactor_socket);
                    if let Err(error) = socket.proactor.detach_socket(&proactor_socket) {
                        warn!("detach failed: {}", error);
                    }
                }
            }));
        }
    }

    /// A fatal error: announce it, then run the full shutdown sequence.
    fn fail(&self, state: &mut State, error: Error, actions: &mut Vec<Action>) {
        if state.error.is_none() {
            state.error = Some(error);
            self.announce_deferred(actions, move |session| session.on_error(error));
        }

        if let Some(context) = state
            .shutdown
            .try_shutdown_send(false, ShutdownOrigin::Remote)
        {
            self.shutdown_sequence(state, context, actions);
        }
        if let Some(context) = state
            .shutdown
            .try_shutdown_receive(false, ShutdownOrigin::Remote)
        {
            self.shutdown_sequence(state, context, actions);
        }
    }

    // ── Notifications ───────────────────────────────────────────────

    /// Drain the error queue and route its notifications.
    fn drain_notifications(&self, state: &mut State, actions: &mut Vec<Action>) {
        let handle = self.handle.load(Ordering::Acquire);
        if handle < 0 {
            return;
        }

        for notification in drain_error_queue(handle, 16) {
            match notification {
                Notification::Timestamp(timestamp) => {
                    match state.correlator.timestamp_received(&timestamp) {
                        Some(delay) => {
                            trace!(
                                "transmit delay {:?} at stage {:?}",
                                delay,
                                timestamp.kind
                            );
                        }
                        None => {
                            debug!("uncorrelated transmit timestamp {:?}", timestamp);
                        }
                    }
                }
                Notification::ZeroCopy(zero_copy) => {
                    self.apply_zero_copy(state, zero_copy, actions);
                }
            }
        }
    }

    fn apply_zero_copy(&self, state: &mut State, zero_copy: ZeroCopy, actions: &mut Vec<Action>) {
        if zero_copy.kind == ZeroCopyType::Avoided && !state.zero_copy_disabled {
            debug!("zero-copy avoided by the kernel; disabling further attempts");
            state.zero_copy_disabled = true;
        }

        state.zero_copy.update(zero_copy);
        while let Some((context, callback)) = state.zero_copy.pop() {
            if let Some(callback) = callback {
                actions.push(Box::new(move || callback(Ok(()), context)));
            }
        }
    }

    /// Admit one received datagram: inflate, enqueue, watermark and
    /// rate accounting, then satisfy waiting readers FIFO.
    fn accept_datagram(
        &self,
        state: &mut State,
        blob: Blob,
        context: &ReceiveContext,
        actions: &mut Vec<Action>,
    ) {
        let mut blob = blob;

        if let Some(inflater) = state.read_inflater.clone() {
            match inflater.inflate(blob.as_slice()) {
                Ok(expanded) => {
                    blob = Blob::from_vec(expanded);
                }
                Err(error) => {
                    warn!("inflate failed, datagram dropped: {}", error);
                    self.blob_pool.recycle(blob);
                    return;
                }
            }
        }

        let length = blob.len();
        state.receive_queue.push_entry(ReceiveQueueEntry {
            endpoint: context.endpoint.clone(),
            blob,
            foreign_handle: context.foreign_handle,
            timestamp: context.timestamp.unwrap_or_else(SystemTime::now),
            enqueued: Instant::now(),
        });

        if state.receive_queue.authorize_high_watermark_event() {
            let queue_context = state.receive_queue.context();
            self.announce_deferred(actions, move |session| {
                session.on_read_queue_high_watermark(queue_context)
            });
            // Park readability interest until the queue drains below
            // the low watermark.
            if state
                .flow
                .apply(FlowControlType::Receive, false)
                .receive_changed
            {
                self.announce_deferred(actions, |session| {
                    session.on_flow_control_applied(FlowControlType::Receive)
                });
            }
        }

        // Read budget accounting mirrors the send side.
        if let Some(limiter) = state.read_limiter.as_mut() {
            let now = Instant::now();
            limiter.submit(length as u64, now);
            if limiter.would_overflow(1, now) && state.receive_rate_timer.is_none() {
                let queue_context = state.receive_queue.context();
                self.announce_deferred(actions, move |session| {
                    session.on_read_rate_limit_applied(queue_context)
                });
                if state
                    .flow
                    .apply(FlowControlType::Receive, false)
                    .receive_changed
                {
                    self.announce_deferred(actions, |session| {
                        session.on_flow_control_applied(FlowControlType::Receive)
                    });
                }
                let resume = limiter.time_to_submit(1, now);
                let weak = self.me.clone();
                state.receive_rate_timer = Some(self.schedule_timer(resume, move || {
                    if let Some(socket) = weak.upgrade() {
                        socket.process_receive_rate_timer();
                    }
                }));
            }
        }

        // Satisfy waiting readers FIFO.
        while state.receive_queue.has_waiter() && state.receive_queue.has_entry() {
            let mut waiter = state.receive_queue.pop_waiter().unwrap();
            if let Some(timer) = waiter.timer.take() {
                self.proactor.chronology().cancel(timer);
            }
            let entry = state.receive_queue.pop_entry().unwrap();
            if let Some(callback) = waiter.callback.take() {
                let entry_context = receive_context(&entry);
                actions.push(Box::new(move || {
                    callback(Ok(()), Some(entry.blob), entry_context)
                }));
            } else {
                self.blob_pool.recycle(entry.blob);
            }
        }

        self.note_receive_queue_drained(state, actions);
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Schedule a chronology timer and nudge a blocked waiter so the
    /// new deadline bounds its next wait.
    fn schedule_timer<F>(&self, due: Instant, functor: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.proactor.chronology().schedule(due, functor);
        self.proactor.interrupt_one();
        handle
    }

    fn handle(&self) -> Result<RawFd> {
        let handle = self.handle.load(Ordering::Acquire);
        if handle < 0 {
            return Err(Error::Invalid);
        }
        Ok(handle)
    }

    fn strong(&self) -> Arc<DatagramSocket> {
        self.me.upgrade().expect("socket alive during operation")
    }

    fn as_proactor_socket(&self) -> Arc<dyn ProactorSocket> {
        self.strong()
    }

    /// Announce immediately (no state lock held by the caller).
    fn announce<F>(&self, f: F)
    where
        F: FnOnce(&dyn DatagramSocketSession),
    {
        if let Some(session) = self.session.lock().unwrap().clone() {
            f(session.as_ref());
        }
    }

    /// Queue an announcement to run after the state lock is released.
    fn announce_deferred<F>(&self, actions: &mut Vec<Action>, f: F)
    where
        F: FnOnce(&dyn DatagramSocketSession) + Send + 'static,
    {
        if let Some(session) = self.session.lock().unwrap().clone() {
            actions.push(Box::new(move || f(session.as_ref())));
        }
    }
}

impl ProactorSocket for DatagramSocket {
    fn handle(&self) -> RawFd {
        self.handle.load(Ordering::Acquire)
    }

    fn set_proactor_context(&self, context: Option<Arc<dyn Any + Send + Sync>>) {
        *self.proactor_context.lock().unwrap() = context;
    }

    fn proactor_context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.proactor_context.lock().unwrap().clone()
    }

    fn process_connected(self: Arc<Self>, result: Result<()>) {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if result.is_ok() {
                let handle = self.handle.load(Ordering::Acquire);
                state.source_endpoint = Endpoint::source_of(handle).ok();
                state.remote_endpoint = Endpoint::remote_of(handle).ok();
            }
            if let Some(callback) = state.connect_callback.take() {
                actions.push(Box::new(move || callback(result)));
            }
        }
        run(&mut actions);
    }

    fn process_sent(self: Arc<Self>, result: Result<()>, context: SendContext) {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let active = state.active_send.take();

            match result {
                Ok(()) => {
                    if let Some(mut active) = active {
                        match active.zero_copy_counter {
                            Some(counter) => {
                                state.zero_copy.frame(counter, context);
                                while let Some((context, callback)) = state.zero_copy.pop() {
                                    if let Some(callback) = callback {
                                        actions
                                            .push(Box::new(move || callback(Ok(()), context)));
                                    }
                                }
                            }
                            None => {
                                if let Some(callback) = active.callback.take() {
                                    actions.push(Box::new(move || callback(Ok(()), context)));
                                }
                            }
                        }
                    }
                    self.drain_notifications(&mut state, &mut actions);
                    self.drive_send(&mut state, &mut actions);
                }
                Err(Error::WouldBlock) => {
                    // Back pressure after submission: requeue at the
                    // front so FIFO order holds, and retry shortly.
                    if let Some(active) = active {
                        let id = state.send_queue.generate_entry_id();
                        state.send_queue.push_front(SendQueueEntry {
                            id,
                            data: Some(active.payload),
                            endpoint: active.endpoint,
                            foreign_handle: active.foreign_handle,
                            deadline: None,
                            timer: None,
                            length: active.length,
                            callback: active.callback,
                            timestamp: Instant::now(),
                            deflated: false,
                        });

                        if state.send_rate_timer.is_none() {
                            let resume =
                                Instant::now() + std::time::Duration::from_millis(1);
                            let weak = self.me.clone();
                            state.send_rate_timer =
                                Some(self.schedule_timer(resume, move || {
                                    if let Some(socket) = weak.upgrade() {
                                        socket.process_send_rate_timer();
                                    }
                                }));
                        }
                    }
                }
                Err(Error::Cancelled) => {
                    if let Some(mut active) = active {
                        if let Some(callback) = active.callback.take() {
                            let context = SendContext {
                                bytes_sendable: active.length as u64,
                                ..Default::default()
                            };
                            actions.push(Box::new(move || {
                                callback(Err(Error::Cancelled), context)
                            }));
                        }
                    }
                }
                Err(error) => {
                    if let Some(mut active) = active {
                        if let Some(callback) = active.callback.take() {
                            let context = SendContext {
                                bytes_sendable: active.length as u64,
                                ..Default::default()
                            };
                            actions.push(Box::new(move || callback(Err(error), context)));
                        }
                    }
                    self.fail(&mut state, error, &mut actions);
                }
            }
        }
        run(&mut actions);
    }

    fn process_received(
        self: Arc<Self>,
        result: Result<()>,
        blob: Option<Blob>,
        context: ReceiveContext,
    ) {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.receive_pending = false;

            match result {
                Ok(()) => {
                    if let Some(blob) = blob {
                        self.accept_datagram(&mut state, blob, &context, &mut actions);
                    }
                    self.ensure_receive(&mut state);
                }
                Err(Error::Cancelled) => {
                    // Shutdown or explicit cancel stopped the pump; the
                    // shutdown path settles user callbacks.
                    if let Some(blob) = blob {
                        self.blob_pool.recycle(blob);
                    }
                }
                Err(error) => {
                    if let Some(blob) = blob {
                        self.blob_pool.recycle(blob);
                    }
                    self.fail(&mut state, error, &mut actions);
                }
            }
        }
        run(&mut actions);
    }

    fn process_zero_copy(self: Arc<Self>, counter: u64, copied: bool) {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let kind = if copied {
                ZeroCopyType::Avoided
            } else {
                ZeroCopyType::Deferred
            };
            self.apply_zero_copy(
                &mut state,
                ZeroCopy {
                    from: counter,
                    thru: counter,
                    kind,
                },
                &mut actions,
            );
        }
        run(&mut actions);
    }

    fn process_error(self: Arc<Self>, error: Error) {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            self.fail(&mut state, error, &mut actions);
        }
        run(&mut actions);
    }

    fn process_detached(self: Arc<Self>) {
        let mut actions: Vec<Action> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();

            let handle = self.handle.swap(-1, Ordering::AcqRel);
            if handle >= 0 {
                match state.release_callback.take() {
                    Some(callback) => {
                        // Export: the caller owns the descriptor now.
                        actions.push(Box::new(move || callback(handle)));
                    }
                    None => unsafe {
                        libc::close(handle);
                    },
                }
            }

            self.announce_deferred(&mut actions, |session| session.on_shutdown_complete());

            if let Some(callback) = state.close_callback.take() {
                actions.push(callback);
            }
        }
        run(&mut actions);
        debug!("datagram socket detached");
    }
}

impl Drop for DatagramSocket {
    fn drop(&mut self) {
        let handle = self.handle.swap(-1, Ordering::AcqRel);
        if handle >= 0 {
            unsafe {
                libc::close(handle);
            }
        }
    }
}

fn receive_context(entry: &ReceiveQueueEntry) -> ReceiveContext {
    ReceiveContext {
        bytes_receivable: entry.blob.len() as u64,
        bytes_received: entry.blob.len() as u64,
        endpoint: entry.endpoint.clone(),
        foreign_handle: entry.foreign_handle,
        timestamp: Some(entry.timestamp),
    }
}

fn run(actions: &mut Vec<Action>) {
    for action in actions.drain(..) {
        action();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_distinct() {
        assert_ne!(SendToken(1), SendToken(2));
        assert_ne!(ReceiveToken(3), ReceiveToken(4));
    }
}
