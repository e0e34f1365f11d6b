//! The proactor: waiter threads, completion dispatch, socket lifecycle.
//!
//! The proactor owns one `RingDevice` and an `EventPool`. User threads
//! start operations (`accept`, `connect`, `send`, `receive`); waiter
//! threads block in `RingDevice::wait`, hydrate the originating events
//! from popped completions, and dispatch them to the owning sockets
//! through the `ProactorSocket` trait. Timers and deferred functors are
//! announced between waits.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, ThreadId};
use std::time::Instant;

use log::{debug, trace, warn};

use uringnet_core::blob::Blob;
use uringnet_core::endpoint::Endpoint;
use uringnet_core::error::{Error, Result};
use uringnet_core::event::{self, Event, EventStatus, EventType};
use uringnet_core::options::{Data, ReceiveContext, ReceiveOptions, SendContext, SendOptions};
use uringnet_core::options::ShutdownType;
use uringnet_core::socket::ProactorSocket;

use uringnet_ring::device::WaitState;
use uringnet_ring::{Completion, RingDevice, SubmitMode, Submission};

use crate::chronology::Chronology;
use crate::context::SocketContext;

/// Proactor construction options.
#[derive(Debug, Clone)]
pub struct ProactorConfig {
    /// Suggested ring depth; the kernel may round it up.
    pub queue_depth: u32,
    /// Number of waiter threads that will share the ring.
    pub max_threads: usize,
    /// Timer/functor announcement cycles run after each wait.
    pub max_cycles_per_wait: usize,
    /// Event boxes retained by the pool.
    pub event_pool_depth: usize,
    /// Submission mode used for accepts started from a waiter thread.
    pub accept_mode: SubmitMode,
    /// Submission mode used for connects started from a waiter thread.
    pub connect_mode: SubmitMode,
    /// Submission mode used for sends started from a waiter thread.
    pub send_mode: SubmitMode,
    /// Submission mode used for receives started from a waiter thread.
    pub receive_mode: SubmitMode,
}

impl Default for ProactorConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            max_threads: 1,
            max_cycles_per_wait: 128,
            event_pool_depth: 1024,
            accept_mode: SubmitMode::Immediate,
            connect_mode: SubmitMode::Immediate,
            send_mode: SubmitMode::Deferred,
            receive_mode: SubmitMode::Deferred,
        }
    }
}

/// One registered waiter thread's local state: the wait storage and the
/// completion batch buffer.
pub struct Waiter {
    state: WaitState,
    buffer: Vec<Completion>,
    thread: ThreadId,
}

/// A binary gate serializing multi-threaded kernel waits.
struct Semaphore {
    count: Mutex<u32>,
    condvar: Condvar,
}

impl Semaphore {
    fn new(count: u32) -> Self {
        Self {
            count: Mutex::new(count),
            condvar: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.condvar.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.condvar.notify_one();
    }
}

const COMPLETION_BATCH: usize = 128;

pub struct Proactor {
    device: RingDevice,
    event_pool: Arc<event::EventPool>,
    chronology: Arc<Chronology>,
    config: ProactorConfig,

    run: AtomicBool,
    semaphore: Semaphore,

    /// Attached sockets by handle. Read-hot on completion dispatch,
    /// written only at attach/detach.
    sockets: RwLock<HashMap<RawFd, std::sync::Weak<dyn ProactorSocket>>>,

    waiters: Mutex<HashSet<ThreadId>>,
    interrupts_pending: Arc<AtomicUsize>,
}

impl Proactor {
    pub fn new(config: ProactorConfig) -> Result<Arc<Self>> {
        let device = RingDevice::new(config.queue_depth)?;
        let event_pool = event::EventPool::new(config.event_pool_depth);
        Ok(Arc::new(Self {
            device,
            event_pool,
            chronology: Arc::new(Chronology::new()),
            semaphore: Semaphore::new(1),
            run: AtomicBool::new(true),
            sockets: RwLock::new(HashMap::new()),
            waiters: Mutex::new(HashSet::new()),
            interrupts_pending: Arc::new(AtomicUsize::new(0)),
            config,
        }))
    }

    pub fn device(&self) -> &RingDevice {
        &self.device
    }

    pub fn chronology(&self) -> &Arc<Chronology> {
        &self.chronology
    }

    /// Defer a functor to the next announcement cycle of any waiter.
    pub fn execute<F>(&self, functor: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.chronology.execute(functor);
        self.interrupt_one();
    }

    // ── Waiter registration ─────────────────────────────────────────

    /// Register the calling thread as a waiter. Must be called on the
    /// thread that will run `poll`/`run`.
    pub fn register_waiter(&self) -> Waiter {
        let thread = thread::current().id();
        self.waiters.lock().unwrap().insert(thread);

        // Sends pass MSG_NOSIGNAL, but callbacks running on this thread
        // may write to half-closed descriptors of their own.
        #[cfg(unix)]
        {
            use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
            let mut mask = SigSet::empty();
            mask.add(Signal::SIGPIPE);
            let _ = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None);
        }

        let capacity = if self.config.max_threads <= 1 {
            COMPLETION_BATCH
        } else {
            // Sharing waiters take one completion at a time so no
            // thread hoards a batch while others starve.
            1
        };

        Waiter {
            state: WaitState::default(),
            buffer: vec![Completion::default(); capacity],
            thread,
        }
    }

    pub fn deregister_waiter(&self, waiter: Waiter) {
        self.waiters.lock().unwrap().remove(&waiter.thread);
    }

    /// Whether the calling thread is a registered waiter.
    pub fn is_waiter(&self) -> bool {
        self.waiters
            .lock()
            .unwrap()
            .contains(&thread::current().id())
    }

    pub fn num_waiters(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    // ── Socket lifecycle ────────────────────────────────────────────

    /// Attach `socket` to this proactor: force the handle into blocking
    /// mode (deferred I/O is the proactor's job now), create the
    /// per-socket context, and install it on the socket.
    pub fn attach_socket(&self, socket: &Arc<dyn ProactorSocket>) -> Result<()> {
        let handle = socket.handle();
        if handle < 0 {
            return Err(Error::Invalid);
        }

        set_blocking(handle, true)?;

        let context = Arc::new(SocketContext::new(handle));

        {
            let mut sockets = self.sockets.write().unwrap();
            if sockets.contains_key(&handle) {
                return Err(Error::Invalid);
            }
            sockets.insert(handle, Arc::downgrade(socket));
        }

        socket.set_proactor_context(Some(context));
        debug!("attached socket {}", handle);
        Ok(())
    }

    /// Start an asynchronous accept on a listening socket.
    pub fn accept(&self, socket: &Arc<dyn ProactorSocket>) -> Result<()> {
        let context = self.context_of(socket)?;
        let mut event = self.event_pool.allocate();
        let mut entry = Submission::new();
        if let Err(error) = entry.prepare_accept(&mut event, socket, context.handle()) {
            self.event_pool.recycle(event);
            return Err(error);
        }
        self.submit_event(&context, entry, event, self.mode_for(self.config.accept_mode))
    }

    /// Start an asynchronous connect to `endpoint`.
    pub fn connect(&self, socket: &Arc<dyn ProactorSocket>, endpoint: &Endpoint) -> Result<()> {
        let context = self.context_of(socket)?;
        let mut event = self.event_pool.allocate();
        let mut entry = Submission::new();
        if let Err(error) = entry.prepare_connect(&mut event, socket, context.handle(), endpoint) {
            self.event_pool.recycle(event);
            return Err(error);
        }
        self.submit_event(&context, entry, event, self.mode_for(self.config.connect_mode))
    }

    /// Start an asynchronous send of `data`.
    pub fn send(
        &self,
        socket: &Arc<dyn ProactorSocket>,
        data: Data,
        options: &SendOptions,
    ) -> Result<()> {
        let context = self.context_of(socket)?;
        let mut event = self.event_pool.allocate();
        let mut entry = Submission::new();
        if let Err(error) = entry.prepare_send(&mut event, socket, context.handle(), data, options)
        {
            self.event_pool.recycle(event);
            return Err(error);
        }
        self.submit_event(&context, entry, event, self.mode_for(self.config.send_mode))
    }

    /// Start an asynchronous receive into `blob`. The blob is retained
    /// by the event until the completion is processed.
    pub fn receive(
        &self,
        socket: &Arc<dyn ProactorSocket>,
        blob: Blob,
        options: &ReceiveOptions,
    ) -> Result<()> {
        let context = self.context_of(socket)?;
        let mut event = self.event_pool.allocate();
        let mut entry = Submission::new();
        if let Err(error) =
            entry.prepare_receive(&mut event, socket, context.handle(), blob, options)
        {
            self.event_pool.recycle(event);
            return Err(error);
        }
        self.submit_event(&context, entry, event, self.mode_for(self.config.receive_mode))
    }

    /// Issue the OS-level half-close. Dispatches no events.
    pub fn shutdown(&self, socket: &Arc<dyn ProactorSocket>, direction: ShutdownType) -> Result<()> {
        let context = self.context_of(socket)?;
        let rc = unsafe { libc::shutdown(context.handle(), direction.sys_how()) };
        if rc != 0 {
            let error = Error::last_os_error();
            // Shutting down an unconnected datagram socket reports
            // ENOTCONN; that is not actionable for the caller.
            if error != Error::Os(libc::ENOTCONN) && error != Error::Invalid {
                return Err(error);
            }
        }
        Ok(())
    }

    /// Request cancellation of every operation outstanding on `socket`.
    ///
    /// Cooperative: returns once the cancel records are submitted; each
    /// affected operation still produces exactly one completion.
    pub fn cancel(&self, socket: &Arc<dyn ProactorSocket>) -> Result<()> {
        let context = self.context_of(socket)?;

        if self.device.supports_cancel_by_handle() {
            let mut entry = Submission::new();
            entry.prepare_cancel_by_handle(context.handle());
            self.device.submit(&entry, SubmitMode::Immediate)?;
            return Ok(());
        }

        // Without cancel-by-descriptor each pending event is cancelled
        // individually. The status transition happens under the pending
        // set lock, which excludes the dispatch path from reclaiming the
        // event boxes while they are inspected here.
        let mut records = Vec::new();
        context.drain_pending(|user_data| {
            let pending = unsafe { event::borrow_user_data(user_data) };
            if !pending.transition(EventStatus::Pending, EventStatus::Cancelled) {
                return;
            }
            let mut entry = Submission::new();
            entry.prepare_cancel_by_event(user_data);
            records.push(entry);
        });

        for entry in records {
            self.device.submit(&entry, SubmitMode::Immediate)?;
        }
        Ok(())
    }

    /// Detach `socket`: cancel outstanding work, stop tracking the
    /// handle, and announce detachment once in-flight completions
    /// drain. Subsequent operations on the socket are rejected.
    pub fn detach_socket(&self, socket: &Arc<dyn ProactorSocket>) -> Result<()> {
        let context = self.context_of(socket)?;

        let _ = self.cancel(socket);

        set_blocking(context.handle(), false).ok();

        {
            let mut sockets = self.sockets.write().unwrap();
            if sockets.remove(&context.handle()).is_none() {
                return Err(Error::Invalid);
            }
        }

        match context.detach()? {
            true => {
                socket.set_proactor_context(None);
                let socket = Arc::clone(socket);
                self.execute(move || socket.process_detached());
            }
            false => {
                // The waiter that processes the final completion
                // finishes the transition and announces.
                trace!("detach of {} deferred to drain", context.handle());
            }
        }
        Ok(())
    }

    pub fn num_sockets(&self) -> usize {
        self.sockets.read().unwrap().len()
    }

    // ── Waiter loop ─────────────────────────────────────────────────

    /// Run until `stop()`: wait for completions, dispatch them, then
    /// announce timers and deferred functors.
    pub fn run(&self, waiter: &mut Waiter) {
        while self.run.load(Ordering::Acquire) {
            self.poll(waiter);
        }
    }

    /// One wait-dispatch-announce cycle.
    pub fn poll(&self, waiter: &mut Waiter) {
        self.wait(waiter);

        let mut cycles = self.config.max_cycles_per_wait;
        while cycles != 0 {
            if !self.chronology.has_any_scheduled_or_deferred() {
                break;
            }
            self.chronology.announce(Instant::now());
            cycles -= 1;
        }
    }

    fn wait(&self, waiter: &mut Waiter) {
        let gated = self.config.max_threads > 1;
        if gated {
            self.semaphore.wait();
            if !self.run.load(Ordering::Acquire) {
                self.semaphore.post();
                return;
            }
        }

        let earliest = self.chronology.earliest();
        let count = match self
            .device
            .wait(&mut waiter.state, &mut waiter.buffer, 1, earliest)
        {
            Ok(count) => count,
            Err(error) => {
                if error != Error::Os(libc::EINTR) {
                    warn!("ring wait failed: {}", error);
                    // Do not spin hot if the ring is persistently sick.
                    thread::sleep(std::time::Duration::from_millis(1));
                }
                0
            }
        };

        if gated {
            self.semaphore.post();
        }

        for index in 0..count {
            let entry = waiter.buffer[index];
            self.process_completion(&entry);
        }
    }

    /// Interrupt one blocked waiter by submitting a no-op completion.
    pub fn interrupt_one(&self) {
        if self.is_waiter() {
            return;
        }
        if self.interrupts_pending.load(Ordering::Acquire) != 0 {
            return;
        }
        self.post_interrupt();
    }

    /// Interrupt every blocked waiter.
    pub fn interrupt_all(&self) {
        let pending = self.interrupts_pending.load(Ordering::Acquire);

        let target = if self.config.max_threads <= 1 {
            if self.is_waiter() {
                return;
            }
            1
        } else {
            self.num_waiters()
        };

        for _ in pending..target {
            self.post_interrupt();
        }
    }

    fn post_interrupt(&self) {
        self.interrupts_pending.fetch_add(1, Ordering::AcqRel);

        let mut event = self.event_pool.allocate();
        let mut entry = Submission::new();

        let pending = Arc::clone(&self.interrupts_pending);
        entry.prepare_callback(
            &mut event,
            Box::new(move || {
                pending.fetch_sub(1, Ordering::AcqRel);
            }),
        );

        let user_data = event::into_user_data(event);
        entry.set_user_data(user_data);

        if let Err(error) = self.device.submit(&entry, SubmitMode::Immediate) {
            warn!("interrupt submission failed: {}", error);
            self.interrupts_pending.fetch_sub(1, Ordering::AcqRel);
            let event = unsafe { event::from_user_data(user_data) };
            self.event_pool.recycle(event);
        }
    }

    /// Stop every waiter loop and wake the blocked ones.
    pub fn stop(&self) {
        self.run.store(false, Ordering::Release);
        self.interrupt_all();
    }

    /// Re-arm after `stop()`.
    pub fn restart(&self) {
        self.run.store(true, Ordering::Release);
    }

    // ── Completion dispatch ─────────────────────────────────────────

    fn process_completion(&self, entry: &Completion) {
        // Timer and cancel records carry no event.
        if entry.user_data() == 0 {
            return;
        }

        trace!("completion {:?}", entry);

        // The first half of a zero-copy send: the kernel still owns the
        // user data until the notification arrives, so dispatch without
        // reclaiming the event.
        if entry.is_more() {
            self.dispatch_zero_copy_send(entry);
            return;
        }

        let track = !self.device.supports_cancel_by_handle();

        // Inspect the event and settle bookkeeping before reclaiming
        // the box; `note_completed` takes the pending-set lock, which
        // orders this against a concurrent `cancel`.
        let (socket, detach_finished) = {
            let pending = unsafe { event::borrow_user_data(entry.user_data()) };
            let socket = pending.socket.as_ref().and_then(|weak| weak.upgrade());
            let detach_finished = match socket
                .as_ref()
                .and_then(|socket| self.raw_context_of(socket.as_ref()))
            {
                Some(context) => context.note_completed(entry.user_data(), track),
                None => false,
            };
            (socket, detach_finished)
        };

        let mut event = unsafe { event::from_user_data(entry.user_data()) };

        if entry.is_notification() {
            // The deferred completion of a zero-copy send.
            if let Some(socket) = &socket {
                let socket = Arc::clone(socket);
                socket.process_zero_copy(event.user, entry.zero_copy_copied());
            }
            self.finish_event(event, socket, detach_finished);
            return;
        }

        // Previously cancelled by `cancel` on an old kernel: the
        // completion is discarded silently; the socket already settled
        // the caller's callback.
        if event.status() == EventStatus::Cancelled {
            trace!("event {:p} discarded after cancellation", &*event);
            self.finish_event(event, socket, detach_finished);
            return;
        }

        debug_assert_eq!(event.status(), EventStatus::Pending);

        let result: Result<u64> = if entry.has_failed() {
            event.error = Some(entry.error());
            if entry.was_cancelled() {
                event.set_status(EventStatus::Cancelled);
            } else {
                event.set_status(EventStatus::Failed);
            }
            Err(entry.error())
        } else {
            event.set_status(EventStatus::Complete);
            Ok(entry.value())
        };

        match socket {
            Some(socket) => self.dispatch_event(&mut event, socket.clone(), result),
            None => {
                // Callback events have no socket by design.
                if event.event_type == EventType::Callback {
                    if result.is_ok() {
                        if let Some(function) = event.function.take() {
                            function();
                        }
                    }
                } else {
                    trace!("completion for a vanished socket ignored");
                }
            }
        }

        self.finish_event(event, None, detach_finished);
    }

    fn dispatch_event(&self, event: &mut Event, socket: Arc<dyn ProactorSocket>, result: Result<u64>) {
        match event.event_type {
            EventType::Callback => {
                if result.is_ok() {
                    if let Some(function) = event.function.take() {
                        function();
                    }
                }
            }
            EventType::Accept => match result {
                Ok(value) => {
                    event.target = value as RawFd;
                    event.bytes_completed = 0;
                    socket.process_accepted(Ok(event.target));
                }
                Err(error) => socket.process_accepted(Err(error)),
            },
            EventType::Connect => match result {
                Ok(_) => {
                    // The completion only proves the operation ran; the
                    // socket error slot carries the actual verdict.
                    match last_socket_error(socket.handle()) {
                        Ok(()) => socket.process_connected(Ok(())),
                        Err(error) => socket.process_connected(Err(error)),
                    }
                }
                Err(error) => socket.process_connected(Err(error)),
            },
            EventType::Send => {
                let mut context = SendContext {
                    bytes_sendable: event.bytes_attempted,
                    bytes_sent: 0,
                    zero_copy: event.zero_copy,
                };
                match result {
                    Ok(value) => {
                        event.bytes_completed = value;
                        context.bytes_sent = value;
                        socket.process_sent(Ok(()), context);
                    }
                    Err(error) => socket.process_sent(Err(error), context),
                }
            }
            EventType::Receive => {
                let mut context = ReceiveContext {
                    bytes_receivable: event.bytes_attempted,
                    ..Default::default()
                };
                match result {
                    Ok(value) => {
                        event.bytes_completed = value;
                        context.bytes_received = value;

                        let mut blob = event.receive_blob.take();
                        if let Some(blob) = blob.as_mut() {
                            // The kernel wrote `value` bytes into the
                            // writable region handed to it.
                            unsafe { blob.commit(value as usize) };
                        }

                        if event.message.msg_namelen > 0 {
                            context.endpoint =
                                Endpoint::decode(&event.address, event.message.msg_namelen).ok();
                        }

                        let control = event.parse_control();
                        context.foreign_handle = control.foreign_handle;
                        context.timestamp = control.timestamp;

                        socket.process_received(Ok(()), blob, context);
                    }
                    Err(error) => {
                        socket.process_received(Err(error), event.receive_blob.take(), context);
                    }
                }
            }
        }
    }

    /// Dispatch the result half of a zero-copy send whose notification
    /// is still outstanding.
    fn dispatch_zero_copy_send(&self, entry: &Completion) {
        let pending = unsafe { event::borrow_user_data(entry.user_data()) };
        debug_assert_eq!(pending.event_type, EventType::Send);

        let Some(socket) = pending.socket.as_ref().and_then(|weak| weak.upgrade()) else {
            return;
        };

        let mut context = SendContext {
            bytes_sendable: pending.bytes_attempted,
            bytes_sent: 0,
            zero_copy: true,
        };

        if entry.has_failed() {
            if pending.transition(EventStatus::Pending, EventStatus::Failed) {
                socket.process_sent(Err(entry.error()), context);
            }
        } else if pending.transition(EventStatus::Pending, EventStatus::Complete) {
            context.bytes_sent = entry.value();
            socket.process_sent(Ok(()), context);
        }
    }

    fn finish_event(
        &self,
        event: Box<Event>,
        socket: Option<Arc<dyn ProactorSocket>>,
        detach_finished: bool,
    ) {
        let socket = socket.or_else(|| event.socket.as_ref().and_then(|weak| weak.upgrade()));
        self.event_pool.recycle(event);

        if detach_finished {
            if let Some(socket) = socket {
                socket.set_proactor_context(None);
                self.chronology.execute(move || socket.process_detached());
            }
        }
    }

    // ── Internals ───────────────────────────────────────────────────

    fn mode_for(&self, configured: SubmitMode) -> SubmitMode {
        // Only waiter threads may defer: anyone else must enter the
        // kernel so the work is seen without waiting for the next wait.
        if self.is_waiter() {
            configured
        } else {
            SubmitMode::Immediate
        }
    }

    fn context_of(&self, socket: &Arc<dyn ProactorSocket>) -> Result<Arc<SocketContext>> {
        self.raw_context_of(socket.as_ref()).ok_or(Error::Invalid)
    }

    fn raw_context_of(&self, socket: &dyn ProactorSocket) -> Option<Arc<SocketContext>> {
        socket
            .proactor_context()
            .and_then(|any| any.downcast::<SocketContext>().ok())
    }

    fn submit_event(
        &self,
        context: &SocketContext,
        mut entry: Submission,
        event: Box<Event>,
        mode: SubmitMode,
    ) -> Result<()> {
        let track = !self.device.supports_cancel_by_handle();

        let user_data = event::into_user_data(event);
        entry.set_user_data(user_data);

        if let Err(error) = context.note_submitted(user_data, track) {
            let event = unsafe { event::from_user_data(user_data) };
            self.event_pool.recycle(event);
            return Err(error);
        }

        if let Err(error) = self.device.submit(&entry, mode) {
            context.forget_submitted(user_data, track);
            let event = unsafe { event::from_user_data(user_data) };
            self.event_pool.recycle(event);
            return Err(error);
        }

        Ok(())
    }
}

impl Drop for Proactor {
    fn drop(&mut self) {
        // Reap whatever completions are still sitting in the ring so
        // their event boxes are returned rather than leaked.
        let mut buffer = [Completion::default(); COMPLETION_BATCH];
        loop {
            let count = self.device.flush(&mut buffer);
            if count == 0 {
                break;
            }
            for entry in &buffer[..count] {
                if entry.user_data() == 0 || entry.is_more() {
                    continue;
                }
                let event = unsafe { event::from_user_data(entry.user_data()) };
                drop(event);
            }
        }
    }
}

/// Toggle a descriptor's blocking mode.
fn set_blocking(handle: RawFd, blocking: bool) -> Result<()> {
    let flags = unsafe { libc::fcntl(handle, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os_error());
    }
    let updated = if blocking {
        flags & !libc::O_NONBLOCK
    } else {
        flags | libc::O_NONBLOCK
    };
    if updated != flags {
        let rc = unsafe { libc::fcntl(handle, libc::F_SETFL, updated) };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

/// Drain a socket's error slot (`SO_ERROR`).
fn last_socket_error(handle: RawFd) -> Result<()> {
    let mut error: libc::c_int = 0;
    let mut length = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            handle,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut libc::c_int as *mut libc::c_void,
            &mut length,
        )
    };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    if error != 0 {
        return Err(Error::from_errno(error));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;

    struct RecordingSocket {
        handle: RawFd,
        context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
        received: Mutex<Vec<Vec<u8>>>,
        sent: AtomicUsize,
        detached: AtomicUsize,
    }

    impl RecordingSocket {
        fn new(handle: RawFd) -> Arc<Self> {
            Arc::new(Self {
                handle,
                context: Mutex::new(None),
                received: Mutex::new(Vec::new()),
                sent: AtomicUsize::new(0),
                detached: AtomicUsize::new(0),
            })
        }
    }

    impl ProactorSocket for RecordingSocket {
        fn handle(&self) -> RawFd {
            self.handle
        }
        fn set_proactor_context(&self, context: Option<Arc<dyn Any + Send + Sync>>) {
            *self.context.lock().unwrap() = context;
        }
        fn proactor_context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
            self.context.lock().unwrap().clone()
        }
        fn process_sent(self: Arc<Self>, result: Result<()>, context: SendContext) {
            if result.is_ok() {
                assert_eq!(context.bytes_sent, context.bytes_sendable);
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
        fn process_received(
            self: Arc<Self>,
            result: Result<()>,
            blob: Option<Blob>,
            _context: ReceiveContext,
        ) {
            if result.is_ok() {
                if let Some(blob) = blob {
                    self.received.lock().unwrap().push(blob.as_slice().to_vec());
                }
            }
        }
        fn process_detached(self: Arc<Self>) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn udp_socket() -> RawFd {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        assert!(fd >= 0);
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = u32::from_ne_bytes([127, 0, 0, 1]);
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);
        fd
    }

    fn try_proactor() -> Option<Arc<Proactor>> {
        if !RingDevice::is_supported() {
            return None;
        }
        match Proactor::new(ProactorConfig::default()) {
            Ok(proactor) => Some(proactor),
            Err(error) => {
                eprintln!("skipping proactor test: {}", error);
                None
            }
        }
    }

    #[test]
    fn test_attach_rejects_duplicates_and_bad_handles() {
        let Some(proactor) = try_proactor() else { return };

        let bad: Arc<dyn ProactorSocket> = RecordingSocket::new(-1);
        assert_eq!(proactor.attach_socket(&bad), Err(Error::Invalid));

        let fd = udp_socket();
        let socket: Arc<dyn ProactorSocket> = RecordingSocket::new(fd);
        proactor.attach_socket(&socket).unwrap();
        assert_eq!(proactor.num_sockets(), 1);

        let twin: Arc<dyn ProactorSocket> = RecordingSocket::new(fd);
        assert_eq!(proactor.attach_socket(&twin), Err(Error::Invalid));

        proactor.detach_socket(&socket).unwrap();
        assert_eq!(proactor.num_sockets(), 0);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_echo_between_two_sockets() {
        let Some(proactor) = try_proactor() else { return };

        let fd_a = udp_socket();
        let fd_b = udp_socket();
        let endpoint_b = Endpoint::source_of(fd_b).unwrap();

        let a = RecordingSocket::new(fd_a);
        let b = RecordingSocket::new(fd_b);
        let socket_a: Arc<dyn ProactorSocket> = a.clone();
        let socket_b: Arc<dyn ProactorSocket> = b.clone();
        proactor.attach_socket(&socket_a).unwrap();
        proactor.attach_socket(&socket_b).unwrap();

        proactor
            .receive(
                &socket_b,
                Blob::with_capacity(2048),
                &ReceiveOptions::default(),
            )
            .unwrap();

        let options = SendOptions {
            endpoint: Some(endpoint_b),
            ..Default::default()
        };
        proactor
            .send(
                &socket_a,
                Data::Bytes(Arc::new(b"ping".to_vec())),
                &options,
            )
            .unwrap();

        let mut waiter = proactor.register_waiter();
        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        while Instant::now() < deadline {
            proactor.poll(&mut waiter);
            if !b.received.lock().unwrap().is_empty() {
                break;
            }
        }

        assert_eq!(a.sent.load(Ordering::SeqCst), 1);
        assert_eq!(b.received.lock().unwrap().as_slice(), &[b"ping".to_vec()]);

        proactor.deregister_waiter(waiter);
        proactor.detach_socket(&socket_a).unwrap();
        proactor.detach_socket(&socket_b).unwrap();
        unsafe {
            libc::close(fd_a);
            libc::close(fd_b);
        }
    }

    #[test]
    fn test_detach_announces_via_chronology() {
        let Some(proactor) = try_proactor() else { return };

        let fd = udp_socket();
        let recording = RecordingSocket::new(fd);
        let socket: Arc<dyn ProactorSocket> = recording.clone();
        proactor.attach_socket(&socket).unwrap();
        proactor.detach_socket(&socket).unwrap();

        // The announcement is deferred to an announcement cycle.
        proactor.chronology().announce(Instant::now());
        assert_eq!(recording.detached.load(Ordering::SeqCst), 1);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_interrupt_counter_does_not_flood() {
        let Some(proactor) = try_proactor() else { return };
        proactor.interrupt_one();
        proactor.interrupt_one();
        assert!(proactor.interrupts_pending.load(Ordering::SeqCst) <= 1);

        // Drain the nop so the counter settles.
        let mut waiter = proactor.register_waiter();
        proactor.poll(&mut waiter);
        assert_eq!(proactor.interrupts_pending.load(Ordering::SeqCst), 0);
        proactor.deregister_waiter(waiter);
    }
}
