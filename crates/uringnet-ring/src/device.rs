//! The ring device: one io_uring instance and its two queues.

use std::os::unix::io::RawFd;
use std::time::Instant;

use log::{debug, warn};
use uringnet_core::error::{Error, Result};

use crate::completion::Completion;
use crate::config::{RingCapabilities, RingConfig};
use crate::cqueue::CompletionQueue;
use crate::probe::RingProbe;
use crate::squeue::SubmissionQueue;
use crate::submission::{SubmitMode, Submission};
use crate::sys::{self, KernelTimespec};

/// Per-waiter storage a blocking `wait` needs to keep alive across the
/// enter system call.
#[derive(Default)]
pub struct WaitState {
    /// Deadline storage for the pre-submitted timeout record used on
    /// kernels without extended-argument enter.
    timespec: libc::timespec,
}

/// One io_uring instance: the ring descriptor, both memory-mapped
/// queues, the kernel's configuration answer, and the probed opcode
/// table.
pub struct RingDevice {
    ring: RawFd,
    config: RingConfig,
    probe: RingProbe,
    capabilities: RingCapabilities,
    squeue: SubmissionQueue,
    cqueue: CompletionQueue,
}

impl RingDevice {
    /// Create a ring with a suggested `queue_depth`, map both queues,
    /// and probe the kernel's opcode support.
    pub fn new(queue_depth: u32) -> Result<Self> {
        let mut params = sys::RingParams::default();
        let ring = sys::setup(queue_depth, &mut params);
        if ring < 0 {
            let error = Error::last_os_error();
            warn!("ring setup failed: {}", error);
            return Err(error);
        }

        let config = RingConfig::new(params);

        let mut probe = RingProbe::default();
        if let Err(error) = probe.load(ring) {
            // Ancient kernels lack the probe; everything reads as
            // unsupported and optional opcodes stay unused.
            warn!("ring probe failed: {}", error);
        }

        let squeue = match SubmissionQueue::map(ring, &config) {
            Ok(queue) => queue,
            Err(error) => {
                unsafe { libc::close(ring) };
                return Err(error);
            }
        };
        let cqueue = match CompletionQueue::map(ring, &config) {
            Ok(queue) => queue,
            Err(error) => {
                unsafe { libc::close(ring) };
                return Err(error);
            }
        };

        let capabilities = RingCapabilities::detect();

        debug!(
            "ring {} created: sq {} cq {} features {:?} cancel-by-handle {}",
            ring,
            config.submission_queue_capacity(),
            config.completion_queue_capacity(),
            config.features(),
            capabilities.cancel_by_handle,
        );

        Ok(Self {
            ring,
            config,
            probe,
            capabilities,
            squeue,
            cqueue,
        })
    }

    /// Whether the running kernel offers io_uring at all.
    pub fn is_supported() -> bool {
        sys::is_supported()
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    /// Push one record toward the kernel.
    pub fn submit(&self, entry: &Submission, mode: SubmitMode) -> Result<()> {
        self.squeue.push(entry, mode)
    }

    /// Block until completions are available or `deadline` passes.
    ///
    /// Pops up to `result.len()` records. Returns `Ok(0)` on timeout;
    /// surfaces any other enter failure.
    pub fn wait(
        &self,
        state: &mut WaitState,
        result: &mut [Completion],
        min_complete: u32,
        deadline: Option<Instant>,
    ) -> Result<usize> {
        if self.config.supports_enter_timeout() {
            loop {
                let count = self.cqueue.pop(result);
                if count != 0 {
                    return Ok(count);
                }

                let to_submit = self.squeue.gather();
                let rc = match deadline {
                    Some(deadline) => {
                        let duration = deadline.saturating_duration_since(Instant::now());
                        let timespec = KernelTimespec {
                            tv_sec: duration.as_secs() as i64,
                            tv_nsec: duration.subsec_nanos() as i64,
                        };
                        sys::enter_timed(self.ring, to_submit, min_complete, &timespec)
                    }
                    None => sys::enter(self.ring, to_submit, min_complete),
                };

                if rc < 0 {
                    let errno = unsafe { *libc::__errno_location() };
                    if errno == libc::ETIME {
                        return Ok(0);
                    }
                    return Err(Error::from_errno(errno));
                }
            }
        } else {
            loop {
                let count = self.cqueue.pop(result);
                if count != 0 {
                    // A lone timeout record completes with null user
                    // data; report it as a timeout.
                    if count == 1 && result[0].user_data() == 0 {
                        return Ok(0);
                    }
                    return Ok(count);
                }

                if let Some(deadline) = deadline {
                    let mut entry = Submission::new();
                    entry.prepare_timeout(&mut state.timespec, deadline);
                    self.submit(&entry, SubmitMode::Deferred)?;
                }

                let to_submit = self.squeue.gather();
                let rc = sys::enter(self.ring, to_submit, min_complete);
                if rc < 0 {
                    let errno = unsafe { *libc::__errno_location() };
                    if errno == libc::ETIME {
                        return Ok(0);
                    }
                    return Err(Error::from_errno(errno));
                }
            }
        }
    }

    /// Pop whatever completions are already available, without entering
    /// the kernel.
    pub fn flush(&self, result: &mut [Completion]) -> usize {
        self.cqueue.pop(result)
    }

    /// Whether the kernel implements `operation`.
    pub fn supports_operation(&self, operation: u8) -> bool {
        self.probe.is_supported(operation)
    }

    /// Whether one cancel record can target every operation on a
    /// descriptor.
    pub fn supports_cancel_by_handle(&self) -> bool {
        self.capabilities.cancel_by_handle
    }

    pub fn supports_enter_timeout(&self) -> bool {
        self.config.supports_enter_timeout()
    }

    pub fn supports_completion_queue_overflow(&self) -> bool {
        self.config.supports_completion_queue_overflow()
    }

    pub fn supports_native_workers(&self) -> bool {
        self.config.supports_native_workers()
    }

    pub fn submission_queue_head(&self) -> u32 {
        self.squeue.head()
    }

    pub fn submission_queue_tail(&self) -> u32 {
        self.squeue.tail()
    }

    pub fn submission_queue_capacity(&self) -> u32 {
        self.squeue.capacity()
    }

    pub fn completion_queue_head(&self) -> u32 {
        self.cqueue.head()
    }

    pub fn completion_queue_tail(&self) -> u32 {
        self.cqueue.tail()
    }

    pub fn completion_queue_capacity(&self) -> u32 {
        self.cqueue.capacity()
    }
}

impl Drop for RingDevice {
    fn drop(&mut self) {
        // The queue mappings unmap themselves; the descriptor closes
        // last.
        unsafe {
            libc::close(self.ring);
        }
        debug!("ring {} closed", self.ring);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uringnet_core::event::{self, EventPool, EventStatus};

    fn try_device() -> Option<RingDevice> {
        if !RingDevice::is_supported() {
            return None;
        }
        match RingDevice::new(32) {
            Ok(device) => Some(device),
            Err(error) => {
                // Constrained environments (containers, seccomp) may
                // refuse ring creation; nothing to exercise then.
                eprintln!("skipping ring device test: {}", error);
                None
            }
        }
    }

    #[test]
    fn test_nop_round_trip() {
        let Some(device) = try_device() else { return };

        let pool = EventPool::new(4);
        let fired = Arc::new(AtomicUsize::new(0));

        let mut event = pool.allocate();
        let mut entry = Submission::new();
        let fired_clone = Arc::clone(&fired);
        entry.prepare_callback(&mut event, Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));
        let user_data = event::into_user_data(event);
        entry.set_user_data(user_data);

        device.submit(&entry, SubmitMode::Immediate).unwrap();

        let mut state = WaitState::default();
        let mut completions = [Completion::default(); 8];
        let count = device
            .wait(&mut state, &mut completions, 1, None)
            .unwrap();
        assert!(count >= 1);

        let popped = completions[..count]
            .iter()
            .find(|c| c.user_data() == user_data)
            .expect("nop completion");
        assert!(!popped.has_failed());

        let mut event = unsafe { event::from_user_data(user_data) };
        assert_eq!(event.status(), EventStatus::Pending);
        if let Some(function) = event.function.take() {
            function();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        pool.recycle(event);
    }

    #[test]
    fn test_wait_times_out() {
        let Some(device) = try_device() else { return };

        let mut state = WaitState::default();
        let mut completions = [Completion::default(); 4];
        let started = Instant::now();
        let count = device
            .wait(
                &mut state,
                &mut completions,
                1,
                Some(Instant::now() + std::time::Duration::from_millis(50)),
            )
            .unwrap();
        assert_eq!(count, 0);
        assert!(started.elapsed() >= std::time::Duration::from_millis(40));
    }

    #[test]
    fn test_capability_queries_consistent() {
        let Some(device) = try_device() else { return };
        assert!(device.supports_operation(sys::op::NOP));
        assert!(device.submission_queue_capacity() >= 32);
        assert!(device.completion_queue_capacity() >= device.submission_queue_capacity());
        let _ = device.supports_cancel_by_handle();
        let _ = device.supports_enter_timeout();
        let _ = device.supports_completion_queue_overflow();
        let _ = device.supports_native_workers();
    }

}
