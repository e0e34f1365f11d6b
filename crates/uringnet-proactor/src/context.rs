//! Per-socket proactor state: handle, detachment machine, pending set.
//!
//! # Detachment protocol
//!
//! Detaching a socket must not race in-flight completions. The context
//! counts outstanding operations; `detach()` transitions Idle →
//! Initiated and completes immediately only when nothing is
//! outstanding. Otherwise the waiter thread that processes the last
//! outstanding completion observes the Initiated state, performs the
//! Initiated → Detached transition, and announces detachment.
//!
//! # Pending set
//!
//! On kernels without cancel-by-descriptor, cancelling a socket means
//! cancelling each outstanding event individually, so the context also
//! records the user-data value of every accepted submission from push
//! until its completion returns.

use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

use uringnet_core::error::{Error, Result};

/// What happens to the OS handle once the socket is detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DetachGoal {
    /// Release the descriptor via the OS.
    Close = 0,
    /// Hand the descriptor back to the caller.
    Export = 1,
}

/// Where the context is in the detachment protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DetachMode {
    Idle = 0,
    Initiated = 1,
    Detached = 2,
}

impl DetachMode {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DetachMode::Idle,
            1 => DetachMode::Initiated,
            _ => DetachMode::Detached,
        }
    }
}

pub struct SocketContext {
    handle: RawFd,
    mode: AtomicU8,
    goal: AtomicU8,
    /// Accepted submissions whose completions have not returned yet.
    outstanding: AtomicU32,
    /// User-data values of outstanding events; maintained only on
    /// kernels lacking cancel-by-descriptor.
    pending: Mutex<HashSet<u64>>,
}

impl SocketContext {
    pub fn new(handle: RawFd) -> Self {
        debug_assert!(handle >= 0);
        Self {
            handle,
            mode: AtomicU8::new(DetachMode::Idle as u8),
            goal: AtomicU8::new(DetachGoal::Close as u8),
            outstanding: AtomicU32::new(0),
            pending: Mutex::new(HashSet::new()),
        }
    }

    pub fn handle(&self) -> RawFd {
        self.handle
    }

    pub fn mode(&self) -> DetachMode {
        DetachMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn goal(&self) -> DetachGoal {
        if self.goal.load(Ordering::Acquire) == DetachGoal::Export as u8 {
            DetachGoal::Export
        } else {
            DetachGoal::Close
        }
    }

    pub fn set_goal(&self, goal: DetachGoal) {
        self.goal.store(goal as u8, Ordering::Release);
    }

    /// Whether operations may still be started through this context.
    pub fn is_attached(&self) -> bool {
        self.mode() == DetachMode::Idle
    }

    /// Record an accepted submission. `user_data` lands in the pending
    /// set only when `track` is set (kernels lacking cancel-by-fd).
    pub fn note_submitted(&self, user_data: u64, track: bool) -> Result<()> {
        if !self.is_attached() {
            return Err(Error::Invalid);
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if track {
            let inserted = self.pending.lock().unwrap().insert(user_data);
            if !inserted {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
                return Err(Error::Invalid);
            }
        }
        Ok(())
    }

    /// Roll back `note_submitted` after a failed push.
    pub fn forget_submitted(&self, user_data: u64, track: bool) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if track {
            self.pending.lock().unwrap().remove(&user_data);
        }
    }

    /// Record a returned completion. Returns true when this was the last
    /// outstanding operation of an initiated detachment, in which case
    /// the caller announces detachment.
    pub fn note_completed(&self, user_data: u64, track: bool) -> bool {
        if track {
            self.pending.lock().unwrap().remove(&user_data);
        }
        let before = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0);
        if before == 1 {
            return self.try_finish_detach();
        }
        false
    }

    /// Snapshot (and optionally clear) the pending set.
    pub fn load_pending(&self, remove: bool) -> Vec<u64> {
        let mut pending = self.pending.lock().unwrap();
        let list: Vec<u64> = pending.iter().copied().collect();
        if remove {
            pending.clear();
        }
        list
    }

    /// Visit every pending user-data value under the set's lock, then
    /// clear the set. Holding the lock across the visit excludes the
    /// completion path from reclaiming the visited events
    /// (`note_completed` takes the same lock before the event box is
    /// reclaimed).
    pub fn drain_pending<F: FnMut(u64)>(&self, mut visit: F) {
        let mut pending = self.pending.lock().unwrap();
        for user_data in pending.iter().copied() {
            visit(user_data);
        }
        pending.clear();
    }

    /// Begin detachment. `Ok(true)` means the context is already
    /// drained and detachment completed synchronously; `Ok(false)` means
    /// the last completion processor will finish it.
    pub fn detach(&self) -> Result<bool> {
        let exchanged = self.mode.compare_exchange(
            DetachMode::Idle as u8,
            DetachMode::Initiated as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if exchanged.is_err() {
            return Err(Error::Invalid);
        }

        if self.outstanding.load(Ordering::Acquire) == 0 {
            return Ok(self.try_finish_detach());
        }
        Ok(false)
    }

    fn try_finish_detach(&self) -> bool {
        self.mode
            .compare_exchange(
                DetachMode::Initiated as u8,
                DetachMode::Detached as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detach_without_outstanding_completes_now() {
        let context = SocketContext::new(5);
        assert!(context.is_attached());
        assert_eq!(context.detach().unwrap(), true);
        assert_eq!(context.mode(), DetachMode::Detached);
        assert_eq!(context.detach(), Err(Error::Invalid));
    }

    #[test]
    fn test_detach_waits_for_outstanding() {
        let context = SocketContext::new(5);
        context.note_submitted(100, true).unwrap();
        context.note_submitted(200, true).unwrap();

        assert_eq!(context.detach().unwrap(), false);
        assert_eq!(context.mode(), DetachMode::Initiated);

        assert!(!context.note_completed(100, true));
        assert!(context.note_completed(200, true));
        assert_eq!(context.mode(), DetachMode::Detached);
    }

    #[test]
    fn test_submissions_rejected_after_detach() {
        let context = SocketContext::new(5);
        context.detach().unwrap();
        assert_eq!(context.note_submitted(1, false), Err(Error::Invalid));
    }

    #[test]
    fn test_pending_set_round_trip() {
        let context = SocketContext::new(5);
        context.note_submitted(10, true).unwrap();
        context.note_submitted(20, true).unwrap();
        assert_eq!(context.note_submitted(10, true), Err(Error::Invalid));

        let mut pending = context.load_pending(true);
        pending.sort_unstable();
        assert_eq!(pending, vec![10, 20]);
        assert!(context.load_pending(false).is_empty());
    }

    #[test]
    fn test_goal_defaults_to_close() {
        let context = SocketContext::new(5);
        assert_eq!(context.goal(), DetachGoal::Close);
        context.set_goal(DetachGoal::Export);
        assert_eq!(context.goal(), DetachGoal::Export);
    }
}
