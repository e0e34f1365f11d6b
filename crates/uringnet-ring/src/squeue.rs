//! The memory-mapped submission queue.
//!
//! The submission ring region holds the kernel-shared head, tail, mask,
//! and ring-entries words plus a parallel index array; the 64-byte entry
//! array is a second mapping of its own. The process is the producer:
//! it writes an entry and its index slot, then publishes the new tail
//! with release semantics; the kernel consumes from the head with
//! acquire semantics.
//!
//! A `pending` counter accumulates entries pushed but not yet handed to
//! `io_uring_enter`; `gather()` atomically claims them when an enter is
//! about to happen.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use log::{trace, warn};
use uringnet_core::error::{Error, Result};

use crate::config::RingConfig;
use crate::mmap::MemoryMap;
use crate::submission::{SubmitMode, Submission};
use crate::sys;

pub struct SubmissionQueue {
    /// Serializes producers; the kernel-shared words need no lock between
    /// one producer and the kernel, but two producers must not claim the
    /// same tail slot.
    mutex: Mutex<()>,
    ring: libc::c_int,
    pending: AtomicU32,

    // Mappings kept alive for the pointers below; unmapped on drop.
    _ring_map: MemoryMap,
    _entry_map: MemoryMap,

    head: *const AtomicU32,
    tail: *const AtomicU32,
    mask: *const u32,
    ring_entries: *const u32,
    array: *mut u32,
    entries: *mut Submission,
}

// The raw pointers target the two mappings owned by this struct; access
// is synchronized by `mutex` and by the atomic head/tail protocol.
unsafe impl Send for SubmissionQueue {}
unsafe impl Sync for SubmissionQueue {}

impl SubmissionQueue {
    /// Map the submission ring of `ring` according to `config`.
    pub fn map(ring: libc::c_int, config: &RingConfig) -> Result<Self> {
        let offsets = &config.params().sq_off;

        let ring_map = MemoryMap::map(ring, sys::OFF_SQ_RING, config.submission_ring_length())?;
        let entry_map = MemoryMap::map(ring, sys::OFF_SQES, config.submission_array_length())?;

        unsafe {
            Ok(Self {
                mutex: Mutex::new(()),
                ring,
                pending: AtomicU32::new(0),
                head: ring_map.offset_as::<AtomicU32>(offsets.head as usize),
                tail: ring_map.offset_as::<AtomicU32>(offsets.tail as usize),
                mask: ring_map.offset_as::<u32>(offsets.ring_mask as usize),
                ring_entries: ring_map.offset_as::<u32>(offsets.ring_entries as usize),
                array: ring_map.offset_as::<u32>(offsets.array as usize),
                entries: entry_map.base() as *mut Submission,
                _ring_map: ring_map,
                _entry_map: entry_map,
            })
        }
    }

    /// Push one record.
    ///
    /// In `Immediate` mode the kernel is entered with everything gathered
    /// so far. When the ring is full in either mode, the kernel is
    /// entered to drain the ring and the push retries.
    pub fn push(&self, entry: &Submission, mode: SubmitMode) -> Result<()> {
        debug_assert!(entry.is_valid());
        trace!("sq push {:?} mode {}", entry, mode);

        let _guard = self.mutex.lock().unwrap();

        loop {
            let mut force = false;

            let mask = unsafe { *self.mask };
            let head = self.head_ref().load(Ordering::Acquire);
            let tail = self.tail_ref().load(Ordering::Relaxed);
            let next = tail.wrapping_add(1);

            let head_index = head & mask;
            let tail_index = tail & mask;
            let next_index = next & mask;

            if next_index != head_index {
                unsafe {
                    std::ptr::write(self.entries.add(tail_index as usize), *entry);
                    std::ptr::write(self.array.add(tail_index as usize), tail_index);
                }
                // Publish the entry before the new tail becomes visible
                // to the kernel.
                self.tail_ref().store(next, Ordering::Release);
                self.pending.fetch_add(1, Ordering::AcqRel);
            } else {
                trace!("sq full: head {} tail {}", head, tail);
                force = true;
            }

            if mode == SubmitMode::Immediate || force {
                let to_submit = self.gather();
                let rc = sys::enter(self.ring, to_submit, 0);
                if rc < 0 {
                    let error = Error::last_os_error();
                    warn!("sq enter failed: {}", error);
                    return Err(error);
                }
                if rc as u32 != to_submit {
                    warn!("sq enter consumed {} of {}", rc, to_submit);
                }
            }

            if force {
                continue;
            }
            return Ok(());
        }
    }

    /// Claim the pushed-but-not-entered count for an imminent enter.
    pub fn gather(&self) -> u32 {
        self.pending.swap(0, Ordering::AcqRel)
    }

    pub fn head(&self) -> u32 {
        self.head_ref().load(Ordering::Acquire)
    }

    pub fn tail(&self) -> u32 {
        self.tail_ref().load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u32 {
        unsafe { *self.ring_entries }
    }

    /// Entries the kernel has not consumed yet.
    pub fn len(&self) -> u32 {
        self.tail().wrapping_sub(self.head())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    fn head_ref(&self) -> &AtomicU32 {
        unsafe { &*self.head }
    }

    #[inline(always)]
    fn tail_ref(&self) -> &AtomicU32 {
        unsafe { &*self.tail }
    }

    /// Fabricate a queue over anonymous memory, with no ring descriptor
    /// behind it. Pushing in `Deferred` mode exercises the full
    /// producer protocol; entering the kernel is not possible.
    #[cfg(test)]
    pub(crate) fn fake(capacity: u32) -> Self {
        assert!(capacity.is_power_of_two());

        // Fabricated layout: head 0, tail 4, mask 8, entries 12,
        // array at 64.
        let ring_len = 64 + capacity as usize * std::mem::size_of::<u32>();
        let ring_map = MemoryMap::anonymous(ring_len).unwrap();
        let entry_map =
            MemoryMap::anonymous(capacity as usize * std::mem::size_of::<Submission>()).unwrap();

        unsafe {
            *ring_map.offset_as::<u32>(8) = capacity - 1;
            *ring_map.offset_as::<u32>(12) = capacity;

            Self {
                mutex: Mutex::new(()),
                ring: -1,
                pending: AtomicU32::new(0),
                head: ring_map.offset_as::<AtomicU32>(0),
                tail: ring_map.offset_as::<AtomicU32>(4),
                mask: ring_map.offset_as::<u32>(8),
                ring_entries: ring_map.offset_as::<u32>(12),
                array: ring_map.offset_as::<u32>(64),
                entries: entry_map.base() as *mut Submission,
                _ring_map: ring_map,
                _entry_map: entry_map,
            }
        }
    }

    /// Test hook: consume entries the way the kernel would.
    #[cfg(test)]
    pub(crate) fn fake_consume(&self, count: u32) -> Vec<Submission> {
        let mut consumed = Vec::new();
        let mask = unsafe { *self.mask };
        let mut head = self.head_ref().load(Ordering::Acquire);
        let tail = self.tail_ref().load(Ordering::Acquire);
        for _ in 0..count {
            if head == tail {
                break;
            }
            let index = unsafe { *self.array.add((head & mask) as usize) };
            consumed.push(unsafe { std::ptr::read(self.entries.add(index as usize)) });
            head = head.wrapping_add(1);
        }
        self.head_ref().store(head, Ordering::Release);
        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn nop_entry() -> Submission {
        let mut entry = Submission::new();
        entry.prepare_cancel_by_handle(3);
        entry
    }

    #[test]
    fn test_push_and_consume_in_order() {
        let queue = SubmissionQueue::fake(8);
        for _ in 0..3 {
            queue.push(&nop_entry(), SubmitMode::Deferred).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.gather(), 3);

        let consumed = queue.fake_consume(8);
        assert_eq!(consumed.len(), 3);
        assert!(consumed.iter().all(|e| e.handle() == 3));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_count_tracks_head_and_tail() {
        let queue = SubmissionQueue::fake(8);
        for _ in 0..5 {
            queue.push(&nop_entry(), SubmitMode::Deferred).unwrap();
        }
        queue.fake_consume(2);
        assert_eq!(queue.len(), 3);
        assert!(queue.tail().wrapping_sub(queue.head()) <= queue.capacity());
    }

    #[test]
    fn test_wrap_around() {
        let queue = SubmissionQueue::fake(4);
        for _round in 0..5 {
            for _ in 0..3 {
                queue.push(&nop_entry(), SubmitMode::Deferred).unwrap();
            }
            assert_eq!(queue.fake_consume(4).len(), 3);
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_concurrent_producers_never_collide() {
        let queue = Arc::new(SubmissionQueue::fake(256));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    queue.push(&nop_entry(), SubmitMode::Deferred).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.len(), 200);
        assert_eq!(queue.fake_consume(256).len(), 200);
    }
}
