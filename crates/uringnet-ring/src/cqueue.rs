//! The memory-mapped completion queue.
//!
//! The kernel is the producer: it advances the shared tail with release
//! semantics after writing each record. The process pops `[head, tail)`
//! under a mutex and publishes the new head with release semantics so the
//! kernel can reuse the slots.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use log::trace;
use uringnet_core::error::Result;

use crate::completion::Completion;
use crate::config::RingConfig;
use crate::mmap::MemoryMap;
use crate::sys;

pub struct CompletionQueue {
    mutex: Mutex<()>,

    // Mapping kept alive for the pointers below; unmapped on drop.
    _ring_map: MemoryMap,

    head: *const AtomicU32,
    tail: *const AtomicU32,
    mask: *const u32,
    ring_entries: *const u32,
    entries: *const Completion,
}

// The raw pointers target the mapping owned by this struct; access is
// synchronized by `mutex` and the atomic head/tail protocol.
unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl CompletionQueue {
    /// Map the completion ring of `ring` according to `config`.
    pub fn map(ring: libc::c_int, config: &RingConfig) -> Result<Self> {
        let offsets = &config.params().cq_off;

        let ring_map = MemoryMap::map(ring, sys::OFF_CQ_RING, config.completion_ring_length())?;

        unsafe {
            Ok(Self {
                mutex: Mutex::new(()),
                head: ring_map.offset_as::<AtomicU32>(offsets.head as usize),
                tail: ring_map.offset_as::<AtomicU32>(offsets.tail as usize),
                mask: ring_map.offset_as::<u32>(offsets.ring_mask as usize),
                ring_entries: ring_map.offset_as::<u32>(offsets.ring_entries as usize),
                entries: ring_map.offset_as::<Completion>(offsets.cqes as usize),
                _ring_map: ring_map,
            })
        }
    }

    /// Pop up to `result.len()` records. Returns the number popped.
    pub fn pop(&self, result: &mut [Completion]) -> usize {
        debug_assert!(!result.is_empty());

        let _guard = self.mutex.lock().unwrap();

        let mask = unsafe { *self.mask };
        let mut head = self.head_ref().load(Ordering::Relaxed);

        let mut count = 0usize;
        loop {
            let tail = self.tail_ref().load(Ordering::Acquire);
            if head == tail {
                break;
            }

            let index = head & mask;
            result[count] = unsafe { std::ptr::read(self.entries.add(index as usize)) };
            count += 1;
            head = head.wrapping_add(1);

            if count == result.len() {
                break;
            }
        }

        if count > 0 {
            trace!("cq popped {}", count);
            // Publish the new head after the slot reads above.
            self.head_ref().store(head, Ordering::Release);
        }

        count
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

    /// Fabricate a queue over anonymous memory for unit tests.
    #[cfg(test)]
    pub(crate) fn fake(capacity: u32) -> Self {
        assert!(capacity.is_power_of_two());

        let ring_len = 64 + capacity as usize * std::mem::size_of::<Completion>();
        let ring_map = MemoryMap::anonymous(ring_len).unwrap();

        unsafe {
            *ring_map.offset_as::<u32>(8) = capacity - 1;
            *ring_map.offset_as::<u32>(12) = capacity;

            Self {
                mutex: Mutex::new(()),
                head: ring_map.offset_as::<AtomicU32>(0),
                tail: ring_map.offset_as::<AtomicU32>(4),
                mask: ring_map.offset_as::<u32>(8),
                ring_entries: ring_map.offset_as::<u32>(12),
                entries: ring_map.offset_as::<Completion>(64),
                _ring_map: ring_map,
            }
        }
    }

    /// Test hook: produce records the way the kernel would.
    #[cfg(test)]
    pub(crate) fn fake_produce(&self, records: &[Completion]) {
        let mask = unsafe { *self.mask };
        let mut tail = self.tail_ref().load(Ordering::Relaxed);
        for record in records {
            let index = tail & mask;
            unsafe {
                std::ptr::write(self.entries.add(index as usize) as *mut Completion, *record);
            }
            tail = tail.wrapping_add(1);
        }
        self.tail_ref().store(tail, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_empty() {
        let queue = CompletionQueue::fake(8);
        let mut buffer = [Completion::default(); 4];
        assert_eq!(queue.pop(&mut buffer), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_batch_in_order() {
        let queue = CompletionQueue::fake(8);
        queue.fake_produce(&[
            Completion::new(11, 1, 0),
            Completion::new(22, 2, 0),
            Completion::new(33, 3, 0),
        ]);

        let mut buffer = [Completion::default(); 8];
        let count = queue.pop(&mut buffer);
        assert_eq!(count, 3);
        assert_eq!(buffer[0].user_data(), 11);
        assert_eq!(buffer[1].user_data(), 22);
        assert_eq!(buffer[2].user_data(), 33);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_respects_capacity() {
        let queue = CompletionQueue::fake(8);
        queue.fake_produce(&[
            Completion::new(1, 0, 0),
            Completion::new(2, 0, 0),
            Completion::new(3, 0, 0),
        ]);

        let mut buffer = [Completion::default(); 2];
        assert_eq!(queue.pop(&mut buffer), 2);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop(&mut buffer), 1);
        assert_eq!(buffer[0].user_data(), 3);
    }

    #[test]
    fn test_wrap_around() {
        let queue = CompletionQueue::fake(4);
        let mut buffer = [Completion::default(); 4];
        for round in 0..6u64 {
            queue.fake_produce(&[
                Completion::new(round * 10, 0, 0),
                Completion::new(round * 10 + 1, 0, 0),
                Completion::new(round * 10 + 2, 0, 0),
            ]);
            let count = queue.pop(&mut buffer);
            assert_eq!(count, 3);
            assert_eq!(buffer[0].user_data(), round * 10);
        }
    }
}
