//! The read queue: buffered datagrams and waiting readers.
//!
//! Arrived datagrams queue as entries; user receive callbacks queue as
//! waiters. Both sides drain FIFO. The queue's byte size drives the
//! same latched watermark protocol as the write queue.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::time::{Instant, SystemTime};

use uringnet_core::blob::Blob;
use uringnet_core::endpoint::Endpoint;
use uringnet_core::error::Result;
use uringnet_core::options::ReceiveContext;

use uringnet_proactor::TimerHandle;

use crate::session::QueueContext;

/// Invoked exactly once with one datagram or a terminal error.
pub type ReceiveCallback = Box<dyn FnOnce(Result<()>, Option<Blob>, ReceiveContext) + Send>;

/// One buffered datagram.
pub struct ReceiveQueueEntry {
    pub endpoint: Option<Endpoint>,
    pub blob: Blob,
    pub foreign_handle: Option<RawFd>,
    /// Kernel receive timestamp when timestamping is enabled, else the
    /// local enqueue time.
    pub timestamp: SystemTime,
    /// Local enqueue time, for queue-delay accounting.
    pub enqueued: Instant,
}

/// One waiting reader.
pub struct ReceiveWaiter {
    pub id: u64,
    pub callback: Option<ReceiveCallback>,
    pub deadline: Option<Instant>,
    pub timer: Option<TimerHandle>,
}

pub struct ReceiveQueue {
    entries: VecDeque<ReceiveQueueEntry>,
    waiters: VecDeque<ReceiveWaiter>,
    size: usize,
    next_id: u64,
    low_watermark: usize,
    high_watermark: usize,
    high_announced: bool,
}

impl ReceiveQueue {
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            waiters: VecDeque::new(),
            size: 0,
            next_id: 0,
            low_watermark,
            high_watermark,
            high_announced: false,
        }
    }

    pub fn generate_waiter_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn has_entry(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn has_waiter(&self) -> bool {
        !self.waiters.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn low_watermark(&self) -> usize {
        self.low_watermark
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    pub fn set_low_watermark(&mut self, value: usize) {
        self.low_watermark = value;
    }

    pub fn set_high_watermark(&mut self, value: usize) {
        self.high_watermark = value;
    }

    pub fn context(&self) -> QueueContext {
        QueueContext {
            size: self.size,
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
        }
    }

    pub fn push_entry(&mut self, entry: ReceiveQueueEntry) {
        self.size += entry.blob.len();
        self.entries.push_back(entry);
    }

    pub fn pop_entry(&mut self) -> Option<ReceiveQueueEntry> {
        let entry = self.entries.pop_front()?;
        self.size -= entry.blob.len();
        Some(entry)
    }

    pub fn push_waiter(&mut self, waiter: ReceiveWaiter) {
        self.waiters.push_back(waiter);
    }

    pub fn pop_waiter(&mut self) -> Option<ReceiveWaiter> {
        self.waiters.pop_front()
    }

    /// Remove the waiter with `id` wherever it sits (deadline firing).
    pub fn remove_waiter(&mut self, id: u64) -> Option<ReceiveWaiter> {
        let position = self.waiters.iter().position(|waiter| waiter.id == id)?;
        self.waiters.remove(position)
    }

    /// Drain both sides for shutdown.
    pub fn remove_all(
        &mut self,
        entries: &mut Vec<ReceiveQueueEntry>,
        waiters: &mut Vec<ReceiveWaiter>,
    ) {
        entries.extend(self.entries.drain(..));
        waiters.extend(self.waiters.drain(..));
        self.size = 0;
    }

    pub fn authorize_high_watermark_event(&mut self) -> bool {
        if !self.high_announced && self.size >= self.high_watermark {
            self.high_announced = true;
            return true;
        }
        false
    }

    pub fn authorize_low_watermark_event(&mut self) -> bool {
        if self.high_announced && self.size <= self.low_watermark {
            self.high_announced = false;
            return true;
        }
        false
    }

    /// Whether the queue has drained below its high watermark, i.e.
    /// receive flow control applied on its behalf may relax.
    pub fn below_high_watermark(&self) -> bool {
        self.size < self.high_watermark
    }
}
