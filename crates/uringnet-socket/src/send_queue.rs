//! The deferred write queue.
//!
//! Entries leave in FIFO order, always. Watermark events are latched:
//! exactly one high event per low→high crossing, exactly one low event
//! when the drain recrosses the low watermark.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use uringnet_core::blob::Blob;
use uringnet_core::endpoint::Endpoint;
use uringnet_core::error::Result;
use uringnet_core::options::SendContext;

use uringnet_proactor::TimerHandle;

use crate::session::QueueContext;

/// Invoked exactly once with the outcome of one send.
pub type SendCallback = Box<dyn FnOnce(Result<()>, SendContext) + Send>;

/// One queued write, or a shutdown sentinel (no payload).
pub struct SendQueueEntry {
    pub id: u64,
    /// The payload; `None` marks the graceful-shutdown sentinel.
    pub data: Option<Arc<Blob>>,
    pub endpoint: Option<Endpoint>,
    pub foreign_handle: Option<RawFd>,
    pub deadline: Option<Instant>,
    pub timer: Option<TimerHandle>,
    /// Payload length at enqueue time (post-compression).
    pub length: usize,
    pub callback: Option<SendCallback>,
    /// When the entry was queued.
    pub timestamp: Instant,
    /// The payload passed through the write deflater.
    pub deflated: bool,
}

impl SendQueueEntry {
    pub fn is_sentinel(&self) -> bool {
        self.data.is_none()
    }
}

pub struct SendQueue {
    entries: VecDeque<SendQueueEntry>,
    size: usize,
    next_id: u64,
    low_watermark: usize,
    high_watermark: usize,
    high_announced: bool,
}

impl SendQueue {
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            next_id: 0,
            low_watermark,
            high_watermark,
            high_announced: false,
        }
    }

    pub fn generate_entry_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn has_entry(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Queue size in bytes.
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

    /// Append an entry. Returns true when the queue was empty.
    pub fn push_entry(&mut self, entry: SendQueueEntry) -> bool {
        let was_empty = self.entries.is_empty();
        self.size += entry.length;
        self.entries.push_back(entry);
        was_empty
    }

    /// Put an entry back at the front after a transient failure.
    pub fn push_front(&mut self, entry: SendQueueEntry) {
        self.size += entry.length;
        self.entries.push_front(entry);
    }

    pub fn front(&self) -> Option<&SendQueueEntry> {
        self.entries.front()
    }

    pub fn pop_entry(&mut self) -> Option<SendQueueEntry> {
        let entry = self.entries.pop_front()?;
        self.size -= entry.length;
        Some(entry)
    }

    /// Remove the entry with `id` wherever it sits (deadline firing).
    pub fn remove(&mut self, id: u64) -> Option<SendQueueEntry> {
        let position = self.entries.iter().position(|entry| entry.id == id)?;
        let entry = self.entries.remove(position)?;
        self.size -= entry.length;
        Some(entry)
    }

    /// Drop everything, reporting whether entries were discarded.
    pub fn remove_all(&mut self, out: &mut Vec<SendQueueEntry>) -> bool {
        let had_entries = !self.entries.is_empty();
        out.extend(self.entries.drain(..));
        self.size = 0;
        had_entries
    }

    /// One high event per low→high crossing.
    pub fn authorize_high_watermark_event(&mut self) -> bool {
        if !self.high_announced && self.size >= self.high_watermark {
            self.high_announced = true;
            return true;
        }
        false
    }

    /// One low event per high→low crossing.
    pub fn authorize_low_watermark_event(&mut self) -> bool {
        if self.high_announced && self.size <= self.low_watermark {
            self.high_announced = false;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(queue: &mut SendQueue, length: usize) -> SendQueueEntry {
        SendQueueEntry {
            id: queue.generate_entry_id(),
            data: Some(Arc::new(Blob::from_vec(vec![0u8; length]))),
            endpoint: None,
            foreign_handle: None,
            deadline: None,
            timer: None,
            length,
            callback: None,
            timestamp: Instant::now(),
            deflated: false,
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = SendQueue::new(0, usize::MAX);
        for _ in 0..3 {
            let e = entry(&mut queue, 10);
            queue.push_entry(e);
        }
        let first = queue.pop_entry().unwrap();
        let second = queue.pop_entry().unwrap();
        let third = queue.pop_entry().unwrap();
        assert!(first.id < second.id && second.id < third.id);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_watermark_events_fire_once_per_crossing() {
        let mut queue = SendQueue::new(512, 1024);

        let e = entry(&mut queue, 600);
        queue.push_entry(e);
        assert!(!queue.authorize_high_watermark_event());

        let e = entry(&mut queue, 600);
        queue.push_entry(e);
        assert!(queue.authorize_high_watermark_event());
        assert!(!queue.authorize_high_watermark_event());

        queue.pop_entry();
        assert!(!queue.authorize_low_watermark_event()); // 600 > 512
        queue.pop_entry();
        assert!(queue.authorize_low_watermark_event());
        assert!(!queue.authorize_low_watermark_event());

        // A fresh crossing announces again.
        let e = entry(&mut queue, 2000);
        queue.push_entry(e);
        assert!(queue.authorize_high_watermark_event());
    }

    #[test]
    fn test_remove_by_id_adjusts_size() {
        let mut queue = SendQueue::new(0, usize::MAX);
        let keep = entry(&mut queue, 10);
        let keep_id = keep.id;
        queue.push_entry(keep);
        let victim = entry(&mut queue, 20);
        let victim_id = victim.id;
        queue.push_entry(victim);

        let removed = queue.remove(victim_id).unwrap();
        assert_eq!(removed.id, victim_id);
        assert_eq!(queue.size(), 10);
        assert!(queue.remove(victim_id).is_none());
        assert_eq!(queue.front().unwrap().id, keep_id);
    }

    #[test]
    fn test_sentinel_entries_are_weightless() {
        let mut queue = SendQueue::new(0, usize::MAX);
        let sentinel = SendQueueEntry {
            id: queue.generate_entry_id(),
            data: None,
            endpoint: None,
            foreign_handle: None,
            deadline: None,
            timer: None,
            length: 0,
            callback: None,
            timestamp: Instant::now(),
            deflated: false,
        };
        assert!(sentinel.is_sentinel());
        queue.push_entry(sentinel);
        assert_eq!(queue.size(), 0);
        assert!(queue.has_entry());
    }
}
