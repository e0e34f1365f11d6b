//! The zero-copy ledger.
//!
//! Each zero-copy send retains its payload in a ledger entry keyed by a
//! monotonic counter. The kernel's zero-copy completions report a
//! counter range `[from, thru]`; matched entries release their payload
//! and surrender the caller's callback — in FIFO order, so a late
//! middle entry holds back the ones behind it.

use std::collections::VecDeque;
use std::sync::Arc;

use uringnet_core::blob::Blob;
use uringnet_core::options::SendContext;

use crate::send_queue::SendCallback;

/// How the kernel finished a zero-copy range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroCopyType {
    /// The pages were transmitted in place.
    Deferred,
    /// The kernel fell back to copying; zero-copy bought nothing.
    Avoided,
}

/// One zero-copy completion from the kernel.
#[derive(Debug, Clone, Copy)]
pub struct ZeroCopy {
    pub from: u64,
    pub thru: u64,
    pub kind: ZeroCopyType,
}

impl ZeroCopy {
    pub fn contains(&self, counter: u64) -> bool {
        self.from <= counter && counter <= self.thru
    }
}

struct ZeroCopyEntry {
    counter: u64,
    /// Held until the kernel releases the pages.
    data: Option<Arc<Blob>>,
    context: SendContext,
    callback: Option<SendCallback>,
    /// The kernel reported this counter done.
    complete: bool,
    /// The send completion arrived; the entry may pop once complete.
    framed: bool,
}

/// FIFO ledger of in-flight zero-copy sends.
#[derive(Default)]
pub struct ZeroCopyQueue {
    entries: VecDeque<ZeroCopyEntry>,
    next_counter: u64,
}

impl ZeroCopyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next counter value without recording an entry.
    pub fn next_counter(&self) -> u64 {
        self.next_counter
    }

    /// Record a zero-copy send. Returns its counter.
    pub fn push(
        &mut self,
        data: Arc<Blob>,
        context: SendContext,
        callback: Option<SendCallback>,
    ) -> u64 {
        let counter = self.next_counter;
        self.next_counter += 1;
        self.entries.push_back(ZeroCopyEntry {
            counter,
            data: Some(data),
            context,
            callback,
            complete: false,
            framed: false,
        });
        counter
    }

    /// Mark that the send completion for `counter` arrived.
    pub fn frame(&mut self, counter: u64, context: SendContext) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.counter == counter)
        {
            entry.framed = true;
            entry.context = context;
        }
    }

    /// Apply one kernel completion, releasing payloads in its range.
    pub fn update(&mut self, zero_copy: ZeroCopy) {
        for entry in self.entries.iter_mut() {
            if zero_copy.contains(entry.counter) {
                entry.complete = true;
                entry.data = None;
            }
        }
    }

    /// Whether the front entry is ready to pop.
    pub fn ready(&self) -> bool {
        matches!(
            self.entries.front(),
            Some(entry) if entry.complete && entry.framed
        )
    }

    /// Pop the next finished entry in FIFO order.
    pub fn pop(&mut self) -> Option<(SendContext, Option<SendCallback>)> {
        if !self.ready() {
            return None;
        }
        let entry = self.entries.pop_front().unwrap();
        Some((entry.context, entry.callback))
    }

    /// Abandon every entry (shutdown), handing back the callbacks.
    pub fn clear(&mut self, out: &mut Vec<(SendContext, Option<SendCallback>)>) {
        for entry in self.entries.drain(..) {
            out.push((entry.context, entry.callback));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(queue: &mut ZeroCopyQueue) -> u64 {
        let data = Arc::new(Blob::from_slice(b"payload"));
        let context = SendContext {
            bytes_sendable: 7,
            bytes_sent: 7,
            zero_copy: true,
        };
        queue.push(data, context, None)
    }

    #[test]
    fn test_range_match_releases_in_order() {
        let mut queue = ZeroCopyQueue::new();
        let first = push(&mut queue);
        let second = push(&mut queue);
        queue.frame(first, SendContext::default());
        queue.frame(second, SendContext::default());

        queue.update(ZeroCopy {
            from: second,
            thru: second,
            kind: ZeroCopyType::Deferred,
        });
        // The front entry is unfinished; FIFO holds the second back.
        assert!(!queue.ready());
        assert!(queue.pop().is_none());

        queue.update(ZeroCopy {
            from: first,
            thru: first,
            kind: ZeroCopyType::Deferred,
        });
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_span_covers_multiple_entries() {
        let mut queue = ZeroCopyQueue::new();
        let first = push(&mut queue);
        push(&mut queue);
        let third = push(&mut queue);
        for counter in first..=third {
            queue.frame(counter, SendContext::default());
        }

        queue.update(ZeroCopy {
            from: first,
            thru: third,
            kind: ZeroCopyType::Deferred,
        });
        assert_eq!(queue.len(), 3);
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_some());
    }

    #[test]
    fn test_unframed_entry_waits_for_send_completion() {
        let mut queue = ZeroCopyQueue::new();
        let counter = push(&mut queue);
        queue.update(ZeroCopy {
            from: counter,
            thru: counter,
            kind: ZeroCopyType::Avoided,
        });
        assert!(!queue.ready());
        queue.frame(counter, SendContext::default());
        assert!(queue.ready());
    }

    #[test]
    fn test_clear_returns_callbacks() {
        let mut queue = ZeroCopyQueue::new();
        push(&mut queue);
        push(&mut queue);
        let mut abandoned = Vec::new();
        queue.clear(&mut abandoned);
        assert_eq!(abandoned.len(), 2);
        assert!(queue.is_empty());
    }
}
