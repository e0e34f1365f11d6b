//! Timers and deferred functors.
//!
//! The chronology is the proactor's clock authority: a binary-heap timer
//! registry plus a queue of deferred functors. Waiter threads bound
//! their kernel waits by `earliest()` and call `announce()` after every
//! wake-up to fire due timers and drain deferred work.
//!
//! Cancellation is tombstone-based: cancelling marks the timer id and
//! the heap entry is skipped when it surfaces.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

pub type Functor = Box<dyn FnOnce() + Send>;

/// Handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(PartialEq, Eq)]
struct HeapEntry {
    due: Instant,
    id: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    callbacks: HashMap<u64, Functor>,
    next_id: u64,
}

/// The timer registry and deferred-functor queue shared by a proactor
/// and its sockets.
#[derive(Default)]
pub struct Chronology {
    timers: Mutex<TimerState>,
    deferred: Mutex<VecDeque<Functor>>,
}

impl Chronology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a one-shot functor at `due`.
    pub fn schedule<F>(&self, due: Instant, functor: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut timers = self.timers.lock().unwrap();
        timers.next_id += 1;
        let id = timers.next_id;
        timers.heap.push(Reverse(HeapEntry { due, id }));
        timers.callbacks.insert(id, Box::new(functor));
        TimerHandle(id)
    }

    /// Cancel a scheduled timer. Returns false when it already fired or
    /// was cancelled.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut timers = self.timers.lock().unwrap();
        timers.callbacks.remove(&handle.0).is_some()
    }

    /// The earliest live deadline, the bound for a kernel wait.
    pub fn earliest(&self) -> Option<Instant> {
        let mut timers = self.timers.lock().unwrap();
        loop {
            match timers.heap.peek() {
                Some(Reverse(entry)) if timers.callbacks.contains_key(&entry.id) => {
                    return Some(entry.due);
                }
                Some(_) => {
                    // Tombstoned entry: discard and keep looking.
                    timers.heap.pop();
                }
                None => return None,
            }
        }
    }

    /// Defer a functor to the next announcement cycle.
    pub fn execute<F>(&self, functor: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.deferred.lock().unwrap().push_back(Box::new(functor));
    }

    /// True when any timer is scheduled or any functor is deferred.
    pub fn has_any_scheduled_or_deferred(&self) -> bool {
        if !self.deferred.lock().unwrap().is_empty() {
            return true;
        }
        let timers = self.timers.lock().unwrap();
        !timers.callbacks.is_empty()
    }

    /// Fire every timer due at `now` and run every deferred functor.
    /// Returns the number of functors run. Callbacks run with no
    /// chronology lock held.
    pub fn announce(&self, now: Instant) -> usize {
        let mut runnable: Vec<Functor> = Vec::new();

        {
            let mut timers = self.timers.lock().unwrap();
            while let Some(Reverse(entry)) = timers.heap.peek() {
                if entry.due > now {
                    break;
                }
                let id = entry.id;
                timers.heap.pop();
                if let Some(callback) = timers.callbacks.remove(&id) {
                    runnable.push(callback);
                }
            }
        }

        {
            let mut deferred = self.deferred.lock().unwrap();
            runnable.extend(deferred.drain(..));
        }

        let count = runnable.len();
        for functor in runnable {
            functor();
        }
        count
    }

    /// Drop every deferred functor without running it.
    pub fn clear_functions(&self) {
        self.deferred.lock().unwrap().clear();
    }

    /// Drop every scheduled timer without firing it.
    pub fn clear_timers(&self) {
        let mut timers = self.timers.lock().unwrap();
        timers.heap.clear();
        timers.callbacks.clear();
    }

    pub fn clear(&self) {
        self.clear_functions();
        self.clear_timers();
    }

    /// Number of live timers.
    pub fn timer_count(&self) -> usize {
        self.timers.lock().unwrap().callbacks.len()
    }
}
