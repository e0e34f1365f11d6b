//! Outgoing-timestamp correlation.
//!
//! When transmit timestamping is on, each send is tagged with a
//! monotonic counter and its pre-send wall-clock time is recorded. The
//! kernel later reports Scheduled and Sent timestamps carrying that
//! counter; the correlator turns each report into the delay between
//! hand-off and the reported stage. A Sent report retires its record.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// The stage a kernel transmit timestamp describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampType {
    /// Passed to the traffic scheduler.
    Scheduled,
    /// Handed to the wire.
    Sent,
    /// Acknowledged by the peer (stream transports only).
    Acknowledged,
}

/// One kernel timestamp report.
#[derive(Debug, Clone, Copy)]
pub struct Timestamp {
    pub kind: TimestampType,
    /// The send counter the report refers to.
    pub id: u32,
    pub time: SystemTime,
}

/// Matches kernel timestamp reports to recorded send times.
#[derive(Default)]
pub struct TimestampCorrelator {
    records: HashMap<u32, SystemTime>,
}

impl TimestampCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the pre-send time of the send tagged `id`.
    pub fn save_before_send(&mut self, id: u32, time: SystemTime) {
        self.records.insert(id, time);
    }

    /// Produce the delay for a kernel report, or `None` when the report
    /// cannot be correlated (stale id, counter reset).
    pub fn timestamp_received(&mut self, timestamp: &Timestamp) -> Option<Duration> {
        let recorded = match timestamp.kind {
            // Sent is the final stage for datagram transports; retire
            // the record.
            TimestampType::Sent | TimestampType::Acknowledged => {
                self.records.remove(&timestamp.id)?
            }
            TimestampType::Scheduled => *self.records.get(&timestamp.id)?,
        };
        timestamp.time.duration_since(recorded).ok()
    }

    /// Forget everything (timestamping disabled).
    pub fn reset(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduled_then_sent() {
        let mut correlator = TimestampCorrelator::new();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        correlator.save_before_send(7, base);

        let scheduled = correlator.timestamp_received(&Timestamp {
            kind: TimestampType::Scheduled,
            id: 7,
            time: base + Duration::from_micros(50),
        });
        assert_eq!(scheduled, Some(Duration::from_micros(50)));
        assert_eq!(correlator.len(), 1);

        let sent = correlator.timestamp_received(&Timestamp {
            kind: TimestampType::Sent,
            id: 7,
            time: base + Duration::from_micros(120),
        });
        assert_eq!(sent, Some(Duration::from_micros(120)));
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_uncorrelated_report() {
        let mut correlator = TimestampCorrelator::new();
        let report = Timestamp {
            kind: TimestampType::Sent,
            id: 42,
            time: SystemTime::now(),
        };
        assert_eq!(correlator.timestamp_received(&report), None);
    }

    #[test]
    fn test_reset_clears_records() {
        let mut correlator = TimestampCorrelator::new();
        correlator.save_before_send(1, SystemTime::now());
        correlator.reset();
        assert!(correlator.is_empty());
    }
}
