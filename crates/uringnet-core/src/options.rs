//! Operation options and completion contexts.
//!
//! Options qualify a request on the way in; contexts report what actually
//! happened on the way out, through the caller's callback.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::blob::Blob;
use crate::endpoint::Endpoint;

/// A sendable payload. Every variant is reference counted so an in-flight
/// kernel operation keeps its source alive without copying it.
#[derive(Debug, Clone)]
pub enum Data {
    /// A blob, sent as one contiguous segment.
    Blob(Arc<Blob>),
    /// A single byte buffer.
    Bytes(Arc<Vec<u8>>),
    /// An array of byte buffers, gathered as one datagram.
    BufferArray(Arc<Vec<Vec<u8>>>),
    /// A string payload.
    Text(Arc<String>),
    /// A region of an open file. Not yet translatable to a datagram
    /// submission; send returns `NotImplemented`.
    File(FileRegion),
}

/// A byte range of an open file.
#[derive(Debug, Clone, Copy)]
pub struct FileRegion {
    pub fd: RawFd,
    pub offset: u64,
    pub length: u64,
}

impl Data {
    /// Total number of payload bytes.
    pub fn length(&self) -> usize {
        match self {
            Data::Blob(blob) => blob.len(),
            Data::Bytes(bytes) => bytes.len(),
            Data::BufferArray(buffers) => buffers.iter().map(|b| b.len()).sum(),
            Data::Text(text) => text.len(),
            Data::File(region) => region.length as usize,
        }
    }

    /// Number of scatter/gather segments the payload naturally splits
    /// into.
    pub fn segment_count(&self) -> usize {
        match self {
            Data::BufferArray(buffers) => buffers.len(),
            _ => 1,
        }
    }
}

/// Options qualifying a send request.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Destination, required when the socket is unconnected.
    pub endpoint: Option<Endpoint>,
    /// Cap on the number of bytes gathered from the source.
    /// Zero means no cap.
    pub max_bytes: usize,
    /// Cap on the number of scatter/gather descriptors. Zero means the
    /// smaller of `IOV_MAX` and the event's inline capacity.
    pub max_buffers: usize,
    /// A descriptor to pass as ancillary data (local sockets only).
    pub foreign_handle: Option<RawFd>,
    /// Abandon the entry and fail the callback with `WouldBlock` if the
    /// payload has not been handed to the kernel by this time.
    pub deadline: Option<Instant>,
    /// Engage the zero-copy transmission path. Set by the socket when
    /// the payload length crosses its configured threshold; callers
    /// normally leave this false.
    pub zero_copy: bool,
    /// Correlation value stored on the event and reported back with the
    /// zero-copy completion of this send.
    pub correlation: u64,
}

/// Options qualifying a receive request.
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Report the sender's endpoint (meaningful when unconnected).
    pub want_endpoint: bool,
    /// Cap on the number of bytes scattered into the destination blob.
    /// Zero means the blob's full writable region.
    pub max_bytes: usize,
    /// Cap on the number of scatter descriptors. Zero means the smaller
    /// of `IOV_MAX` and the event's inline capacity.
    pub max_buffers: usize,
    /// Abandon the callback with `WouldBlock` if nothing has arrived by
    /// this time.
    pub deadline: Option<Instant>,
    /// Reserve ancillary space for a passed descriptor (local sockets).
    pub want_foreign_handle: bool,
    /// Reserve ancillary space for kernel receive timestamps.
    pub want_timestamp: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            want_endpoint: true,
            max_bytes: 0,
            max_buffers: 0,
            deadline: None,
            want_foreign_handle: false,
            want_timestamp: false,
        }
    }
}

/// Which direction of a socket an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
    Send,
    Receive,
    Both,
}

impl ShutdownType {
    /// The `how` argument of `shutdown(2)`.
    pub fn sys_how(&self) -> libc::c_int {
        match self {
            ShutdownType::Send => libc::SHUT_WR,
            ShutdownType::Receive => libc::SHUT_RD,
            ShutdownType::Both => libc::SHUT_RDWR,
        }
    }

    pub fn includes_send(&self) -> bool {
        matches!(self, ShutdownType::Send | ShutdownType::Both)
    }

    pub fn includes_receive(&self) -> bool {
        matches!(self, ShutdownType::Receive | ShutdownType::Both)
    }
}

/// Whether a shutdown waits for queued writes to drain first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Half-close now, abandoning queued writes.
    Immediate,
    /// Queue a sentinel so the half-close happens after pending writes
    /// drain.
    Graceful,
}

/// Which side initiated a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOrigin {
    Source,
    Remote,
}

/// What a send operation accomplished.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendContext {
    /// Bytes the request attempted to transmit.
    pub bytes_sendable: u64,
    /// Bytes the kernel accepted. Datagram sends are all-or-nothing, so
    /// on success this equals `bytes_sendable`.
    pub bytes_sent: u64,
    /// The transmission used the zero-copy path; the caller's callback is
    /// deferred until the kernel releases the pages.
    pub zero_copy: bool,
}

/// What a receive operation accomplished.
#[derive(Debug, Clone, Default)]
pub struct ReceiveContext {
    /// Bytes of writable region offered to the kernel.
    pub bytes_receivable: u64,
    /// Bytes of the datagram actually received.
    pub bytes_received: u64,
    /// The sender's endpoint, when requested and available.
    pub endpoint: Option<Endpoint>,
    /// A descriptor received as ancillary data, if any.
    pub foreign_handle: Option<RawFd>,
    /// Wall-clock time the datagram was enqueued locally.
    pub timestamp: Option<SystemTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_length_and_segments() {
        let blob = Data::Blob(Arc::new(Blob::from_slice(b"hello")));
        assert_eq!(blob.length(), 5);
        assert_eq!(blob.segment_count(), 1);

        let array = Data::BufferArray(Arc::new(vec![vec![1, 2], vec![3], vec![4, 5, 6]]));
        assert_eq!(array.length(), 6);
        assert_eq!(array.segment_count(), 3);

        let text = Data::Text(Arc::new("ping".to_string()));
        assert_eq!(text.length(), 4);
    }
}
