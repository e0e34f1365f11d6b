//! Session observation of socket lifecycle events.
//!
//! A session receives the socket's announcements: queue watermark
//! crossings, rate limit transitions, flow control changes, shutdown
//! progression, and fatal errors. Every method has a default no-op so
//! observers implement only what they watch.

use uringnet_core::endpoint::Endpoint;
use uringnet_core::error::Error;

use crate::flow::FlowControlType;

/// A snapshot of one queue's occupancy at announcement time.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueContext {
    /// Queue size, in bytes.
    pub size: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
}

/// Observer of one datagram socket's events.
pub trait DatagramSocketSession: Send + Sync {
    /// A name resolution for bind or connect completed.
    fn on_endpoint_resolved(&self, endpoint: &Endpoint) {
        let _ = endpoint;
    }

    fn on_write_queue_high_watermark(&self, context: QueueContext) {
        let _ = context;
    }

    fn on_write_queue_low_watermark(&self, context: QueueContext) {
        let _ = context;
    }

    /// Queued writes were discarded by a shutdown.
    fn on_write_queue_discarded(&self, context: QueueContext) {
        let _ = context;
    }

    fn on_write_rate_limit_applied(&self, context: QueueContext) {
        let _ = context;
    }

    fn on_write_rate_limit_relaxed(&self, context: QueueContext) {
        let _ = context;
    }

    fn on_read_queue_high_watermark(&self, context: QueueContext) {
        let _ = context;
    }

    fn on_read_queue_low_watermark(&self, context: QueueContext) {
        let _ = context;
    }

    fn on_read_rate_limit_applied(&self, context: QueueContext) {
        let _ = context;
    }

    fn on_read_rate_limit_relaxed(&self, context: QueueContext) {
        let _ = context;
    }

    fn on_flow_control_applied(&self, direction: FlowControlType) {
        let _ = direction;
    }

    fn on_flow_control_relaxed(&self, direction: FlowControlType) {
        let _ = direction;
    }

    fn on_shutdown_initiated(&self) {}

    fn on_shutdown_send(&self) {}

    fn on_shutdown_receive(&self) {}

    fn on_shutdown_complete(&self) {}

    fn on_error(&self, error: Error) {
        let _ = error;
    }
}

/// Resolves names to endpoints for the bind/connect name forms.
pub trait Resolver: Send + Sync {
    fn resolve(&self, name: &str) -> uringnet_core::error::Result<Endpoint>;
}
