//! Datagram socket configuration.

use std::net::Ipv4Addr;

/// Options applied at open time and adjustable through the socket's
/// setters afterward.
#[derive(Debug, Clone)]
pub struct DatagramSocketOptions {
    /// `SO_REUSEADDR`.
    pub reuse_address: bool,
    /// `SO_SNDBUF`, when overridden.
    pub send_buffer_size: Option<usize>,
    /// `SO_RCVBUF`, when overridden.
    pub receive_buffer_size: Option<usize>,
    /// `SO_KEEPALIVE`; a no-op for most datagram transports but applied
    /// when the caller asks.
    pub keep_alive: bool,
    /// Leave the opposite direction open when one direction shuts down.
    pub keep_half_open: bool,
    /// Receive blobs are sized to this; larger datagrams truncate.
    pub max_datagram_size: usize,
    /// Blobs retained by the receive pool.
    pub blob_pool_depth: usize,

    pub write_queue_low_watermark: usize,
    pub write_queue_high_watermark: usize,
    pub read_queue_low_watermark: usize,
    pub read_queue_high_watermark: usize,

    /// Payloads at least this long engage zero-copy transmission.
    /// `None` never engages it.
    pub zero_copy_threshold: Option<usize>,

    /// Enable `TX_TIMESTAMPING` at open.
    pub timestamp_outgoing_data: bool,
    /// Enable `RX_TIMESTAMPING` at open.
    pub timestamp_incoming_data: bool,

    /// `IP_MULTICAST_LOOP`, when overridden.
    pub multicast_loopback: Option<bool>,
    /// `IP_MULTICAST_TTL`, when overridden.
    pub multicast_time_to_live: Option<u32>,
    /// `IP_MULTICAST_IF`, when overridden.
    pub multicast_interface: Option<Ipv4Addr>,
}

impl Default for DatagramSocketOptions {
    fn default() -> Self {
        Self {
            reuse_address: true,
            send_buffer_size: None,
            receive_buffer_size: None,
            keep_alive: false,
            keep_half_open: false,
            // The largest UDP payload over IPv4.
            max_datagram_size: 65507,
            blob_pool_depth: 64,
            write_queue_low_watermark: 512,
            write_queue_high_watermark: 262_144,
            read_queue_low_watermark: 0,
            read_queue_high_watermark: 262_144,
            zero_copy_threshold: None,
            timestamp_outgoing_data: false,
            timestamp_incoming_data: false,
            multicast_loopback: None,
            multicast_time_to_live: None,
            multicast_interface: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let options = DatagramSocketOptions::default();
        assert!(options.reuse_address);
        assert!(options.write_queue_low_watermark < options.write_queue_high_watermark);
        assert!(options.read_queue_low_watermark < options.read_queue_high_watermark);
        assert!(options.zero_copy_threshold.is_none());
        assert!(options.max_datagram_size > 0);
    }
}
