//! # uringnet-socket — asynchronous datagram sockets
//!
//! `DatagramSocket` is the public socket façade over the uringnet
//! proactor: open/bind/connect, send and receive pipelines with flow
//! control, rate limiting, watermark events, per-operation deadlines, a
//! zero-copy ledger, a transmit-timestamp correlator, and the orderly
//! shutdown/detachment sequence.
//!
//! The supporting modules are each one concern: queues, flow control,
//! shutdown state, rate limiting, compression contracts, error-queue
//! notifications, and session observation.

pub mod datagram;
pub mod deflate;
pub mod flow;
pub mod limiter;
pub mod notification;
pub mod options;
pub mod receive_queue;
pub mod send_queue;
pub mod session;
pub mod shutdown;
pub mod sockopt;
pub mod timestamp;
pub mod zero_copy;

pub use datagram::{ConnectCallback, DatagramSocket, ReceiveToken, SendToken};
pub use deflate::{Deflater, Inflater};
pub use flow::{FlowControlState, FlowControlType};
pub use limiter::{LeakyBucket, RateLimiter};
pub use options::DatagramSocketOptions;
pub use receive_queue::ReceiveCallback;
pub use send_queue::SendCallback;
pub use session::{DatagramSocketSession, QueueContext, Resolver};
pub use timestamp::{Timestamp, TimestampCorrelator, TimestampType};
pub use zero_copy::{ZeroCopy, ZeroCopyQueue, ZeroCopyType};
