//! End-to-end datagram socket scenarios.
//!
//! Every test needs a working io_uring; environments that refuse ring
//! creation (seccomp, old kernels) skip by returning early.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uringnet_core::endpoint::{Endpoint, Transport};
use uringnet_core::error::Error;
use uringnet_core::options::{Data, ReceiveOptions, SendOptions, ShutdownMode, ShutdownType};

use uringnet_proactor::{Proactor, ProactorConfig};
use uringnet_ring::RingDevice;

use uringnet_socket::{
    DatagramSocket, DatagramSocketOptions, FlowControlType, LeakyBucket, QueueContext,
};

fn try_proactor() -> Option<Arc<Proactor>> {
    if !RingDevice::is_supported() {
        return None;
    }
    match Proactor::new(ProactorConfig::default()) {
        Ok(proactor) => Some(proactor),
        Err(error) => {
            eprintln!("skipping datagram test: {}", error);
            None
        }
    }
}

/// Poll the proactor on this thread until `done` or `timeout`.
fn pump(proactor: &Arc<Proactor>, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let mut waiter = proactor.register_waiter();
    let deadline = Instant::now() + timeout;
    let mut finished = false;
    while Instant::now() < deadline {
        proactor.poll(&mut waiter);
        if done() {
            finished = true;
            break;
        }
    }
    proactor.deregister_waiter(waiter);
    finished
}

#[derive(Default)]
struct RecordingSession {
    write_high: AtomicUsize,
    write_low: AtomicUsize,
    read_high: AtomicUsize,
    read_low: AtomicUsize,
    rate_applied: AtomicUsize,
    rate_relaxed: AtomicUsize,
    shutdown_complete: AtomicUsize,
}

impl uringnet_socket::DatagramSocketSession for RecordingSession {
    fn on_write_queue_high_watermark(&self, _context: QueueContext) {
        self.write_high.fetch_add(1, Ordering::SeqCst);
    }
    fn on_write_queue_low_watermark(&self, _context: QueueContext) {
        self.write_low.fetch_add(1, Ordering::SeqCst);
    }
    fn on_read_queue_high_watermark(&self, _context: QueueContext) {
        self.read_high.fetch_add(1, Ordering::SeqCst);
    }
    fn on_read_queue_low_watermark(&self, _context: QueueContext) {
        self.read_low.fetch_add(1, Ordering::SeqCst);
    }
    fn on_write_rate_limit_applied(&self, _context: QueueContext) {
        self.rate_applied.fetch_add(1, Ordering::SeqCst);
    }
    fn on_write_rate_limit_relaxed(&self, _context: QueueContext) {
        self.rate_relaxed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_shutdown_complete(&self) {
        self.shutdown_complete.fetch_add(1, Ordering::SeqCst);
    }
}

fn open_loopback(proactor: &Arc<Proactor>) -> Arc<DatagramSocket> {
    let socket = DatagramSocket::create(Arc::clone(proactor), DatagramSocketOptions::default());
    socket.open(Transport::UdpIpv4).unwrap();
    socket
        .bind(&Endpoint::Ip("127.0.0.1:0".parse().unwrap()))
        .unwrap();
    socket
}

#[test]
fn test_echo() {
    let Some(proactor) = try_proactor() else { return };

    let sender = open_loopback(&proactor);
    let receiver = open_loopback(&proactor);
    let receiver_endpoint = receiver.source_endpoint().unwrap();
    let sender_endpoint = sender.source_endpoint().unwrap();

    let received: Arc<Mutex<Vec<(Vec<u8>, Option<Endpoint>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);
    receiver
        .receive(
            &ReceiveOptions::default(),
            Box::new(move |result, blob, context| {
                result.unwrap();
                received_clone
                    .lock()
                    .unwrap()
                    .push((blob.unwrap().as_slice().to_vec(), context.endpoint));
            }),
        )
        .unwrap();

    let sent = Arc::new(AtomicUsize::new(0));
    let sent_clone = Arc::clone(&sent);
    let options = SendOptions {
        endpoint: Some(receiver_endpoint),
        ..Default::default()
    };
    sender
        .send(
            Data::Bytes(Arc::new(b"ping".to_vec())),
            &options,
            Some(Box::new(move |result, context| {
                result.unwrap();
                assert_eq!(context.bytes_sendable, 4);
                assert_eq!(context.bytes_sent, 4);
                sent_clone.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    assert!(pump(&proactor, Duration::from_secs(2), || {
        sent.load(Ordering::SeqCst) == 1 && !received.lock().unwrap().is_empty()
    }));

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, b"ping");
    assert_eq!(received[0].1.as_ref(), Some(&sender_endpoint));
}

#[test]
fn test_rate_limit_holds_then_releases() {
    let Some(proactor) = try_proactor() else { return };

    let sender = open_loopback(&proactor);
    let peer = open_loopback(&proactor);
    let peer_endpoint = peer.source_endpoint().unwrap();

    let session = Arc::new(RecordingSession::default());
    sender.register_session(session.clone());

    // 200 bytes/second with a 100-byte burst: two 50-byte sends pass,
    // the rest wait for the bucket to leak.
    sender.set_write_rate_limiter(Some(Box::new(LeakyBucket::new(
        200,
        100,
        Instant::now(),
    ))));

    let completed = Arc::new(AtomicUsize::new(0));
    let options = SendOptions {
        endpoint: Some(peer_endpoint),
        ..Default::default()
    };
    for _ in 0..6 {
        let completed = Arc::clone(&completed);
        sender
            .send(
                Data::Bytes(Arc::new(vec![0u8; 50])),
                &options,
                Some(Box::new(move |result, _context| {
                    result.unwrap();
                    completed.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
    }

    assert!(pump(&proactor, Duration::from_secs(5), || {
        completed.load(Ordering::SeqCst) == 6
    }));

    assert!(session.rate_applied.load(Ordering::SeqCst) >= 1);
    assert!(session.rate_relaxed.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_write_watermarks_fire_once_per_crossing() {
    let Some(proactor) = try_proactor() else { return };

    let sender = open_loopback(&proactor);
    let peer = open_loopback(&proactor);
    let peer_endpoint = peer.source_endpoint().unwrap();

    let session = Arc::new(RecordingSession::default());
    sender.register_session(session.clone());
    sender.set_write_queue_watermarks(512, 1024).unwrap();

    // Park the send direction so enqueued datagrams pile up.
    sender.apply_flow_control(FlowControlType::Send);

    let completed = Arc::new(AtomicUsize::new(0));
    let options = SendOptions {
        endpoint: Some(peer_endpoint),
        ..Default::default()
    };
    for _ in 0..3 {
        let completed = Arc::clone(&completed);
        sender
            .send(
                Data::Bytes(Arc::new(vec![0u8; 600])),
                &options,
                Some(Box::new(move |_result, _context| {
                    completed.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
    }

    // 1800 bytes pending: exactly one high event.
    assert_eq!(session.write_high.load(Ordering::SeqCst), 1);
    assert_eq!(session.write_low.load(Ordering::SeqCst), 0);

    sender.relax_flow_control(FlowControlType::Send);
    assert!(pump(&proactor, Duration::from_secs(2), || {
        completed.load(Ordering::SeqCst) == 3
    }));

    assert_eq!(session.write_high.load(Ordering::SeqCst), 1);
    assert_eq!(session.write_low.load(Ordering::SeqCst), 1);
}

#[test]
fn test_receive_deadline_fires_would_block() {
    let Some(proactor) = try_proactor() else { return };

    let socket = open_loopback(&proactor);

    let outcome = Arc::new(Mutex::new(None));
    let outcome_clone = Arc::clone(&outcome);
    let started = Instant::now();
    let options = ReceiveOptions {
        deadline: Some(Instant::now() + Duration::from_millis(100)),
        ..Default::default()
    };
    socket
        .receive(
            &options,
            Box::new(move |result, _blob, _context| {
                *outcome_clone.lock().unwrap() = Some((result, started.elapsed()));
            }),
        )
        .unwrap();

    assert!(pump(&proactor, Duration::from_secs(2), || {
        outcome.lock().unwrap().is_some()
    }));

    let (result, elapsed) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(result, Err(Error::WouldBlock));
    assert!(elapsed >= Duration::from_millis(90));
    assert!(elapsed < Duration::from_millis(600));

    // The receive direction stays subscribed: a later datagram is
    // deliverable.
    assert!(socket.transport().is_some());
    assert_eq!(socket.receive_sync().unwrap_err(), Error::WouldBlock);
}

#[test]
fn test_cancel_receive_settles_exactly_once() {
    let Some(proactor) = try_proactor() else { return };

    let socket = open_loopback(&proactor);

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let outcomes_clone = Arc::clone(&outcomes);
    let token = socket
        .receive(
            &ReceiveOptions::default(),
            Box::new(move |result, _blob, _context| {
                outcomes_clone.lock().unwrap().push(result);
            }),
        )
        .unwrap();

    socket.cancel_receive(token).unwrap();
    assert_eq!(socket.cancel_receive(token), Err(Error::Invalid));

    pump(&proactor, Duration::from_millis(200), || {
        !outcomes.lock().unwrap().is_empty()
    });

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.as_slice(), &[Err(Error::Cancelled)]);

    // The socket remains attached and usable.
    assert!(socket.transport().is_some());
}

#[test]
fn test_send_fifo_order_preserved() {
    let Some(proactor) = try_proactor() else { return };

    let sender = open_loopback(&proactor);
    let receiver = open_loopback(&proactor);
    let receiver_endpoint = receiver.source_endpoint().unwrap();

    let payload_count = 8u8;
    let received = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..payload_count {
        let received = Arc::clone(&received);
        receiver
            .receive(
                &ReceiveOptions::default(),
                Box::new(move |result, blob, _context| {
                    if result.is_ok() {
                        received.lock().unwrap().push(blob.unwrap().as_slice()[0]);
                    }
                }),
            )
            .unwrap();
    }

    let options = SendOptions {
        endpoint: Some(receiver_endpoint),
        ..Default::default()
    };
    for index in 0..payload_count {
        sender
            .send(Data::Bytes(Arc::new(vec![index; 32])), &options, None)
            .unwrap();
    }

    assert!(pump(&proactor, Duration::from_secs(3), || {
        received.lock().unwrap().len() == payload_count as usize
    }));

    let received = received.lock().unwrap();
    let expected: Vec<u8> = (0..payload_count).collect();
    assert_eq!(received.as_slice(), expected.as_slice());
}

#[test]
fn test_graceful_shutdown_drains_then_closes() {
    let Some(proactor) = try_proactor() else { return };

    let sender = open_loopback(&proactor);
    let peer = open_loopback(&proactor);
    let peer_endpoint = peer.source_endpoint().unwrap();

    let session = Arc::new(RecordingSession::default());
    sender.register_session(session.clone());

    // Park sends so the queue is non-empty when shutdown arrives.
    sender.apply_flow_control(FlowControlType::Send);

    let completed = Arc::new(AtomicUsize::new(0));
    let options = SendOptions {
        endpoint: Some(peer_endpoint),
        ..Default::default()
    };
    for _ in 0..3 {
        let completed = Arc::clone(&completed);
        sender
            .send(
                Data::Bytes(Arc::new(vec![7u8; 64])),
                &options,
                Some(Box::new(move |result, _context| {
                    if result.is_ok() {
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                })),
            )
            .unwrap();
    }

    sender
        .shutdown(ShutdownType::Send, ShutdownMode::Graceful)
        .unwrap();

    // Queued sends must still drain before the half-close.
    assert_eq!(
        sender.send(
            Data::Bytes(Arc::new(vec![0u8; 8])),
            &options,
            None
        ),
        Err(Error::Invalid)
    );

    sender.relax_flow_control(FlowControlType::Send);
    assert!(pump(&proactor, Duration::from_secs(2), || {
        completed.load(Ordering::SeqCst) == 3
    }));
}

#[test]
fn test_close_invokes_callback_exactly_once() {
    let Some(proactor) = try_proactor() else { return };

    let socket = open_loopback(&proactor);
    let session = Arc::new(RecordingSession::default());
    socket.register_session(session.clone());

    let closed = Arc::new(AtomicUsize::new(0));
    let closed_clone = Arc::clone(&closed);
    socket.close(Some(Box::new(move || {
        closed_clone.fetch_add(1, Ordering::SeqCst);
    })));

    assert!(pump(&proactor, Duration::from_secs(2), || {
        closed.load(Ordering::SeqCst) == 1
    }));

    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(session.shutdown_complete.load(Ordering::SeqCst), 1);
    assert!(socket.receive_sync().is_err());
}

#[test]
fn test_release_exports_the_handle() {
    let Some(proactor) = try_proactor() else { return };

    let socket = open_loopback(&proactor);

    let exported = Arc::new(Mutex::new(None));
    let exported_clone = Arc::clone(&exported);
    socket
        .release(Box::new(move |handle| {
            *exported_clone.lock().unwrap() = Some(handle);
        }))
        .unwrap();

    assert!(pump(&proactor, Duration::from_secs(2), || {
        exported.lock().unwrap().is_some()
    }));

    let handle = exported.lock().unwrap().take().unwrap();
    assert!(handle >= 0);
    // The descriptor is the caller's now; prove it is still open.
    let rc = unsafe { libc::fcntl(handle, libc::F_GETFD) };
    assert!(rc >= 0);
    unsafe { libc::close(handle) };
}

#[test]
fn test_zero_copy_sends_settle_callbacks() {
    let Some(proactor) = try_proactor() else { return };

    if !proactor
        .device()
        .supports_operation(uringnet_ring::sys::op::SENDMSG_ZC)
    {
        eprintln!("skipping: kernel lacks zero-copy sendmsg");
        return;
    }

    let sender =
        DatagramSocket::create(Arc::clone(&proactor), DatagramSocketOptions::default());
    sender.open(Transport::UdpIpv4).unwrap();
    sender
        .bind(&Endpoint::Ip("127.0.0.1:0".parse().unwrap()))
        .unwrap();
    if sender.set_zero_copy_threshold(Some(1024)).is_err() {
        eprintln!("skipping: zero-copy not authorized");
        return;
    }

    let receiver = open_loopback(&proactor);
    let receiver_endpoint = receiver.source_endpoint().unwrap();

    let completed = Arc::new(AtomicUsize::new(0));
    let options = SendOptions {
        endpoint: Some(receiver_endpoint),
        ..Default::default()
    };
    for _ in 0..2 {
        let completed = Arc::clone(&completed);
        sender
            .send(
                Data::Bytes(Arc::new(vec![0xAB; 4096])),
                &options,
                Some(Box::new(move |result, _context| {
                    result.unwrap();
                    completed.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
    }

    // Each send settles exactly once even though the kernel reports a
    // separate zero-copy completion.
    assert!(pump(&proactor, Duration::from_secs(3), || {
        completed.load(Ordering::SeqCst) == 2
    }));
    assert_eq!(completed.load(Ordering::SeqCst), 2);
}
