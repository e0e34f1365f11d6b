//! Datagram load generator.
//!
//! ```text
//! uringnet-blaster <host:port> [count] [size] [rate-bytes-per-sec]
//! ```
//!
//! Sends `count` datagrams of `size` bytes to the target, optionally
//! through a leaky-bucket rate limiter, and reports completions.

use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{error, info};

use uringnet_core::endpoint::Endpoint;
use uringnet_core::endpoint::Transport;
use uringnet_core::options::{Data, SendOptions};
use uringnet_proactor::{Proactor, ProactorConfig};
use uringnet_socket::{DatagramSocket, DatagramSocketOptions, LeakyBucket};

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(target) = args.next() else {
        eprintln!("usage: uringnet-blaster <host:port> [count] [size] [rate]");
        process::exit(2);
    };
    let target: Endpoint = match target.parse() {
        Ok(addr) => Endpoint::Ip(addr),
        Err(_) => {
            eprintln!("bad target address: {}", target);
            process::exit(2);
        }
    };
    let count: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(10_000);
    let size: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(512);
    let rate: Option<u64> = args.next().and_then(|a| a.parse().ok());

    let proactor = match Proactor::new(ProactorConfig::default()) {
        Ok(proactor) => proactor,
        Err(err) => {
            error!("proactor setup failed: {}", err);
            process::exit(1);
        }
    };

    let socket = DatagramSocket::create(Arc::clone(&proactor), DatagramSocketOptions::default());
    socket.open(Transport::UdpIpv4).unwrap_or_else(|err| {
        error!("open failed: {}", err);
        process::exit(1);
    });

    if let Some(rate) = rate {
        socket.set_write_rate_limiter(Some(Box::new(LeakyBucket::new(
            rate,
            rate,
            Instant::now(),
        ))));
        info!("rate limited to {} bytes/sec", rate);
    }

    let payload = Arc::new(vec![0x55u8; size]);
    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let options = SendOptions {
        endpoint: Some(target.clone()),
        ..Default::default()
    };

    let started = Instant::now();
    for _ in 0..count {
        let completed = Arc::clone(&completed);
        let failed = Arc::clone(&failed);
        let failed_sync = Arc::clone(&failed);
        let outcome = socket.send(
            Data::Bytes(Arc::clone(&payload)),
            &options,
            Some(Box::new(move |result, _context| {
                match result {
                    Ok(()) => completed.fetch_add(1, Ordering::Relaxed),
                    Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                };
            })),
        );
        if let Err(err) = outcome {
            error!("send failed synchronously: {}", err);
            failed_sync.fetch_add(1, Ordering::Relaxed);
        }
    }

    let mut waiter = proactor.register_waiter();
    while completed.load(Ordering::Relaxed) + failed.load(Ordering::Relaxed) < count {
        proactor.poll(&mut waiter);
    }
    proactor.deregister_waiter(waiter);

    let elapsed = started.elapsed();
    let ok = completed.load(Ordering::Relaxed);
    info!(
        "{} of {} datagrams to {} in {:.3}s ({:.0} msg/s)",
        ok,
        count,
        target,
        elapsed.as_secs_f64(),
        ok as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
    );
}
