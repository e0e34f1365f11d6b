//! Hot-path benchmarks: submission preparation and endpoint encoding.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use uringnet_core::endpoint::Endpoint;
use uringnet_core::event::EventPool;
use uringnet_core::options::{Data, SendOptions};
use uringnet_core::socket::ProactorSocket;
use uringnet_ring::Submission;

struct BenchSocket;

impl ProactorSocket for BenchSocket {
    fn handle(&self) -> RawFd {
        3
    }
    fn set_proactor_context(&self, _: Option<Arc<dyn Any + Send + Sync>>) {}
    fn proactor_context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }
}

fn bench_prepare_send(c: &mut Criterion) {
    let pool = EventPool::new(8);
    let socket: Arc<dyn ProactorSocket> = Arc::new(BenchSocket);
    let payload = Data::Bytes(Arc::new(vec![0u8; 1400]));
    let options = SendOptions {
        endpoint: Some(Endpoint::Ip("127.0.0.1:9000".parse().unwrap())),
        ..Default::default()
    };

    c.bench_function("prepare_send_1400", |b| {
        b.iter(|| {
            let mut event = pool.allocate();
            let mut entry = Submission::new();
            entry
                .prepare_send(&mut event, &socket, 3, payload.clone(), &options)
                .unwrap();
            pool.recycle(event);
        })
    });
}

fn bench_endpoint_encode(c: &mut Criterion) {
    let endpoint = Endpoint::Ip("[fe80::1]:443".parse().unwrap());

    c.bench_function("endpoint_encode_decode", |b| {
        b.iter(|| {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let length = endpoint.encode(&mut storage).unwrap();
            Endpoint::decode(&storage, length).unwrap()
        })
    });
}

criterion_group!(benches, bench_prepare_send, bench_endpoint_encode);
criterion_main!(benches);
