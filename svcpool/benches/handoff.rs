//! Handoff round-trip benchmarks through the worker pool.
//!
//! Run with:
//! ```bash
//! cargo bench --package svcpool --bench handoff
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use svcpool::service::{Service, ServiceRpc};
use svcpool::transport::ServerRpc;
use svcpool::wire::{self, REQUEST_HEADER_LEN};
use svcpool::Dispatcher;

const MESSAGE_SIZE: usize = 32;

/// Request whose reply delivery just bumps a counter.
struct CountedRpc {
    request: Vec<u8>,
    reply: Vec<u8>,
    delivered: Arc<AtomicUsize>,
}

impl ServerRpc for CountedRpc {
    fn request(&self) -> &[u8] {
        &self.request
    }

    fn reply(&mut self) -> &mut Vec<u8> {
        &mut self.reply
    }

    fn epoch_is_set(&self) -> bool {
        true
    }

    fn send_reply(self: Box<Self>) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

struct EchoService;

impl Service for EchoService {
    fn handle(&self, rpc: &mut ServiceRpc<'_>) {
        let body = rpc.request()[REQUEST_HEADER_LEN..].to_vec();
        rpc.reply().extend_from_slice(&body);
    }
}

fn submit(dispatcher: &mut Dispatcher, payload: &[u8], delivered: &Arc<AtomicUsize>) {
    dispatcher.handle_request(Box::new(CountedRpc {
        request: payload.to_vec(),
        reply: Vec::new(),
        delivered: Arc::clone(delivered),
    }));
}

fn benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("svcpool_handoff");
    group.throughput(Throughput::Elements(1));

    // One request at a time: measures the full dispatch → worker → reply
    // round trip, dominated by the inter-thread wake-up cost.
    group.bench_function("pingpong_1worker", |b| {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register_service(Arc::new(EchoService), 0, 1)
            .unwrap();
        let delivered = Arc::new(AtomicUsize::new(0));
        let payload = wire::encode_request(0, 0, &[0u8; MESSAGE_SIZE]);

        // Warm the pool so thread spawn cost stays out of the loop.
        submit(&mut dispatcher, &payload, &delivered);
        while delivered.load(Ordering::Relaxed) < 1 {
            dispatcher.poll();
        }

        b.iter_custom(|iters| {
            let base = delivered.load(Ordering::Relaxed) as u64;
            let start = Instant::now();
            for i in 0..iters {
                submit(&mut dispatcher, &payload, &delivered);
                while (delivered.load(Ordering::Relaxed) as u64) < base + i + 1 {
                    dispatcher.poll();
                }
            }
            start.elapsed()
        });
    });

    // Keeps the service saturated so the wait queue and worker recycling
    // paths stay hot.
    group.bench_function("pipelined_4workers", |b| {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register_service(Arc::new(EchoService), 0, 4)
            .unwrap();
        let delivered = Arc::new(AtomicUsize::new(0));
        let payload = wire::encode_request(0, 0, &[0u8; MESSAGE_SIZE]);
        let depth = 8u64;

        for _ in 0..4 {
            submit(&mut dispatcher, &payload, &delivered);
        }
        while delivered.load(Ordering::Relaxed) < 4 {
            dispatcher.poll();
        }

        b.iter_custom(|iters| {
            let base = delivered.load(Ordering::Relaxed) as u64;
            let mut submitted = 0u64;
            let start = Instant::now();
            loop {
                let completed = delivered.load(Ordering::Relaxed) as u64 - base;
                if completed >= iters {
                    break;
                }
                while submitted < iters && submitted - completed < depth {
                    submit(&mut dispatcher, &payload, &delivered);
                    submitted += 1;
                }
                dispatcher.poll();
            }
            start.elapsed()
        });
    });

    group.finish();
}

criterion_group!(benches, benchmarks);
criterion_main!(benches);
