//! Closed-loop load generator for the dispatch engine.
//!
//! Run with:
//! ```bash
//! cargo run --release -p svcpool --bin svcpool_bench --features bench-bin -- \
//!     -r 1000000 -s 64 -c 4 -d 8
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::RngCore;

use svcpool::service::{Service, ServiceRpc};
use svcpool::transport::ServerRpc;
use svcpool::wire::{self, REQUEST_HEADER_LEN};
use svcpool::Dispatcher;

#[derive(Parser, Debug)]
#[command(name = "svcpool_bench")]
#[command(about = "Closed-loop load generator for the svcpool engine")]
struct Args {
    /// Number of measured requests
    #[arg(short, long, default_value = "1000000")]
    requests: u64,

    /// Request body size in bytes
    #[arg(short = 's', long, default_value = "64")]
    payload_size: usize,

    /// Concurrency cap for the benchmark service
    #[arg(short = 'c', long, default_value = "4")]
    max_concurrent: usize,

    /// Outstanding requests kept in flight
    #[arg(short = 'd', long, default_value = "8")]
    depth: u64,

    /// Worker poll window in microseconds
    #[arg(long, default_value = "10000")]
    poll_window_us: u64,

    /// Warmup requests excluded from the measurement
    #[arg(short, long, default_value = "10000")]
    warmup: u64,
}

/// Request whose reply delivery just bumps a counter.
struct BenchRpc {
    request: Vec<u8>,
    reply: Vec<u8>,
    delivered: Arc<AtomicUsize>,
}

impl ServerRpc for BenchRpc {
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

/// Folds the request body into a one-byte reply, so each request carries a
/// little real work.
struct ChecksumService;

impl Service for ChecksumService {
    fn handle(&self, rpc: &mut ServiceRpc<'_>) {
        let mut acc = 0u8;
        for byte in &rpc.request()[REQUEST_HEADER_LEN..] {
            acc ^= byte;
        }
        rpc.reply().push(acc);
    }
}

/// Runs `count` requests with at most `depth` outstanding, returning the
/// elapsed wall time.
fn run_closed_loop(
    dispatcher: &mut Dispatcher,
    payload: &[u8],
    delivered: &Arc<AtomicUsize>,
    count: u64,
    depth: u64,
) -> Duration {
    let base = delivered.load(Ordering::Relaxed) as u64;
    let mut submitted = 0u64;
    let start = Instant::now();
    loop {
        let completed = delivered.load(Ordering::Relaxed) as u64 - base;
        if completed >= count {
            break;
        }
        while submitted < count && submitted - completed < depth {
            dispatcher.handle_request(Box::new(BenchRpc {
                request: payload.to_vec(),
                reply: Vec::new(),
                delivered: Arc::clone(delivered),
            }));
            submitted += 1;
        }
        dispatcher.poll();
    }
    start.elapsed()
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut dispatcher = Dispatcher::builder()
        .poll_window(Duration::from_micros(args.poll_window_us))
        .build();
    dispatcher
        .register_service(Arc::new(ChecksumService), 0, args.max_concurrent)
        .expect("service registration");

    let mut body = vec![0u8; args.payload_size];
    rand::thread_rng().fill_bytes(&mut body);
    let payload = wire::encode_request(0, 0, &body);
    let delivered = Arc::new(AtomicUsize::new(0));

    run_closed_loop(&mut dispatcher, &payload, &delivered, args.warmup, args.depth);

    let elapsed = run_closed_loop(
        &mut dispatcher,
        &payload,
        &delivered,
        args.requests,
        args.depth,
    );
    dispatcher.shutdown();

    let secs = elapsed.as_secs_f64();
    let rate = args.requests as f64 / secs;
    let mean_us = elapsed.as_micros() as f64 / args.requests as f64;
    println!(
        "{} requests x {}B, cap {}, depth {}: {:.3}s ({:.0} req/s, {:.2} us/req)",
        args.requests, args.payload_size, args.max_concurrent, args.depth, secs, rate, mean_us
    );
}
