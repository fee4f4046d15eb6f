//! svcpool - RPC service dispatch and worker-pool engine.
//!
//! Routes fully-assembled requests from a transport to registered services,
//! enforces a per-service concurrency cap, runs handlers on a grow-on-demand
//! pool of worker threads, and delivers every reply from the single dispatch
//! thread.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Dispatcher                             │
//! │  ┌─────────────┐  ┌────────────────┐  ┌───────────────────────┐  │
//! │  │  services   │  │  busy workers  │  │  idle worker stack    │  │
//! │  │ [tag→slot]  │  │  (swap-remove) │  │  (most recent first)  │  │
//! │  └─────────────┘  └────────────────┘  └───────────────────────┘  │
//! │                                                                  │
//! │  handle_request() → admit / queue     poll() → reply / recycle   │
//! └──────────────────────────────────────────────────────────────────┘
//!             │ handoff cell per worker (wakecell)    ▲
//!             ▼                                       │ state transitions
//!       ┌──────────┐    ┌──────────┐    ┌──────────┐
//!       │  Worker  │    │  Worker  │    │  Worker  │   one OS thread each
//!       └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! The dispatch thread owns every engine-level structure and never blocks.
//! The only cross-thread state is each worker's handoff cell, so the common
//! handoff costs one atomic exchange and no syscalls; a worker idle beyond
//! its poll window parks on the wake primitive and is woken on the next
//! handoff.

pub mod error;
pub mod service;
pub mod transport;
pub mod wire;

mod worker;

pub use service::{Service, ServiceRpc};
pub use transport::ServerRpc;
pub use wakecell::sys;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use wakecell::sys::{FutexSyscall, Syscall};
use wakecell::State;

use error::{Error, Result};
use service::ServiceSlot;
use wire::{ServiceTag, Status, MAX_SERVICES};
use worker::{Assignment, Worker};

/// How long a worker keeps polling for new work before parking itself on
/// the wake primitive. Much longer than a typical request round trip, so a
/// worker in an ongoing conversation with one client never sleeps, and much
/// longer than the wake-up latency (tens of microseconds), so sleeping pays
/// off only under real idleness.
pub const DEFAULT_POLL_WINDOW: Duration = Duration::from_millis(10);

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Busy-wait window before an idle worker parks on the wake primitive.
    pub poll_window: Duration,
    /// Idle-stack capacity reserved up front, for deployments that know
    /// their steady-state worker count.
    pub idle_reserve: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            poll_window: DEFAULT_POLL_WINDOW,
            idle_reserve: 0,
        }
    }
}

/// Builder for a [`Dispatcher`].
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    sys: Arc<dyn Syscall>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        DispatcherBuilder {
            config: DispatcherConfig::default(),
            sys: Arc::new(FutexSyscall),
        }
    }
}

impl DispatcherBuilder {
    /// Create a new dispatcher builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the worker poll window.
    pub fn poll_window(mut self, poll_window: Duration) -> Self {
        self.config.poll_window = poll_window;
        self
    }

    /// Reserve idle-stack capacity for the expected worker count.
    pub fn idle_reserve(mut self, idle_reserve: usize) -> Self {
        self.config.idle_reserve = idle_reserve;
        self
    }

    /// Replace the wake primitive, e.g. with a recording mock in tests.
    pub fn syscall(mut self, sys: Arc<dyn Syscall>) -> Self {
        self.sys = sys;
        self
    }

    /// Build the dispatcher.
    pub fn build(self) -> Dispatcher {
        Dispatcher {
            services: std::array::from_fn(|_| None),
            service_count: 0,
            busy: Vec::new(),
            idle: Vec::with_capacity(self.config.idle_reserve),
            test_rpcs: VecDeque::new(),
            poll_window: self.config.poll_window,
            sys: self.sys,
            next_worker_id: 0,
        }
    }
}

/// The dispatch engine. All methods must be called from one thread, the
/// dispatch thread, which also owns the poll loop.
pub struct Dispatcher {
    /// Registered services, indexed by wire tag. Write-once per slot.
    services: [Option<ServiceSlot>; MAX_SERVICES],
    service_count: usize,
    /// Workers currently executing or post-processing a request. Order is
    /// immaterial; removal is swap-remove.
    busy: Vec<Worker>,
    /// Idle workers, most recently idled on top: its stack and cell are the
    /// warmest.
    idle: Vec<Worker>,
    /// Requests captured when no services are registered, for isolated
    /// transport tests.
    test_rpcs: VecDeque<Box<dyn ServerRpc>>,
    poll_window: Duration,
    sys: Arc<dyn Syscall>,
    next_worker_id: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create a dispatcher with default configuration.
    pub fn new() -> Dispatcher {
        Self::builder().build()
    }

    /// Create a dispatcher builder.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Installs `service` at `tag`; incoming requests carrying that tag in
    /// their header are dispatched to it, with at most `max_concurrent`
    /// executing simultaneously.
    ///
    /// Registration is write-once per tag and happens during setup, before
    /// traffic begins.
    pub fn register_service(
        &mut self,
        service: Arc<dyn Service>,
        tag: ServiceTag,
        max_concurrent: usize,
    ) -> Result<()> {
        let index = tag as usize;
        if index >= MAX_SERVICES {
            return Err(Error::TagOutOfRange(tag));
        }
        if max_concurrent == 0 {
            return Err(Error::ZeroConcurrency(tag));
        }
        if self.services[index].is_some() {
            return Err(Error::TagInUse(tag));
        }
        self.services[index] = Some(ServiceSlot {
            service,
            max_concurrent,
            in_flight: 0,
            wait_queue: VecDeque::new(),
        });
        self.service_count += 1;
        Ok(())
    }

    /// Entry point for the transport: takes ownership of a ready request
    /// and arranges for it to be serviced and replied to.
    ///
    /// Requests with an unusable header are answered immediately with a
    /// synthetic error reply. Requests for a saturated service are queued in
    /// arrival order. Everything else is handed to an idle worker, spawning
    /// a new one if the pool is empty.
    pub fn handle_request(&mut self, mut rpc: Box<dyn ServerRpc>) {
        assert!(rpc.epoch_is_set(), "request delivered without its epoch set");

        let tag = match wire::request_service_tag(rpc.request()) {
            Some(tag) => tag,
            None => {
                warn!(
                    len = rpc.request().len(),
                    "incoming request too short for a header"
                );
                wire::prepare_error_response(rpc.reply(), Status::MessageTooShort);
                rpc.send_reply();
                return;
            }
        };

        let index = tag as usize;
        if index >= MAX_SERVICES || self.services[index].is_none() {
            if self.service_count == 0 {
                // With nothing registered, park the request for synchronous
                // pickup; isolated transport tests drive this path.
                self.test_rpcs.push_back(rpc);
                return;
            }
            warn!(service = tag, "incoming request for unavailable service");
            wire::prepare_error_response(rpc.reply(), Status::ServiceNotAvailable);
            rpc.send_reply();
            return;
        }

        let slot = self.services[index]
            .as_mut()
            .expect("service slot checked above");
        if slot.in_flight == slot.max_concurrent {
            slot.wait_queue.push_back(rpc);
            return;
        }
        slot.in_flight += 1;
        let service = Arc::clone(&slot.service);

        let mut worker = match self.idle.pop() {
            Some(worker) => worker,
            None => {
                let id = self.next_worker_id;
                self.next_worker_id += 1;
                Worker::spawn(id, self.poll_window, Arc::clone(&self.sys))
            }
        };
        worker.service_tag = tag;
        if let Err(err) = worker.cell.hand(Assignment::Rpc { service, rpc }, self.sys.as_ref()) {
            error!(worker = worker.id, "futex wake failed during handoff: {err}");
        }
        worker.busy_index = self.busy.len() as isize;
        self.busy.push(worker);
    }

    /// Checks every busy worker for a state transition: delivers replies,
    /// hands queued work to freed workers, and recycles the rest onto the
    /// idle stack.
    ///
    /// Call this repeatedly from the dispatch thread's poll loop. Iteration
    /// runs tail to head so the swap-removal of a finished worker never
    /// rearranges indices still to be visited.
    pub fn poll(&mut self) {
        for index in (0..self.busy.len()).rev() {
            debug_assert_eq!(self.busy[index].busy_index, index as isize);
            let state = self.busy[index].cell.state();
            if state == State::Working {
                continue;
            }

            // Whatever else the worker is doing, an unreclaimed request
            // means its reply has not gone out yet; send it now.
            if let Some(assignment) = self.busy[index].cell.take() {
                match assignment {
                    Assignment::Rpc { rpc, .. } => rpc.send_reply(),
                    Assignment::Exit => unreachable!("exit sentinel handed to a busy worker"),
                }
            }

            if state == State::Postprocessing {
                // Reply is out but the handler is still running; the worker
                // stays in the busy list until it reaches Polling.
                continue;
            }

            let tag = self.busy[index].service_tag as usize;
            let slot = self.services[tag]
                .as_mut()
                .expect("busy worker bound to an unregistered service");
            if let Some(next) = slot.wait_queue.pop_front() {
                // Work is waiting for this service; reuse the worker without
                // touching the busy list.
                let service = Arc::clone(&slot.service);
                let worker = &mut self.busy[index];
                if let Err(err) = worker
                    .cell
                    .hand(Assignment::Rpc { service, rpc: next }, self.sys.as_ref())
                {
                    error!(worker = worker.id, "futex wake failed during handoff: {err}");
                }
            } else {
                slot.in_flight -= 1;
                let mut worker = self.busy.swap_remove(index);
                worker.busy_index = -1;
                if index < self.busy.len() {
                    self.busy[index].busy_index = index as isize;
                }
                self.idle.push(worker);
            }
        }
    }

    /// True when no worker is executing or post-processing a request.
    ///
    /// A `true` result also guarantees the caller sees every memory write
    /// made by previously-busy workers: the poll that retired each worker
    /// issued the pairing acquire fence.
    pub fn is_idle(&self) -> bool {
        self.busy.is_empty()
    }

    /// Waits for a request to arrive in the zero-services sink, spinning
    /// the poll loop until `timeout` elapses.
    ///
    /// Only meaningful while no services are registered.
    pub fn wait_for_request(&mut self, timeout: Duration) -> Option<Box<dyn ServerRpc>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(rpc) = self.test_rpcs.pop_front() {
                return Some(rpc);
            }
            if Instant::now() >= deadline {
                return None;
            }
            self.poll();
        }
    }

    /// Number of requests currently executing for `tag`.
    pub fn in_flight(&self, tag: ServiceTag) -> usize {
        self.services
            .get(tag as usize)
            .and_then(Option::as_ref)
            .map_or(0, |slot| slot.in_flight)
    }

    /// Number of requests held back by `tag`'s concurrency cap.
    pub fn queued(&self, tag: ServiceTag) -> usize {
        self.services
            .get(tag as usize)
            .and_then(Option::as_ref)
            .map_or(0, |slot| slot.wait_queue.len())
    }

    /// Workers currently executing or post-processing a request.
    pub fn busy_workers(&self) -> usize {
        self.busy.len()
    }

    /// Workers parked in the idle pool.
    pub fn idle_workers(&self) -> usize {
        self.idle.len()
    }

    /// Drains all in-flight and queued work, then exits and joins every
    /// worker thread. Also runs on drop.
    pub fn shutdown(&mut self) {
        while !self.busy.is_empty() {
            self.poll();
        }
        for mut worker in self.idle.drain(..) {
            worker.exit(self.sys.as_ref());
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
