//! Worker threads and the dispatcher-side handles that own them.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};
use wakecell::sys::Syscall;
use wakecell::{DispatchHandle, WorkerHandle};

use crate::service::{Service, ServiceRpc};
use crate::transport::ServerRpc;
use crate::wire::ServiceTag;

/// What the dispatcher places in a worker's handoff cell.
pub(crate) enum Assignment {
    /// One request plus the handler that will run it.
    Rpc {
        service: Arc<dyn Service>,
        rpc: Box<dyn ServerRpc>,
    },
    /// Sentinel telling the worker loop to break so the thread can join.
    Exit,
}

/// Dispatcher-side handle to one worker thread.
///
/// Owned exclusively by the dispatcher. A worker is created on demand, moves
/// between the idle stack and the busy list, and is destroyed only at engine
/// teardown; the thread itself sees nothing but its half of the handoff
/// cell.
pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) cell: DispatchHandle<Assignment>,
    thread: Option<JoinHandle<()>>,
    /// Position in the busy list, -1 while in the idle stack.
    pub(crate) busy_index: isize,
    /// Tag of the service currently served; valid while busy.
    pub(crate) service_tag: ServiceTag,
    exited: bool,
}

impl Worker {
    pub(crate) fn spawn(id: usize, poll_window: Duration, sys: Arc<dyn Syscall>) -> Worker {
        let (cell, thread_side) = wakecell::pair();
        let thread = thread::Builder::new()
            .name(format!("svc-worker-{id}"))
            .spawn(move || worker_main(thread_side, poll_window, sys))
            .expect("failed to spawn worker thread");
        Worker {
            id,
            cell,
            thread: Some(thread),
            busy_index: -1,
            service_tag: 0,
            exited: false,
        }
    }

    /// Hands the exit sentinel to the thread and joins it. Idempotent; must
    /// only run once the worker has left the busy list.
    pub(crate) fn exit(&mut self, sys: &dyn Syscall) {
        if self.exited {
            return;
        }
        debug_assert!(self.busy_index < 0, "exit() for a busy worker");
        if let Err(err) = self.cell.hand(Assignment::Exit, sys) {
            error!(worker = self.id, "futex wake failed during exit handoff: {err}");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(worker = self.id, "worker thread terminated by panic");
            }
        }
        self.exited = true;
    }
}

/// Per-thread loop: wait for an assignment, run the handler, publish the
/// completion state, repeat until the exit sentinel arrives.
fn worker_main(mut cell: WorkerHandle<Assignment>, poll_window: Duration, sys: Arc<dyn Syscall>) {
    loop {
        cell.await_work(poll_window, sys.as_ref());
        let (state, assignment) = cell.job();
        match assignment {
            Assignment::Exit => {
                debug!("worker exiting");
                break;
            }
            Assignment::Rpc { service, rpc } => {
                let service = Arc::clone(service);
                let mut call = ServiceRpc::new(&mut **rpc, state);
                let outcome = catch_unwind(AssertUnwindSafe(|| service.handle(&mut call)));
                if let Err(panic) = outcome {
                    // Handlers are expected never to panic; surface it after
                    // logging so the thread's panic behavior takes over.
                    error!("service handler panicked");
                    resume_unwind(panic);
                }
            }
        }
        cell.finish();
    }
}
