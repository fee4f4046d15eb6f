//! Service handler contract and per-service accounting.

use std::collections::VecDeque;
use std::sync::Arc;

use wakecell::StateCell;

use crate::transport::ServerRpc;

/// Business logic behind one service tag.
///
/// Handlers run on worker threads. They must be re-entrant across workers,
/// are never invoked concurrently on the same worker, and must not retain
/// pointers into the request or reply buffers beyond return.
pub trait Service: Send + Sync {
    /// Executes one request.
    ///
    /// Returning delivers the reply. Call [`ServiceRpc::send_reply`] first
    /// to have the reply go out while the handler keeps running.
    fn handle(&self, rpc: &mut ServiceRpc<'_>);
}

/// Handler-side view of one request.
pub struct ServiceRpc<'a> {
    rpc: Option<&'a mut dyn ServerRpc>,
    state: &'a StateCell,
}

impl<'a> ServiceRpc<'a> {
    pub(crate) fn new(rpc: &'a mut dyn ServerRpc, state: &'a StateCell) -> ServiceRpc<'a> {
        ServiceRpc {
            rpc: Some(rpc),
            state,
        }
    }

    /// The request payload, header included.
    ///
    /// # Panics
    ///
    /// After [`send_reply`](Self::send_reply): from that point the buffers
    /// belong to the dispatch thread.
    pub fn request(&self) -> &[u8] {
        self.rpc
            .as_ref()
            .expect("request() after send_reply()")
            .request()
    }

    /// The reply payload under construction.
    ///
    /// # Panics
    ///
    /// After [`send_reply`](Self::send_reply).
    pub fn reply(&mut self) -> &mut Vec<u8> {
        self.rpc
            .as_mut()
            .expect("reply() after send_reply()")
            .reply()
    }

    /// Declares the reply complete while the handler keeps running.
    ///
    /// The dispatch thread delivers the reply on its next poll, overlapping
    /// it with whatever post-processing the handler still has to do. The
    /// buffer accessors on this handle are dead afterwards. Calling this
    /// again is a no-op; not calling it at all is the common case, where the
    /// reply goes out when the handler returns.
    pub fn send_reply(&mut self) {
        if self.rpc.take().is_some() {
            self.state.postprocess();
        }
    }
}

/// Registry entry: one registered service plus its concurrency accounting.
/// Mutated only on the dispatch thread.
pub(crate) struct ServiceSlot {
    pub(crate) service: Arc<dyn Service>,
    /// Upper bound on simultaneously executing requests for this service.
    pub(crate) max_concurrent: usize,
    /// Requests currently handed to workers. Never exceeds `max_concurrent`,
    /// and equals it whenever `wait_queue` is non-empty.
    pub(crate) in_flight: usize,
    /// Arrival-order backlog held back by the concurrency cap.
    pub(crate) wait_queue: VecDeque<Box<dyn ServerRpc>>,
}
