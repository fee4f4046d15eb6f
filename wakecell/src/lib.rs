//! Single-producer single-consumer handoff cell between a dispatch thread
//! and one worker thread.
//!
//! A cell is a tri-state atomic plus a single assignment slot:
//!
//! ```text
//!   dispatch thread                          worker thread
//!   ───────────────                          ─────────────
//!   hand(job) ──► slot, Working ──────►      await_work() returns
//!                                            job(), handler runs
//!   state() == Postprocessing ◄──────────    StateCell::postprocess()
//!   take() → deliver reply                   (handler keeps running)
//!   state() == Polling ◄─────────────────    finish()
//! ```
//!
//! The common handoff is one atomic exchange and zero syscalls. A worker
//! that has seen no work for its poll window parks itself on the state word
//! through [`sys::Syscall::futex_wait`]; the dispatch side pays for a
//! `futex_wake` only when the exchange reveals the worker actually slept.
//!
//! All request bytes travel through the slot, which is not atomic. Every
//! publication therefore pairs an explicit release fence on the writing side
//! with an explicit acquire fence on the observing side, rather than relying
//! on the ordering of the state operations themselves.

pub mod sys;

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::error;

use crate::sys::Syscall;

/// Worker lifecycle states stored in the cell's futex word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum State {
    /// Idle, spinning for the next assignment (initial state).
    Polling = 0,
    /// An assignment is in the slot and the worker owns it.
    Working = 1,
    /// The handler declared its reply complete but is still running.
    Postprocessing = 2,
    /// Parked on the futex word after an empty poll window.
    Sleeping = 3,
}

impl State {
    fn from_raw(raw: u32) -> State {
        match raw {
            0 => State::Polling,
            1 => State::Working,
            2 => State::Postprocessing,
            3 => State::Sleeping,
            _ => unreachable!("invalid state word {raw}"),
        }
    }
}

/// The tri-state atomic shared by both sides of a cell.
///
/// Handlers receive a reference to it so they can declare a reply complete
/// mid-run; everything else goes through the side handles.
pub struct StateCell {
    raw: AtomicU32,
}

impl StateCell {
    fn new() -> StateCell {
        StateCell {
            raw: AtomicU32::new(State::Polling as u32),
        }
    }

    /// Worker-side transition declaring the reply buffer complete while the
    /// handler keeps running. The release fence publishes every byte written
    /// so far; the dispatch side pairs it with the acquire fence in
    /// [`DispatchHandle::state`].
    #[inline]
    pub fn postprocess(&self) {
        fence(Ordering::Release);
        self.raw.store(State::Postprocessing as u32, Ordering::Relaxed);
    }

    /// The futex word backing this cell.
    pub fn futex_word(&self) -> &AtomicU32 {
        &self.raw
    }
}

struct Shared<T> {
    state: StateCell,
    /// Written by the dispatch side before the `Working` transition; read
    /// and mutated by the worker side only while `Working`; reclaimed by the
    /// dispatch side after observing any other state.
    slot: UnsafeCell<Option<T>>,
}

// Safety: the slot is accessed by exactly one thread at a time; the state
// protocol plus the fence pairs below order every access.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

/// Creates a connected cell, returning the two thread-side handles.
pub fn pair<T: Send>() -> (DispatchHandle<T>, WorkerHandle<T>) {
    let shared = Arc::new(Shared {
        state: StateCell::new(),
        slot: UnsafeCell::new(None),
    });
    (
        DispatchHandle {
            shared: Arc::clone(&shared),
        },
        WorkerHandle { shared },
    )
}

/// Dispatch-thread side of a cell.
pub struct DispatchHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send> DispatchHandle<T> {
    /// Loads the worker state.
    ///
    /// Observing any state other than `Working` issues the acquire fence
    /// pairing with the worker's release store, so the caller also sees
    /// every write the worker made before leaving `Working`.
    #[inline]
    pub fn state(&self) -> State {
        let state = State::from_raw(self.shared.state.raw.load(Ordering::Relaxed));
        if state != State::Working {
            fence(Ordering::Acquire);
        }
        state
    }

    /// Hands an assignment to the worker.
    ///
    /// Must only be called while the worker is idle; the previous assignment
    /// must already have been reclaimed with [`take`](Self::take).
    ///
    /// The handoff itself cannot fail. An `Err` means the wake syscall
    /// failed after handing off to a sleeping worker; the caller should log
    /// it, and a later handoff retries the wake.
    #[inline]
    pub fn hand(&mut self, value: T, sys: &dyn Syscall) -> io::Result<()> {
        // Safety: the worker only touches the slot while Working, and the
        // protocol guarantees the cell is not Working here.
        let slot = unsafe { &mut *self.shared.slot.get() };
        debug_assert!(
            slot.is_none(),
            "handoff to a worker that still holds an assignment"
        );
        *slot = Some(value);
        fence(Ordering::Release);
        let prev = self
            .shared
            .state
            .raw
            .swap(State::Working as u32, Ordering::Relaxed);
        if prev == State::Sleeping as u32 {
            // The worker got tired of polling and parked itself, so release
            // its blocking wait.
            sys.futex_wake(self.shared.state.futex_word(), 1)?;
        }
        Ok(())
    }

    /// Reclaims the assignment, if one is still in the slot.
    ///
    /// Must only be called after [`state`](Self::state) returned a value
    /// other than `Working` for the current assignment.
    #[inline]
    pub fn take(&mut self) -> Option<T> {
        assert_ne!(
            State::from_raw(self.shared.state.raw.load(Ordering::Relaxed)),
            State::Working,
            "take() while the worker owns the slot"
        );
        // Safety: the worker is outside its slot access window and the
        // acquire fence in state() ordered its writes before ours.
        unsafe { (*self.shared.slot.get()).take() }
    }
}

/// Worker-thread side of a cell.
pub struct WorkerHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send> WorkerHandle<T> {
    /// Blocks until the dispatch side hands over an assignment.
    ///
    /// Spins for `poll_window`, then parks on the futex word. The dispatch
    /// thread could flip the state to `Working` just before the park, so the
    /// transition into `Sleeping` is a compare-exchange and the wait is
    /// conditioned on the word still reading `Sleeping`; `EAGAIN` from the
    /// wait means the value had already changed and is benign.
    pub fn await_work(&mut self, poll_window: Duration, sys: &dyn Syscall) {
        let deadline = Instant::now() + poll_window;
        while self.shared.state.raw.load(Ordering::Relaxed) != State::Working as u32 {
            if Instant::now() >= deadline {
                let parked = self.shared.state.raw.compare_exchange(
                    State::Polling as u32,
                    State::Sleeping as u32,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
                if parked.is_ok() {
                    if let Err(err) =
                        sys.futex_wait(self.shared.state.futex_word(), State::Sleeping as u32)
                    {
                        if err.raw_os_error() != Some(libc::EAGAIN) {
                            error!("futex wait failed: {err}");
                        }
                    }
                }
            }
            std::hint::spin_loop();
        }
        fence(Ordering::Acquire);
    }

    /// The current assignment plus the state cell for mid-run transitions.
    ///
    /// Only valid between `await_work` returning and the next
    /// `finish`/`postprocess` transition.
    #[inline]
    pub fn job(&mut self) -> (&StateCell, &mut T) {
        debug_assert_eq!(
            self.shared.state.raw.load(Ordering::Relaxed),
            State::Working as u32,
            "job() outside the Working window"
        );
        // Safety: the cell is Working, so this side has exclusive slot
        // access until it publishes a completion state.
        let value = unsafe { (*self.shared.slot.get()).as_mut() }
            .expect("Working state without an assignment");
        (&self.shared.state, value)
    }

    /// Declares the assignment complete and the worker idle again. The slot
    /// contents stay in place for the dispatch side to reclaim.
    #[inline]
    pub fn finish(&mut self) {
        fence(Ordering::Release);
        self.shared
            .state
            .raw
            .store(State::Polling as u32, Ordering::Relaxed);
    }
}
