//! Kernel wake primitive behind an injectable interface.
//!
//! Handoff cells never invoke the futex syscalls directly; they go through
//! a [`Syscall`] object supplied by the caller, so tests can observe, fail,
//! or replace the wake primitive. The object is passed per engine rather
//! than installed process-wide.

use std::io;
use std::sync::atomic::AtomicU32;

/// System-call surface used by the handoff cells.
pub trait Syscall: Send + Sync {
    /// Blocks the calling thread while `word` equals `expected`.
    ///
    /// Returns promptly once another thread wakes the word or the value no
    /// longer matches. `EAGAIN` means the value had already changed when the
    /// wait was attempted; callers treat it as benign.
    fn futex_wait(&self, word: &AtomicU32, expected: u32) -> io::Result<()>;

    /// Wakes up to `waiters` threads blocked on `word`, returning the number
    /// actually woken.
    fn futex_wake(&self, word: &AtomicU32, waiters: u32) -> io::Result<usize>;
}

/// Production implementation: process-private Linux futexes.
#[derive(Clone, Copy, Debug, Default)]
pub struct FutexSyscall;

#[cfg(target_os = "linux")]
impl Syscall for FutexSyscall {
    fn futex_wait(&self, word: &AtomicU32, expected: u32) -> io::Result<()> {
        // The kernel re-checks the word under its queue lock, so there is no
        // window between the caller's compare-exchange and the sleep.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                std::ptr::null::<libc::timespec>(),
            )
        };
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn futex_wake(&self, word: &AtomicU32, waiters: u32) -> io::Result<usize> {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                waiters,
            )
        };
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }
}
