use std::cell::Cell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use tracing::debug;

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

thread_local! {
    /// Address of the guard whose initializer runs on this thread.
    static RUNNING: Cell<usize> = const { Cell::new(0) };
}

/// Observable phase of an [`InitGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Uninitialized,
    Initializing,
    Ready,
}

/// What a call to [`InitGuard::run_once`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// This caller won the transition and ran the initializer.
    Ran,
    /// Re-entrant call made by the initializer itself, on its own thread.
    InProgress,
    /// Another thread was running the initializer; this caller blocked until
    /// it finished.
    Waited,
    /// Initialization already finished; nothing to do.
    AlreadyReady,
}

/// Process-wide one-shot initialization state.
///
/// The transition `Uninitialized -> Initializing` is a single
/// compare-and-set, so two threads racing through the bootstrap hook can
/// never both run the initializer. Losers on other threads block until the
/// winner is done; only the initializing thread itself is let through early.
pub struct InitGuard {
    state: AtomicU8,
    lock: Mutex<()>,
    ready: Condvar,
}

/// Publishes `Ready` when the initializer returns or unwinds.
struct Finish<'a> {
    guard: &'a InitGuard,
    previous: usize,
}

impl Drop for Finish<'_> {
    fn drop(&mut self) {
        self.guard.state.store(READY, Ordering::Release);
        RUNNING.set(self.previous);

        let _lock = self.guard.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.guard.ready.notify_all();
    }
}

impl InitGuard {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
            lock: Mutex::new(()),
            ready: Condvar::new(),
        }
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    fn wait_ready(&self) {
        let mut lock = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_ready() {
            lock = self.ready.wait(lock).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn phase(&self) -> InitPhase {
        match self.state.load(Ordering::Acquire) {
            UNINITIALIZED => InitPhase::Uninitialized,
            INITIALIZING => InitPhase::Initializing,
            _ => InitPhase::Ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    /// Run `init` if and only if nobody has run it before.
    ///
    /// The guard moves to `Ready` once `init` returns, whatever its result:
    /// a failed initializer is expected to terminate the process, and a
    /// second attempt would only repeat half-applied side effects.
    pub fn run_once<T>(&self, init: impl FnOnce() -> T) -> (InitOutcome, Option<T>) {
        match self.state.compare_exchange(
            UNINITIALIZED,
            INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                debug!("Bootstrap: running one-shot initialization");
                let _finish = Finish {
                    guard: self,
                    previous: RUNNING.replace(self.id()),
                };
                (InitOutcome::Ran, Some(init()))
            }
            Err(INITIALIZING) if RUNNING.get() == self.id() => (InitOutcome::InProgress, None),
            Err(INITIALIZING) => {
                debug!("Bootstrap: waiting for initialization on another thread");
                self.wait_ready();
                (InitOutcome::Waited, None)
            }
            Err(_) => (InitOutcome::AlreadyReady, None),
        }
    }
}

impl Default for InitGuard {
    fn default() -> Self {
        Self::new()
    }
}
