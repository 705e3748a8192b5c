//! Cancellation handles shared between the interactive thread and workers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::error::PreviewError;

type Hook = Box<dyn Fn() + Send>;

#[derive(Default)]
struct Hooks {
    next_id: u64,
    registered: Vec<(u64, Hook)>,
}

struct CancelState {
    cancelled: AtomicBool,
    lock: Mutex<Hooks>,
    signal: Condvar,
}

/// Cloneable cancellation handle.
///
/// Every clone observes the same flag. Once cancelled a token stays
/// cancelled; callers mint a new token for the next request.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(Hooks::default()),
                signal: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        let hooks = {
            let mut guard = self.state.lock();
            self.state.cancelled.store(true, Ordering::SeqCst);
            self.state.signal.notify_all();
            std::mem::take(&mut guard.registered)
        };
        // Hooks run outside the lock; they may take locks of their own.
        for (_, hook) in hooks {
            hook();
        }
    }

    /// Run `hook` once when the token is cancelled, unless the returned
    /// guard is dropped first. Nothing is registered if the token has
    /// already fired.
    pub(crate) fn on_cancel(&self, hook: impl Fn() + Send + 'static) -> CancelHook {
        let mut guard = self.state.lock();
        let id = guard.next_id;
        guard.next_id += 1;
        if !self.is_cancelled() {
            guard.registered.push((id, Box::new(hook)));
        }
        CancelHook {
            state: Arc::clone(&self.state),
            id,
        }
    }

    #[cfg(test)]
    fn hook_count(&self) -> usize {
        self.state.lock().registered.len()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` once the token has fired.
    pub fn checkpoint(&self) -> Result<(), PreviewError> {
        if self.is_cancelled() {
            Err(PreviewError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` when the full interval elapsed, `false` when the token
    /// fired during the wait.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.state.lock();

        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (next, _) = self
                .state
                .signal
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard = next;
        }
    }
}

impl CancelState {
    fn lock(&self) -> std::sync::MutexGuard<'_, Hooks> {
        self.lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Registration from [`CancelToken::on_cancel`]; dropping it unregisters.
pub(crate) struct CancelHook {
    state: Arc<CancelState>,
    id: u64,
}

impl Drop for CancelHook {
    fn drop(&mut self) {
        let id = self.id;
        self.state.lock().registered.retain(|(hook_id, _)| *hook_id != id);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
