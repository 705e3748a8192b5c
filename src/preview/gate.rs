//! Bounded permit pool for heavy native decode sections
//!
//! The gate is shared across every page set and request. It caps how many
//! decoder sections run at once system-wide, no matter how many pages are
//! logically loading.

use std::sync::{Arc, Condvar, Mutex};

use super::cancel::CancelToken;
use super::error::PreviewError;

struct GateState {
    capacity: usize,
    in_use: Mutex<usize>,
    freed: Condvar,
}

/// Cloneable handle to a process-wide permit pool.
#[derive(Clone)]
pub struct ConcurrencyGate {
    state: Arc<GateState>,
}

/// A held slot; released when dropped.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct Permit {
    state: Arc<GateState>,
}

impl ConcurrencyGate {
    /// Create a gate with `capacity` slots (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(GateState {
                capacity: capacity.max(1),
                in_use: Mutex::new(0),
                freed: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    /// Number of free slots right now.
    #[must_use]
    pub fn available(&self) -> usize {
        let in_use = *self
            .state
            .in_use
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.state.capacity.saturating_sub(in_use)
    }

    /// Block until a slot is free or `cancel` fires.
    pub fn acquire(&self, cancel: &CancelToken) -> Result<Permit, PreviewError> {
        // Registered before taking `in_use`: cancel runs hooks outside its
        // own lock, and the hook needs `in_use` to wake the waiters.
        let waker = Arc::clone(&self.state);
        let _hook = cancel.on_cancel(move || {
            let _in_use = waker
                .in_use
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            waker.freed.notify_all();
        });

        let mut in_use = self
            .state
            .in_use
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        loop {
            cancel.checkpoint()?;
            if *in_use < self.state.capacity {
                *in_use += 1;
                return Ok(Permit {
                    state: Arc::clone(&self.state),
                });
            }
            in_use = self
                .state
                .freed
                .wait(in_use)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut in_use = self
            .state
            .in_use
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *in_use < self.state.capacity {
            *in_use += 1;
            Some(Permit {
                state: Arc::clone(&self.state),
            })
        } else {
            None
        }
    }
}

impl std::fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGate")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut in_use = self
            .state
            .in_use
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *in_use = in_use.saturating_sub(1);
        // Wake everyone: a cancelled waiter may consume a single wakeup.
        self.state.freed.notify_all();
    }
}
