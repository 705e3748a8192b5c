//! Worker pool - runs hashing, decoding, disk I/O and disposal off the
//! interactive thread

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use log::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum WorkerMessage {
    Run(Job),
    Shutdown,
}

/// Count of queued plus running jobs.
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn increment(&self) {
        *self
            .count
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) += 1;
    }

    fn decrement(&self) {
        let mut count = self
            .count
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Fixed set of threads pulling jobs from one shared queue.
pub struct WorkerPool {
    job_tx: Sender<WorkerMessage>,
    num_workers: usize,
    pending: Arc<Pending>,
}

/// Default worker count: available cores, between 2 and 4.
#[must_use]
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(2)
        .clamp(2, 4)
}

impl WorkerPool {
    /// Spawn `num_workers` threads (at least one).
    #[must_use]
    pub fn new(num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);

        // flume channels are MPMC: every worker clones the receiver and pulls
        // from the same queue.
        let (job_tx, job_rx) = flume::unbounded();
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            idle: Condvar::new(),
        });

        for i in 0..num_workers {
            let rx = job_rx.clone();
            let pending = Arc::clone(&pending);
            let spawned = std::thread::Builder::new()
                .name(format!("lfpreview-worker-{i}"))
                .spawn(move || worker_loop(&rx, &pending));
            if let Err(e) = spawned {
                error!("Failed to spawn preview worker {i}: {e}");
            }
        }

        Self {
            job_tx,
            num_workers,
            pending,
        }
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Queue a job. Jobs run in submission order per worker, but many
    /// workers run concurrently.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        self.pending.increment();
        if self.job_tx.send(WorkerMessage::Run(Box::new(job))).is_err() {
            self.pending.decrement();
            error!("Preview worker queue closed, dropping job");
        }
    }

    /// Jobs queued or running right now.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self
            .pending
            .count
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Block until no job is queued or running, or `timeout` passes.
    /// Returns `true` when the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self
            .pending
            .count
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .pending
                .idle
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            count = next;
        }
        true
    }

    /// Ask every worker to exit once the jobs queued before this call ran.
    pub fn shutdown(&self) {
        for _ in 0..self.num_workers {
            let _ = self.job_tx.send(WorkerMessage::Shutdown);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(jobs: &Receiver<WorkerMessage>, pending: &Pending) {
    for message in jobs.iter() {
        match message {
            WorkerMessage::Run(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Preview worker job panicked");
                }
                pending.decrement();
            }
            WorkerMessage::Shutdown => break,
        }
    }
    debug!("Preview worker exiting");
}
