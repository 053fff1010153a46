//! Admission control for worker launches.
//!
//! The launcher asks the policy before every spawn. A `Deferred` answer is
//! not an error: the argument stays queued and is offered again on the next
//! polling round.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// What the launcher wants to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Task (or `select`) the worker will resolve.
    pub task: String,
    /// CPU hint from the task's options.
    pub cpus: usize,
}

impl AdmissionRequest {
    pub fn new(task: impl Into<String>, cpus: usize) -> Self {
        Self {
            task: task.into(),
            cpus: cpus.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Deferred,
}

/// Decides whether a worker may start now.
pub trait SchedulerPolicy: Send + Sync {
    fn admit(&self, request: &AdmissionRequest) -> Admission;

    /// A worker admitted for `request` has been joined.
    fn release(&self, _request: &AdmissionRequest) {}

    /// Called first thing inside a freshly forked worker process.
    fn on_worker_start(&self) {}
}

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl SchedulerPolicy for Unbounded {
    fn admit(&self, _request: &AdmissionRequest) -> Admission {
        Admission::Granted
    }
}

/// Caps the summed CPU hints of running workers in this process.
///
/// A request is always admitted when nothing is running, so a task whose
/// hint exceeds the budget still makes progress.
#[derive(Debug)]
pub struct CpuBudget {
    capacity: usize,
    in_use: AtomicUsize,
}

impl CpuBudget {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

impl SchedulerPolicy for CpuBudget {
    fn admit(&self, request: &AdmissionRequest) -> Admission {
        let cpus = request.cpus.max(1);
        let result = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |in_use| {
                (in_use == 0 || in_use + cpus <= self.capacity).then_some(in_use + cpus)
            });
        match result {
            Ok(_) => Admission::Granted,
            Err(in_use) => {
                trace!(task = %request.task, cpus, in_use, capacity = self.capacity, "Deferred");
                Admission::Deferred
            }
        }
    }

    fn release(&self, request: &AdmissionRequest) {
        let cpus = request.cpus.max(1);
        let _ = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |in_use| {
                Some(in_use.saturating_sub(cpus))
            });
    }

    // A forked worker inherits the counter but none of the running workers.
    fn on_worker_start(&self) {
        self.in_use.store(0, Ordering::SeqCst);
    }
}
