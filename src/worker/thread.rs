//! Thread-based workers.
//!
//! Threads share the initiator's address space, so nothing is serialized on
//! the way back. A thread cannot be killed: terminating one cancels its
//! [`CancelToken`], which stops its nested waiters and launches, and joining
//! it blocks until its current task function returns.

use super::channel::{ResultSender, slot_channel};
use super::signals::TerminationReason;
use super::{CancelToken, Executor, LaunchedWorker, WorkerHandle, WorkerJob};
use crate::error::{EngineError, Result};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, warn};

/// Runs each argument on its own OS thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadExecutor;

impl ThreadExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for ThreadExecutor {
    fn name(&self) -> &'static str {
        "thread"
    }

    fn spawn(&self, job: WorkerJob) -> Result<LaunchedWorker> {
        let label = job.label().to_string();
        let name = format!("entangle-{}-{}", label, job.position());
        let cancel = job.cancel_token();
        let (mut sender, receiver) = slot_channel(&label);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || sender.put(job.run()))
            .map_err(|e| EngineError::launch(&label, e))?;
        debug!(thread = %name, "Started worker thread");

        Ok(LaunchedWorker {
            handle: Box::new(ThreadHandle {
                name,
                cancel,
                handle: Some(handle),
                outcome: None,
            }),
            channel: Box::new(receiver),
        })
    }
}

struct ThreadHandle {
    name: String,
    cancel: CancelToken,
    handle: Option<JoinHandle<Result<()>>>,
    outcome: Option<TerminationReason>,
}

impl WorkerHandle for ThreadHandle {
    fn id(&self) -> String {
        self.name.clone()
    }

    fn terminate(&mut self) -> Result<()> {
        if self.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!(thread = %self.name, "Cancelling worker thread");
            self.cancel.cancel();
        }
        Ok(())
    }

    fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if self.handle.as_ref().is_some_and(|h| h.is_finished()) {
            return self.join().map(Some);
        }
        Ok(self.outcome.clone())
    }

    fn join(&mut self) -> Result<TerminationReason> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }
        let Some(handle) = self.handle.take() else {
            return Ok(TerminationReason::Unknown);
        };
        let started = Instant::now();
        let joined = handle.join();
        if self.cancel.is_cancelled() {
            let waited_ms = started.elapsed().as_millis() as u64;
            if waited_ms > 1000 {
                warn!(thread = %self.name, waited_ms, "Cancelled worker thread was slow to return");
            }
        }
        let outcome = match joined {
            Ok(Ok(())) => TerminationReason::Finished,
            Ok(Err(e)) => return Err(e),
            Err(_) => TerminationReason::Panicked,
        };
        self.outcome = Some(outcome.clone());
        Ok(outcome)
    }
}
