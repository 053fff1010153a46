//! Worker launcher: one worker per pending argument of a thunk.
//!
//! A [`WorkerBatch`] owns every worker started for one thunk. Concrete
//! arguments get a [`ReadySlot`] and no worker; thunk and select arguments
//! are queued and launched in argument order as the scheduler admits them.
//! Every worker is joined exactly once, either when its value arrives or
//! during [`WorkerBatch::shutdown`], which also runs on drop.

use crate::error::{EngineError, Result};
use crate::runtime::{Resolution, ResolutionReport};
use crate::scheduler::{Admission, AdmissionRequest, SchedulerPolicy};
use crate::thunk::Arg;
use crate::waiter::{Pollable, Progress};
use crate::worker::channel::ReadySlot;
use crate::worker::{
    Received, ResultChannel, TerminationReason, WorkerHandle, WorkerJob,
};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Bookkeeping for one spawned worker.
pub struct WorkerRecord {
    id: String,
    task: String,
    position: usize,
    started: Instant,
    request: AdmissionRequest,
    admitted: bool,
    handle: Box<dyn WorkerHandle>,
    joined: bool,
}

impl WorkerRecord {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Join the worker once and return its admission to the policy.
    fn join(
        &mut self,
        policy: &dyn SchedulerPolicy,
        report: &mut ResolutionReport,
    ) -> Result<TerminationReason> {
        let reason = self.handle.join()?;
        if reason == TerminationReason::StillAlive {
            warn!(worker = %self.id, task = %self.task, "Worker still running after join");
            return Ok(reason);
        }
        if !self.joined {
            self.joined = true;
            if self.admitted {
                policy.release(&self.request);
            }
            report.joined += 1;
            debug!(
                worker = %self.id,
                task = %self.task,
                position = self.position,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                %reason,
                "Joined worker"
            );
        }
        Ok(reason)
    }
}

enum Slot {
    /// Waiting for scheduler admission.
    Queued(Arg),
    /// Channel to poll; `worker` is `None` for concrete arguments.
    Waiting {
        channel: Box<dyn ResultChannel>,
        worker: Option<WorkerRecord>,
    },
    Resolved(Value),
}

/// All workers started for the arguments of one thunk.
pub struct WorkerBatch {
    task: String,
    slots: Vec<Slot>,
    resolution: Resolution,
    report: ResolutionReport,
}

impl WorkerBatch {
    /// Partition `args` and launch whatever the scheduler admits right away.
    ///
    /// On a launch failure every worker already started is terminated and
    /// joined before the error is returned.
    pub(crate) fn launch(task: &str, args: &[Arg], resolution: Resolution) -> Result<Self> {
        let slots = args
            .iter()
            .map(|arg| match arg {
                Arg::Value(value) => Slot::Waiting {
                    channel: Box::new(ReadySlot::new(value.clone())),
                    worker: None,
                },
                pending => Slot::Queued(pending.clone()),
            })
            .collect();

        let mut batch = Self {
            task: task.to_string(),
            slots,
            resolution,
            report: ResolutionReport::default(),
        };
        batch.admit_queued()?;
        Ok(batch)
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn report(&self) -> ResolutionReport {
        self.report
    }

    /// Workers spawned and not yet joined.
    pub fn running(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                matches!(slot, Slot::Waiting { worker: Some(record), .. } if !record.joined)
            })
            .count()
    }

    /// Arguments still waiting for admission.
    pub fn queued(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Queued(_)))
            .count()
    }

    /// Launch queued arguments in order until the policy defers one.
    fn admit_queued(&mut self) -> Result<()> {
        if self.resolution.is_cancelled() {
            return Ok(());
        }
        for position in 0..self.slots.len() {
            let Slot::Queued(arg) = &self.slots[position] else {
                continue;
            };
            let arg = arg.clone();
            let cpus = arg.options().map_or(1, |options| options.cpus);
            let request = AdmissionRequest::new(arg.label(), cpus);

            let policy = self.resolution.policy();
            let admitted = match policy.admit(&request) {
                Admission::Granted => true,
                // Inside a worker the budget is held by ancestors waiting on us.
                Admission::Deferred if self.resolution.depth() > 0 && self.running() == 0 => {
                    trace!(task = %self.task, position, worker = %request.task, "Launching past exhausted budget");
                    false
                }
                Admission::Deferred => {
                    trace!(task = %self.task, position, worker = %request.task, "Launch deferred");
                    break;
                }
            };

            let executor = arg
                .options()
                .and_then(|options| options.executor.clone())
                .unwrap_or_else(|| self.resolution.default_executor());
            let job = WorkerJob::new(position, arg, self.resolution.clone());

            let launched = match executor.spawn(job) {
                Ok(launched) => launched,
                Err(e) => {
                    if admitted {
                        policy.release(&request);
                    }
                    let e = match e {
                        EngineError::LaunchFailure { .. } => e,
                        other => EngineError::launch(&request.task, other),
                    };
                    warn!(task = %self.task, position, error = %e, "Launch failed");
                    self.shutdown();
                    return Err(e);
                }
            };

            let id = launched.handle.id();
            debug!(
                task = %self.task,
                position,
                worker = %id,
                executor = executor.name(),
                "Launched worker"
            );
            self.report.spawned += 1;
            self.slots[position] = Slot::Waiting {
                channel: launched.channel,
                worker: Some(WorkerRecord {
                    id,
                    task: request.task.clone(),
                    position,
                    started: Instant::now(),
                    request,
                    admitted,
                    handle: launched.handle,
                    joined: false,
                }),
            };
        }
        Ok(())
    }

    /// One round: admit queued arguments, then read every channel once.
    pub fn poll(&mut self) -> Result<Progress> {
        self.admit_queued()?;

        let policy = self.resolution.policy();
        let mut pending = 0;
        for slot in self.slots.iter_mut() {
            let Slot::Waiting { channel, worker } = slot else {
                if matches!(slot, Slot::Queued(_)) {
                    pending += 1;
                }
                continue;
            };

            let mut received = channel.try_get()?;
            if received == Received::Empty
                && let Some(record) = worker.as_mut()
                && record.handle.try_wait()?.is_some()
            {
                // The worker is gone, so anything it wrote is already readable
                // even if another process still holds the write end open.
                received = match channel.try_get()? {
                    Received::Empty => Received::Closed,
                    other => other,
                };
            }

            match received {
                Received::Empty => pending += 1,
                Received::Value { value, report } => {
                    self.report.absorb(&report);
                    if let Some(record) = worker.as_mut() {
                        record.join(policy, &mut self.report)?;
                    }
                    channel.finish()?;
                    *slot = Slot::Resolved(value);
                }
                Received::Failed(failure) => return Err(failure.into()),
                Received::Closed => {
                    let Some(record) = worker.as_mut() else {
                        return Err(EngineError::ChannelProtocolViolation {
                            task: self.task.clone(),
                        });
                    };
                    let reason = record.join(policy, &mut self.report)?;
                    return Err(EngineError::invocation(
                        record.task(),
                        format!("worker {} {} without a result", record.id(), reason),
                    ));
                }
            }
        }

        if pending == 0 {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Pending(pending))
        }
    }

    /// Terminate and join every worker that is still outstanding.
    pub fn shutdown(&mut self) {
        let policy = self.resolution.policy();
        for slot in self.slots.iter_mut() {
            let Slot::Waiting {
                worker: Some(record),
                ..
            } = slot
            else {
                continue;
            };
            if record.joined {
                continue;
            }
            warn!(task = %self.task, worker = %record.id, position = record.position, "Terminating worker");
            if let Err(e) = record.handle.terminate() {
                warn!(worker = %record.id, error = %e, "Failed to terminate worker");
            }
            if let Err(e) = record.join(policy, &mut self.report) {
                warn!(worker = %record.id, error = %e, "Failed to join worker");
            }
        }
    }

    /// Resolved arguments in construction order, plus the batch report.
    pub fn into_values(mut self) -> Result<(Vec<Value>, ResolutionReport)> {
        let slots = std::mem::take(&mut self.slots);
        let mut values = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Slot::Resolved(value) => values.push(value),
                _ => {
                    return Err(EngineError::invocation(
                        &self.task,
                        "arguments requested before resolution finished",
                    ));
                }
            }
        }
        Ok((values, self.report))
    }
}

impl Pollable for WorkerBatch {
    fn task(&self) -> &str {
        &self.task
    }

    fn step(&mut self) -> Result<Progress> {
        self.poll()
    }

    fn cancelled(&self) -> bool {
        self.resolution.is_cancelled()
    }
}

impl Drop for WorkerBatch {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerBatch")
            .field("task", &self.task)
            .field("args", &self.slots.len())
            .field("running", &self.running())
            .field("queued", &self.queued())
            .field("report", &self.report)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::CpuBudget;

    /// Handle whose join keeps answering with a fixed reason.
    struct Scripted(TerminationReason);

    impl WorkerHandle for Scripted {
        fn id(&self) -> String {
            "scripted".into()
        }

        fn terminate(&mut self) -> Result<()> {
            Ok(())
        }

        fn join(&mut self) -> Result<TerminationReason> {
            Ok(self.0.clone())
        }
    }

    fn record(reason: TerminationReason) -> WorkerRecord {
        WorkerRecord {
            id: "scripted".into(),
            task: "leaf".into(),
            position: 0,
            started: Instant::now(),
            request: AdmissionRequest::new("leaf", 1),
            admitted: true,
            handle: Box::new(Scripted(reason)),
            joined: false,
        }
    }

    #[test]
    fn test_join_counts_once_and_releases() {
        let budget = CpuBudget::new(1);
        assert_eq!(budget.admit(&AdmissionRequest::new("leaf", 1)), Admission::Granted);
        let mut report = ResolutionReport::default();
        let mut worker = record(TerminationReason::Exited(0));

        worker.join(&budget, &mut report).unwrap();
        worker.join(&budget, &mut report).unwrap();
        assert_eq!(report.joined, 1);
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn test_still_running_worker_is_not_joined() {
        let budget = CpuBudget::new(1);
        assert_eq!(budget.admit(&AdmissionRequest::new("leaf", 1)), Admission::Granted);
        let mut report = ResolutionReport::default();
        let mut worker = record(TerminationReason::StillAlive);

        let reason = worker.join(&budget, &mut report).unwrap();
        assert_eq!(reason, TerminationReason::StillAlive);
        assert!(!worker.joined);
        assert_eq!(report.joined, 0);
        assert_eq!(budget.in_use(), 1);
    }
}
