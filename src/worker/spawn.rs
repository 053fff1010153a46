//! Fork-based worker processes.
//!
//! The worker is a `fork()` of the initiator: it inherits the thunk graph,
//! the runtime and the shared memory manager without any serialization, and
//! only its result crosses back over a pipe as one JSON line.

use super::channel::{PipeSender, ResultSender, pipe_channel};
use super::proc::Proc;
use super::signals::{EXIT_CHANNEL_ERROR, EXIT_OK, EXIT_ORPHANED, TerminationReason};
use super::{Executor, LaunchedWorker, WorkerHandle, WorkerJob};
use crate::error::{EngineError, Result};
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::{ForkResult, Pid, fork, getpid, getppid};
use std::time::Duration;
use tracing::{debug, warn};

/// Time a worker gets to exit after SIGTERM before it is killed.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_millis(100);

/// Runs each argument in a forked child process.
#[derive(Debug, Clone)]
pub struct ForkExecutor {
    grace: Duration,
}

impl Default for ForkExecutor {
    fn default() -> Self {
        Self {
            grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

impl ForkExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl Executor for ForkExecutor {
    fn name(&self) -> &'static str {
        "fork"
    }

    fn spawn(&self, job: WorkerJob) -> Result<LaunchedWorker> {
        let label = job.label().to_string();
        let (sender, receiver) =
            pipe_channel(&label).map_err(|e| EngineError::launch(&label, e))?;
        let parent = getpid();

        // Safety: the child only runs the worker entry point and leaves through
        // `_exit`, so no destructor or atexit handler of the parent runs twice.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(receiver);
                worker_main(job, sender, parent)
            }
            Ok(ForkResult::Parent { child }) => {
                drop(sender);
                debug!(pid = child.as_raw(), task = %label, position = job.position(), "Forked worker");
                Ok(LaunchedWorker {
                    handle: Box::new(ProcHandle {
                        proc: Proc::new(child),
                        grace: self.grace,
                    }),
                    channel: Box::new(receiver),
                })
            }
            Err(e) => Err(EngineError::launch(&label, e)),
        }
    }
}

/// Entry point of a forked worker. Never returns.
fn worker_main(job: WorkerJob, mut sender: PipeSender, parent: Pid) -> ! {
    #[cfg(target_os = "linux")]
    let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGKILL);

    // The parent may have died between fork and prctl.
    if getppid() != parent {
        exit_now(EXIT_ORPHANED);
    }

    // Safety: restoring a default disposition installs no handler code.
    unsafe {
        let _ = signal(Signal::SIGTERM, SigHandler::SigDfl);
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }

    job.enter_process();
    let message = job.run();
    let code = match sender.put(message) {
        Ok(()) => EXIT_OK,
        Err(_) => EXIT_CHANNEL_ERROR,
    };
    drop(sender);
    exit_now(code)
}

/// Leave the worker without running the parent's destructors or atexit handlers.
fn exit_now(code: i32) -> ! {
    // Safety: `_exit` only terminates the calling process.
    unsafe { nix::libc::_exit(code) }
}

/// [`WorkerHandle`] for a forked process.
struct ProcHandle {
    proc: Proc,
    grace: Duration,
}

impl WorkerHandle for ProcHandle {
    fn id(&self) -> String {
        format!("pid {}", self.proc.pid())
    }

    fn terminate(&mut self) -> Result<()> {
        if self.proc.is_reaped() {
            return Ok(());
        }
        let reason = self.proc.stop(self.grace)?;
        if matches!(reason, TerminationReason::Signaled(Signal::SIGKILL)) {
            warn!(pid = self.proc.pid().as_raw(), "Worker ignored SIGTERM, killed");
        }
        Ok(())
    }

    fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        self.proc.try_wait()
    }

    fn join(&mut self) -> Result<TerminationReason> {
        self.proc.wait()
    }
}
