//! Workers that resolve thunk arguments.
//!
//! Every pending argument of a thunk is handed to an [`Executor`], which
//! starts a worker and returns a [`LaunchedWorker`]: a handle used to stop
//! and join it, and the [`ResultChannel`] it reports through.
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │  add(three, two) │  initiator: polls channels
//!                  └────────┬─────────┘
//!                ┌──────────┴──────────┐
//!          ┌─────▼─────┐         ┌─────▼─────┐
//!          │  worker   │         │  worker   │  one per pending argument
//!          │  three()  │         │   two()   │  (fork or thread)
//!          └───────────┘         └───────────┘
//! ```
//!
//! Two executors ship in-tree: [`ForkExecutor`] (one OS process per
//! argument, result over a pipe) and [`ThreadExecutor`] (one thread per
//! argument, result over an in-memory slot). A remote executor implements
//! the same trait.

pub mod channel;
pub mod ipc;
pub mod proc;
pub mod protocol;
pub mod signals;
mod spawn;
mod thread;

pub use channel::{Received, ResultChannel, ResultSender};
pub use protocol::ChannelMessage;
pub use signals::TerminationReason;
pub use spawn::ForkExecutor;
pub use thread::ThreadExecutor;

use crate::error::{Failure, Result};
use crate::runtime::Resolution;
use crate::thunk::Arg;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Starts workers for pending arguments.
pub trait Executor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Start a worker that runs `job` and reports through the returned channel.
    ///
    /// Failing to start is reported as `EngineError::LaunchFailure`.
    fn spawn(&self, job: WorkerJob) -> Result<LaunchedWorker>;
}

/// Initiator-side control of one running worker.
pub trait WorkerHandle: Send {
    /// Identifier for logs (pid or thread name).
    fn id(&self) -> String;

    /// Stop the worker early. Called on timeout or when a sibling failed.
    fn terminate(&mut self) -> Result<()>;

    /// Non-blocking check whether the worker has already gone away.
    ///
    /// Lets the initiator notice a dead worker even when its channel stays
    /// open. Executors that cannot tell return `None`.
    fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        Ok(None)
    }

    /// Wait for the worker to go away and report how it ended.
    fn join(&mut self) -> Result<TerminationReason>;
}

/// What an executor hands back for a started worker.
pub struct LaunchedWorker {
    pub handle: Box<dyn WorkerHandle>,
    pub channel: Box<dyn ResultChannel>,
}

/// Cooperative stop request shared between a worker and its initiator.
///
/// Workers that share the initiator's process cannot be killed. Cancelling
/// makes their waiters give up, keeps them from launching or invoking
/// anything further, and is visible to task functions through
/// [`Invocation::is_cancelled`](crate::task::Invocation::is_cancelled).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// One argument to resolve inside a worker.
pub struct WorkerJob {
    position: usize,
    arg: Arg,
    resolution: Resolution,
    cancel: CancelToken,
}

impl WorkerJob {
    pub(crate) fn new(position: usize, arg: Arg, resolution: Resolution) -> Self {
        Self {
            position,
            arg,
            resolution,
            cancel: CancelToken::new(),
        }
    }

    /// Name of what the worker resolves (task name or `select`).
    pub fn label(&self) -> &str {
        self.arg.label()
    }

    pub fn arg(&self) -> &Arg {
        &self.arg
    }

    /// Position of the argument in its parent thunk.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Token that stops this job's resolution when cancelled.
    ///
    /// Executors whose workers cannot be killed keep a clone and cancel it
    /// from [`WorkerHandle::terminate`].
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Per-process setup for a worker that lives in a fresh process.
    pub fn enter_process(&self) {
        self.resolution.policy().on_worker_start();
    }

    /// Resolve the argument and build the message for the channel.
    ///
    /// Never panics: errors and panics become a failure message.
    pub fn run(self) -> ChannelMessage {
        let label = self.label().to_string();
        let resolution = self.resolution.for_worker(self.cancel.clone());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| resolution.resolve_arg(&self.arg)));
        match outcome {
            Ok(Ok(resolved)) => ChannelMessage::value(resolved.value, resolved.report),
            Ok(Err(e)) => ChannelMessage::failure(e.to_failure(&label)),
            Err(payload) => ChannelMessage::failure(Failure::Invocation {
                message: format!("panicked: {}", panic_message(payload.as_ref())),
                task: label,
            }),
        }
    }
}

impl std::fmt::Debug for WorkerJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerJob")
            .field("position", &self.position)
            .field("arg", &self.arg)
            .finish_non_exhaustive()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
