//! entangle - lazy task graphs resolved across worker processes.
//!
//! Declare tasks, compose them by nesting calls, and resolve the graph:
//!
//! ```no_run
//! use entangle::{Task, json};
//!
//! let add = Task::new("add", |inv| Ok(json!(inv.get::<i64>(0)? + inv.get::<i64>(1)?)));
//! let two = Task::new("two", |_| Ok(json!(2)));
//! let three = Task::new("three", |_| Ok(json!(3)));
//!
//! // Nothing runs yet: `call` only builds the graph.
//! let graph = add.call([three.thunk(), two.thunk()]);
//!
//! // One forked worker per pending argument, then `add` runs here.
//! assert_eq!(graph.resolve().unwrap(), json!(5));
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod runtime;
pub mod scheduler;
pub mod shm;
pub mod task;
pub mod thunk;
pub mod waiter;
pub mod worker;

pub use cache::{InvocationCache, MemoryCache};
pub use config::{ExecutorKind, RuntimeConfig};
pub use error::{EngineError, Result};
pub use runtime::{ResolutionReport, Resolved, Runtime};
pub use scheduler::{Admission, AdmissionRequest, CpuBudget, SchedulerPolicy, Unbounded};
pub use serde_json::{Value, json};
pub use shm::{Segment, SegmentHandle, SharedMemoryManager};
pub use task::{Invocation, Task, TaskOptions, TaskResult};
pub use thunk::{Arg, Selector, Thunk};
pub use worker::{CancelToken, Executor, ForkExecutor, ThreadExecutor};

/// Serializes unit tests that fork or that wait for EOF on a pipe, so no
/// child holds a copy of another test's write end.
#[cfg(test)]
pub(crate) static FORK_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
