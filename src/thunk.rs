//! Deferred invocations and their arguments.

use crate::error::Result;
use crate::runtime::Runtime;
use crate::task::{Task, TaskOptions};
use serde_json::Value;
use std::sync::Arc;

type ChooseFn = dyn Fn(&Value) -> Arg + Send + Sync;

/// One argument of a thunk.
#[derive(Clone)]
pub enum Arg {
    /// A concrete value, passed through without a worker.
    Value(Value),
    /// A nested deferred call, resolved by its own worker.
    Thunk(Thunk),
    /// A dataflow branch: resolve the input, then resolve whichever argument
    /// the selector picks for it.
    Select(Selector),
}

impl Arg {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// Build a dataflow branch over `input`.
    pub fn select<F>(input: impl Into<Arg>, choose: F) -> Self
    where
        F: Fn(&Value) -> Arg + Send + Sync + 'static,
    {
        Self::Select(Selector {
            input: Box::new(input.into()),
            choose: Arc::new(choose),
        })
    }

    /// True when resolving this argument needs a worker.
    pub fn is_pending(&self) -> bool {
        !matches!(self, Self::Value(_))
    }

    /// Name used in logs and errors for the worker resolving this argument.
    pub fn label(&self) -> &str {
        match self {
            Self::Value(_) => "value",
            Self::Thunk(thunk) => thunk.name(),
            Self::Select(_) => "select",
        }
    }

    /// Options of the task this argument runs, if it is a thunk.
    pub(crate) fn options(&self) -> Option<&TaskOptions> {
        match self {
            Self::Thunk(thunk) => Some(thunk.options()),
            _ => None,
        }
    }

    fn worker_count(&self) -> usize {
        match self {
            Self::Value(_) => 0,
            Self::Thunk(thunk) => 1 + thunk.worker_count(),
            Self::Select(selector) => 1 + selector.input.inline_worker_count(),
        }
    }

    /// Workers spawned when this argument is resolved inside the current process.
    fn inline_worker_count(&self) -> usize {
        match self {
            Self::Value(_) => 0,
            Self::Thunk(thunk) => thunk.worker_count(),
            Self::Select(selector) => selector.input.inline_worker_count(),
        }
    }

    fn uses_shared_memory(&self) -> bool {
        match self {
            Self::Value(_) => false,
            Self::Thunk(thunk) => thunk.uses_shared_memory(),
            Self::Select(selector) => selector.input.uses_shared_memory(),
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Thunk> for Arg {
    fn from(thunk: Thunk) -> Self {
        Self::Thunk(thunk)
    }
}

impl From<&Thunk> for Arg {
    fn from(thunk: &Thunk) -> Self {
        Self::Thunk(thunk.clone())
    }
}

impl std::fmt::Debug for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => write!(f, "Value({})", value),
            Self::Thunk(thunk) => std::fmt::Debug::fmt(thunk, f),
            Self::Select(selector) => f.debug_tuple("Select").field(&selector.input).finish(),
        }
    }
}

/// Branch selection for dataflow-style graphs.
#[derive(Clone)]
pub struct Selector {
    input: Box<Arg>,
    choose: Arc<ChooseFn>,
}

impl Selector {
    pub fn input(&self) -> &Arg {
        &self.input
    }

    /// Pick the argument to resolve next for a resolved input.
    pub fn choose(&self, input: &Value) -> Arg {
        (self.choose)(input)
    }
}

struct ThunkInner {
    task: Task,
    args: Vec<Arg>,
}

/// An immutable deferred call of a task.
///
/// Cloning is cheap. Resolving the same thunk twice runs the graph twice
/// unless the task enables caching and the runtime has a cache installed.
#[derive(Clone)]
pub struct Thunk {
    inner: Arc<ThunkInner>,
}

impl Thunk {
    pub(crate) fn new(task: Task, args: Vec<Arg>) -> Self {
        Self {
            inner: Arc::new(ThunkInner { task, args }),
        }
    }

    pub fn task(&self) -> &Task {
        &self.inner.task
    }

    pub fn name(&self) -> &str {
        self.inner.task.name()
    }

    pub fn options(&self) -> &TaskOptions {
        self.inner.task.options()
    }

    pub fn args(&self) -> &[Arg] {
        &self.inner.args
    }

    /// Number of arguments that need a worker.
    pub fn pending_args(&self) -> usize {
        self.inner.args.iter().filter(|arg| arg.is_pending()).count()
    }

    /// Workers a full resolution spawns, counting nested thunks transitively.
    ///
    /// Branches picked by a selector are not known ahead of time and are not
    /// counted.
    pub fn worker_count(&self) -> usize {
        self.inner.args.iter().map(Arg::worker_count).sum()
    }

    /// True if any task in the static graph enables shared memory.
    pub fn uses_shared_memory(&self) -> bool {
        self.options().shared_memory || self.inner.args.iter().any(Arg::uses_shared_memory)
    }

    /// Resolve with a default [`Runtime`].
    pub fn resolve(&self) -> Result<Value> {
        Runtime::default().resolve(self)
    }

    /// Resolve with the given runtime and its collaborators.
    pub fn resolve_with(&self, runtime: &Runtime) -> Result<Value> {
        runtime.resolve(self)
    }
}

impl std::fmt::Debug for Thunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tuple = f.debug_tuple(self.name());
        for arg in &self.inner.args {
            tuple.field(arg);
        }
        tuple.finish()
    }
}
