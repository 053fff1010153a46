//! Task declarations.
//!
//! A [`Task`] pairs a named function with its [`TaskOptions`]. Calling a task
//! never runs the function; it produces a [`Thunk`] that is resolved later.

use crate::shm::SharedMemoryManager;
use crate::thunk::{Arg, Thunk};
use crate::worker::{CancelToken, Executor};
use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Return type of every task function.
pub type TaskResult = anyhow::Result<Value>;

type TaskFn = dyn Fn(&Invocation<'_>) -> TaskResult + Send + Sync;

/// Per-task execution settings. Unset values fall back to the runtime config.
#[derive(Clone)]
pub struct TaskOptions {
    /// Sleep between polling rounds while waiting on this task's arguments.
    pub poll_interval: Option<Duration>,
    /// Bound on the wait for this task's arguments (zero means unbounded).
    pub timeout: Option<Duration>,
    /// Pass the shared memory manager to this task's invocation.
    pub shared_memory: bool,
    /// Consult the runtime's invocation cache before running.
    pub cache: bool,
    /// CPU hint presented to the scheduler policy when this task runs as a worker.
    pub cpus: usize,
    /// Executor used when this task runs as a worker (runtime default otherwise).
    pub executor: Option<Arc<dyn Executor>>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            poll_interval: None,
            timeout: None,
            shared_memory: false,
            cache: false,
            cpus: 1,
            executor: None,
        }
    }
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_shared_memory(mut self, enabled: bool) -> Self {
        self.shared_memory = enabled;
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus.max(1);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }
}

impl std::fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOptions")
            .field("poll_interval", &self.poll_interval)
            .field("timeout", &self.timeout)
            .field("shared_memory", &self.shared_memory)
            .field("cache", &self.cache)
            .field("cpus", &self.cpus)
            .field("executor", &self.executor.as_ref().map(|e| e.name()))
            .finish()
    }
}

struct TaskInner {
    name: String,
    options: TaskOptions,
    func: Box<TaskFn>,
}

/// A named function that can be deferred into thunks.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Declare a task with default options.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Invocation<'_>) -> TaskResult + Send + Sync + 'static,
    {
        Self::with_options(name, TaskOptions::default(), func)
    }

    /// Declare a task with explicit options.
    pub fn with_options<F>(name: impl Into<String>, options: TaskOptions, func: F) -> Self
    where
        F: Fn(&Invocation<'_>) -> TaskResult + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(TaskInner {
                name: name.into(),
                options,
                func: Box::new(func),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &TaskOptions {
        &self.inner.options
    }

    /// Defer a call of this task. Arguments are captured verbatim.
    pub fn call<I>(&self, args: I) -> Thunk
    where
        I: IntoIterator,
        I::Item: Into<Arg>,
    {
        Thunk::new(self.clone(), args.into_iter().map(Into::into).collect())
    }

    /// Defer a call with no arguments.
    pub fn thunk(&self) -> Thunk {
        Thunk::new(self.clone(), Vec::new())
    }

    pub(crate) fn run(&self, invocation: &Invocation<'_>) -> TaskResult {
        (self.inner.func)(invocation)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

/// What a task function sees when it finally runs.
pub struct Invocation<'a> {
    task: &'a str,
    args: &'a [Value],
    shared_memory: Option<&'a SharedMemoryManager>,
    cancel: Option<&'a CancelToken>,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(
        task: &'a str,
        args: &'a [Value],
        shared_memory: Option<&'a SharedMemoryManager>,
    ) -> Self {
        Self {
            task,
            args,
            shared_memory,
            cancel: None,
        }
    }

    pub(crate) fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn task(&self) -> &str {
        self.task
    }

    /// Resolved arguments, in the order they were given to [`Task::call`].
    pub fn args(&self) -> &[Value] {
        self.args
    }

    /// Argument at `index`, or an error naming the expected count.
    pub fn arg(&self, index: usize) -> anyhow::Result<&Value> {
        self.args.get(index).ok_or_else(|| {
            anyhow!(
                "'{}' expects at least {} argument(s), got {}",
                self.task,
                index + 1,
                self.args.len()
            )
        })
    }

    /// Deserialize the argument at `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self.arg(index)?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow!("'{}' argument {}: {}", self.task, index, e))
    }

    /// True once the caller waiting on this invocation has given up.
    ///
    /// Long-running tasks on thread workers should poll this and return
    /// early; such a worker cannot be stopped any other way.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(CancelToken::is_cancelled)
    }

    /// Shared memory manager, present only when the task enabled it.
    pub fn shared_memory(&self) -> Option<&SharedMemoryManager> {
        self.shared_memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_defaults() {
        let options = TaskOptions::default();
        assert_eq!(options.cpus, 1);
        assert!(!options.shared_memory);
        assert!(!options.cache);
        assert!(options.timeout.is_none());
        assert!(options.executor.is_none());
    }

    #[test]
    fn test_options_builder() {
        let options = TaskOptions::new()
            .with_timeout(Duration::from_secs(2))
            .with_poll_interval(Duration::from_millis(5))
            .with_shared_memory(true)
            .with_cache(true)
            .with_cpus(0);
        assert_eq!(options.timeout, Some(Duration::from_secs(2)));
        assert_eq!(options.poll_interval, Some(Duration::from_millis(5)));
        assert!(options.shared_memory);
        assert!(options.cache);
        assert_eq!(options.cpus, 1);
    }

    #[test]
    fn test_invocation_arg_count_error() {
        let args = [json!(1)];
        let invocation = Invocation::new("add", &args, None);
        assert_eq!(invocation.get::<i64>(0).unwrap(), 1);
        let err = invocation.arg(1).unwrap_err().to_string();
        assert!(err.contains("expects at least 2"));
        assert!(err.contains("got 1"));
    }

    #[test]
    fn test_invocation_type_error() {
        let args = [json!("three")];
        let invocation = Invocation::new("add", &args, None);
        assert!(invocation.get::<i64>(0).is_err());
    }

    #[test]
    fn test_invocation_sees_cancellation() {
        let args = [json!(1)];
        let token = CancelToken::new();
        let invocation = Invocation::new("stall", &args, None).with_cancel(&token);
        assert!(!invocation.is_cancelled());
        token.cancel();
        assert!(invocation.is_cancelled());
        assert!(!Invocation::new("stall", &args, None).is_cancelled());
    }

    #[test]
    fn test_run_calls_function() {
        let task = Task::new("double", |inv| Ok(json!(inv.get::<i64>(0)? * 2)));
        let args = [json!(21)];
        let value = task.run(&Invocation::new("double", &args, None)).unwrap();
        assert_eq!(value, json!(42));
    }
}
