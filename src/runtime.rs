//! Top-level resolution.
//!
//! [`Runtime::resolve`] is the synchronous entry point: it sets up the
//! per-call resources (the shared memory manager), resolves every argument
//! through a [`WorkerBatch`] driven by a [`Waiter`], then runs the task
//! function in-process.

use crate::cache::InvocationCache;
use crate::config::{ExecutorKind, RuntimeConfig};
use crate::error::{EngineError, Result};
use crate::launcher::WorkerBatch;
use crate::scheduler::{CpuBudget, SchedulerPolicy, Unbounded};
use crate::shm::SharedMemoryManager;
use crate::task::{Invocation, Task};
use crate::thunk::{Arg, Thunk};
use crate::waiter::Waiter;
use crate::worker::{CancelToken, Executor, ForkExecutor, ThreadExecutor, panic_message};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info_span};

/// Counts observed while resolving a graph, summed across worker processes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionReport {
    /// Workers started.
    pub spawned: usize,
    /// Workers joined.
    pub joined: usize,
    /// Invocations answered from the cache.
    pub cache_hits: usize,
}

impl ResolutionReport {
    /// Add the counts of a subtree.
    pub fn absorb(&mut self, other: &ResolutionReport) {
        self.spawned += other.spawned;
        self.joined += other.joined;
        self.cache_hits += other.cache_hits;
    }
}

/// A resolved value with the report of the graph that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: Value,
    pub report: ResolutionReport,
}

impl Resolved {
    fn ready(value: Value) -> Self {
        Self {
            value,
            report: ResolutionReport::default(),
        }
    }
}

/// Collaborators and defaults used to resolve thunks.
#[derive(Clone)]
pub struct Runtime {
    config: RuntimeConfig,
    policy: Arc<dyn SchedulerPolicy>,
    executor: Arc<dyn Executor>,
    cache: Option<Arc<dyn InvocationCache>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Runtime {
    /// Build a runtime whose policy and executor follow `config`.
    pub fn new(config: RuntimeConfig) -> Self {
        let policy: Arc<dyn SchedulerPolicy> = match config.cpus {
            Some(cpus) => Arc::new(CpuBudget::new(cpus)),
            None => Arc::new(Unbounded),
        };
        let executor: Arc<dyn Executor> = match config.executor {
            ExecutorKind::Fork => Arc::new(ForkExecutor::new()),
            ExecutorKind::Thread => Arc::new(ThreadExecutor::new()),
        };
        Self {
            config,
            policy,
            executor,
            cache: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn with_policy(mut self, policy: Arc<dyn SchedulerPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Executor for tasks that do not name one in their options.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn InvocationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Resolve `thunk` to its value, blocking until the whole graph is done.
    pub fn resolve(&self, thunk: &Thunk) -> Result<Value> {
        Ok(self.resolve_with_report(thunk)?.value)
    }

    /// Resolve `thunk` and report how many workers the graph used.
    pub fn resolve_with_report(&self, thunk: &Thunk) -> Result<Resolved> {
        let span = info_span!("resolve", task = thunk.name());
        let _enter = span.enter();

        // Scoped to this call: dropping the manager unlinks every segment.
        let shared_memory = if thunk.uses_shared_memory() {
            Some(Arc::new(SharedMemoryManager::new()?))
        } else {
            None
        };
        let resolved = self.root_resolution(shared_memory).resolve_thunk(thunk)?;
        debug!(
            spawned = resolved.report.spawned,
            joined = resolved.report.joined,
            cache_hits = resolved.report.cache_hits,
            "Resolved"
        );
        Ok(resolved)
    }

    pub(crate) fn root_resolution(
        &self,
        shared_memory: Option<Arc<SharedMemoryManager>>,
    ) -> Resolution {
        Resolution {
            runtime: self.clone(),
            shared_memory,
            depth: 0,
            cancel: CancelToken::new(),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("executor", &self.executor.name())
            .field("cache", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

/// State carried down the graph during one top-level call.
///
/// Cloned into every worker: a forked worker inherits it through `fork`, a
/// thread worker through the job it is handed.
#[derive(Clone)]
pub(crate) struct Resolution {
    runtime: Runtime,
    shared_memory: Option<Arc<SharedMemoryManager>>,
    depth: usize,
    cancel: CancelToken,
}

impl Resolution {
    pub(crate) fn policy(&self) -> &dyn SchedulerPolicy {
        self.runtime.policy.as_ref()
    }

    /// Worker nesting level; 0 for the top-level call.
    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn default_executor(&self) -> Arc<dyn Executor> {
        self.runtime.executor.clone()
    }

    /// The same call one worker level deeper, stopped by `cancel`.
    pub(crate) fn for_worker(&self, cancel: CancelToken) -> Self {
        Self {
            depth: self.depth + 1,
            cancel,
            ..self.clone()
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn ensure_active(&self, task: &str) -> Result<()> {
        if self.is_cancelled() {
            debug!(task, depth = self.depth, "Cancelled");
            return Err(EngineError::Cancelled {
                task: task.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn resolve_arg(&self, arg: &Arg) -> Result<Resolved> {
        match arg {
            Arg::Value(value) => Ok(Resolved::ready(value.clone())),
            Arg::Thunk(thunk) => self.resolve_thunk(thunk),
            Arg::Select(selector) => {
                let input = self.resolve_arg(selector.input())?;
                let branch = selector.choose(&input.value);
                debug!(depth = self.depth, input = %input.value, branch = branch.label(), "Selected branch");
                let mut resolved = self.resolve_arg(&branch)?;
                resolved.report.absorb(&input.report);
                Ok(resolved)
            }
        }
    }

    pub(crate) fn resolve_thunk(&self, thunk: &Thunk) -> Result<Resolved> {
        let options = thunk.options();
        let waiter = Waiter::new(
            options
                .poll_interval
                .unwrap_or(self.runtime.config.poll_interval),
            options.timeout.or(self.runtime.config.timeout),
        );
        debug!(
            task = thunk.name(),
            depth = self.depth,
            args = thunk.args().len(),
            pending = thunk.pending_args(),
            "Resolving arguments"
        );

        self.ensure_active(thunk.name())?;
        let mut batch = WorkerBatch::launch(thunk.name(), thunk.args(), self.clone())?;
        if let Err(e) = waiter.run(&mut batch) {
            batch.shutdown();
            return Err(e);
        }
        let (values, mut report) = batch.into_values()?;
        self.ensure_active(thunk.name())?;
        let value = self.invoke(thunk.task(), &values, &mut report)?;
        Ok(Resolved { value, report })
    }

    /// Run the task function on resolved arguments, through the cache hook.
    fn invoke(&self, task: &Task, args: &[Value], report: &mut ResolutionReport) -> Result<Value> {
        let options = task.options();
        let cache = self.runtime.cache.as_ref().filter(|_| options.cache);

        if let Some(cache) = cache
            && let Some(hit) = cache.lookup(task.name(), args)
        {
            report.cache_hits += 1;
            debug!(task = task.name(), "Cache hit");
            return Ok(hit);
        }

        let shared_memory = if options.shared_memory {
            self.shared_memory.as_deref()
        } else {
            None
        };
        let invocation =
            Invocation::new(task.name(), args, shared_memory).with_cancel(&self.cancel);

        let started = Instant::now();
        let value = match panic::catch_unwind(AssertUnwindSafe(|| task.run(&invocation))) {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Err(EngineError::invocation(task.name(), format!("{:#}", e))),
            Err(payload) => {
                return Err(EngineError::invocation(
                    task.name(),
                    format!("panicked: {}", panic_message(payload.as_ref())),
                ));
            }
        };
        debug!(
            task = task.name(),
            depth = self.depth,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Invoked"
        );

        if let Some(cache) = cache {
            cache.store(task.name(), args, &value);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::task::TaskOptions;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn thread_runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new().with_executor(ExecutorKind::Thread))
    }

    #[test]
    fn test_report_absorb() {
        let mut report = ResolutionReport {
            spawned: 1,
            joined: 1,
            cache_hits: 0,
        };
        report.absorb(&ResolutionReport {
            spawned: 2,
            joined: 2,
            cache_hits: 1,
        });
        assert_eq!(report.spawned, 3);
        assert_eq!(report.joined, 3);
        assert_eq!(report.cache_hits, 1);
    }

    #[test]
    fn test_values_only_spawn_nothing() {
        let add = Task::new("add", |inv| Ok(json!(inv.get::<i64>(0)? + inv.get::<i64>(1)?)));
        let resolved = Runtime::default()
            .resolve_with_report(&add.call([json!(2), json!(3)]))
            .unwrap();
        assert_eq!(resolved.value, json!(5));
        assert_eq!(resolved.report, ResolutionReport::default());
    }

    #[test]
    fn test_thread_graph_counts_workers() {
        let add = Task::new("add", |inv| Ok(json!(inv.get::<i64>(0)? + inv.get::<i64>(1)?)));
        let two = Task::new("two", |_| Ok(json!(2)));
        let three = Task::new("three", |_| Ok(json!(3)));

        let thunk = add.call([three.thunk(), two.thunk()]);
        let resolved = thread_runtime().resolve_with_report(&thunk).unwrap();
        assert_eq!(resolved.value, json!(5));
        assert_eq!(resolved.report.spawned, 2);
        assert_eq!(resolved.report.joined, 2);
    }

    #[test]
    fn test_panicking_task_is_invocation_failure() {
        let boom = Task::new("boom", |_| panic!("kaboom"));
        let err = Runtime::default().resolve(&boom.thunk()).unwrap_err();
        match err {
            EngineError::InvocationFailure { task, message } => {
                assert_eq!(task, "boom");
                assert!(message.contains("kaboom"));
            }
            other => panic!("Expected InvocationFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_cache_hit_skips_function() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let square = Task::with_options("square", TaskOptions::new().with_cache(true), move |inv| {
            counter.fetch_add(1, Ordering::SeqCst);
            let n = inv.get::<i64>(0)?;
            Ok(json!(n * n))
        });
        let runtime = Runtime::default().with_cache(Arc::new(MemoryCache::new()));
        let thunk = square.call([json!(7)]);

        assert_eq!(runtime.resolve(&thunk).unwrap(), json!(49));
        let second = runtime.resolve_with_report(&thunk).unwrap();
        assert_eq!(second.value, json!(49));
        assert_eq!(second.report.cache_hits, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_select_in_thread_worker() {
        let upper = Task::new("upper", |inv| {
            Ok(json!(inv.get::<String>(0)?.to_uppercase()))
        });
        let emit = Task::new("emit", |inv| Ok(json!(format!("{}!", inv.get::<String>(0)?))));
        let join = Task::new("join", |inv| {
            Ok(json!(format!("{}: {}", inv.get::<String>(0)?, inv.get::<String>(1)?)))
        });

        let branch_on = |input: &str| {
            let emit = emit.clone();
            Arg::select(Arg::value(input), move |value| {
                emit.call([value.clone()]).into()
            })
        };
        let thunk = join.call([Arg::from(upper.call([json!("x")])), branch_on("emit")]);
        let resolved = thread_runtime().resolve_with_report(&thunk).unwrap();
        assert_eq!(resolved.value, json!("X: emit!"));
        assert_eq!(resolved.report.spawned, 2);
    }
}
