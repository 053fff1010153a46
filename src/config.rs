//! Runtime configuration.
//!
//! Values set on a task's `TaskOptions` take precedence over these defaults.
//!
//! # Environment Variables
//!
//! - `ENTANGLE_POLL_INTERVAL_MS` - Sleep between polling rounds
//! - `ENTANGLE_TIMEOUT_MS` - Bound on each wait (0 = unbounded)
//! - `ENTANGLE_CPUS` - CPU budget for concurrently running workers

use std::str::FromStr;
use std::time::Duration;

/// Default sleep between polling rounds.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How workers are started when a task does not choose an executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutorKind {
    /// One forked OS process per argument.
    #[default]
    Fork,
    /// One thread per argument.
    Thread,
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fork" | "process" => Ok(Self::Fork),
            "thread" => Ok(Self::Thread),
            _ => Err(format!(
                "Unknown executor: '{}'. Valid options: fork, thread",
                s
            )),
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fork => write!(f, "fork"),
            Self::Thread => write!(f, "thread"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub poll_interval: Duration,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    /// `None` admits every worker immediately.
    pub cpus: Option<usize>,
    pub executor: ExecutorKind,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
            cpus: None,
            executor: ExecutorKind::Fork,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound each wait. A zero duration means unbounded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = Some(cpus.max(1));
        self
    }

    pub fn with_executor(mut self, executor: ExecutorKind) -> Self {
        self.executor = executor;
        self
    }

    /// Apply `ENTANGLE_*` environment overrides. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_u64("ENTANGLE_POLL_INTERVAL_MS") {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("ENTANGLE_TIMEOUT_MS") {
            self = self.with_timeout(Duration::from_millis(ms));
        }
        if let Some(cpus) = env_u64("ENTANGLE_CPUS") {
            self = self.with_cpus(cpus as usize);
        }
        self
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}
