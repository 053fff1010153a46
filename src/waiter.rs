//! Cooperative polling loop.
//!
//! One thread multiplexes every result channel of a thunk: each round
//! checks all channels without blocking, then sleeps for the poll interval.
//! Nothing else suspends.

use crate::error::{EngineError, Result};
use std::time::{Duration, Instant};
use tracing::trace;

/// Result of one polling round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// This many arguments are still unresolved.
    Pending(usize),
    /// Every argument has a value.
    Complete,
}

/// Something the waiter can drive round by round.
pub trait Pollable {
    /// Task name used in timeout errors.
    fn task(&self) -> &str;

    /// Check every outstanding channel once. Must not block.
    fn step(&mut self) -> Result<Progress>;

    /// True when whoever waits on this target has given up.
    fn cancelled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl Waiter {
    /// A zero timeout is treated as unbounded.
    pub fn new(poll_interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            poll_interval,
            timeout: timeout.filter(|t| !t.is_zero()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Poll until complete, failing once `timeout` has elapsed or the target
    /// is cancelled.
    ///
    /// The deadline is checked after each sleep, so a timeout surfaces within
    /// `timeout + poll_interval` plus the cost of one round.
    pub fn run<P: Pollable + ?Sized>(&self, target: &mut P) -> Result<()> {
        let start = Instant::now();
        let mut round: u64 = 0;
        loop {
            let pending = match target.step()? {
                Progress::Complete => return Ok(()),
                Progress::Pending(pending) => pending,
            };
            if target.cancelled() {
                return Err(EngineError::Cancelled {
                    task: target.task().to_string(),
                });
            }
            round += 1;
            trace!(task = target.task(), round, pending, "Waiting");

            std::thread::sleep(self.poll_interval);

            let elapsed = start.elapsed();
            if let Some(timeout) = self.timeout
                && elapsed > timeout
            {
                return Err(EngineError::timeout(target.task(), pending, elapsed));
            }
        }
    }
}
