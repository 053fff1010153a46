//! Handle for forked worker processes.
//!
//! A `Proc` is reaped exactly once. Dropping an unreaped handle kills and
//! reaps the process so no zombie outlives its batch.

use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::Result;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::io;
use std::time::{Duration, Instant};

/// Poll step while waiting out the grace period.
const STOP_POLL: Duration = Duration::from_millis(5);

pub struct Proc {
    pid: Pid,
    status: Option<TerminationReason>,
}

impl Proc {
    pub fn new(pid: Pid) -> Self {
        Self { pid, status: None }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_reaped(&self) -> bool {
        self.status.is_some()
    }

    /// Reap the process if it has exited (non-blocking).
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(status) = &self.status {
            return Ok(Some(status.clone()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(self.record(status))),
            Err(e) => Err(io::Error::from(e).into()),
        }
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if let Some(status) = &self.status {
            return Ok(status.clone());
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => return Ok(self.record(status)),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            }
        }
    }

    /// Send SIGTERM. A process that already exited is not an error.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL and reap.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        self.signal(Signal::SIGKILL)?;
        self.wait()
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps.
    pub fn stop(&mut self, grace: Duration) -> Result<TerminationReason> {
        if let Some(status) = &self.status {
            return Ok(status.clone());
        }
        self.terminate()?;
        let start = Instant::now();
        while start.elapsed() < grace {
            if let Some(status) = self.try_wait()? {
                return Ok(status);
            }
            std::thread::sleep(STOP_POLL);
        }
        self.kill()
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        match signal::kill(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e).into()),
        }
    }

    fn record(&mut self, status: WaitStatus) -> TerminationReason {
        let reason = analyze_wait_status(status);
        self.status = Some(reason.clone());
        reason
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.status.is_none() {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn spawn(program: &str, args: &[&str]) -> Proc {
        let child = Command::new(program).args(args).spawn().unwrap();
        Proc::new(Pid::from_raw(child.id() as i32))
    }

    #[test]
    fn test_wait_reports_exit_code() {
        let _guard = crate::FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut proc = spawn("sh", &["-c", "exit 3"]);
        assert_eq!(proc.wait().unwrap(), TerminationReason::Exited(3));
        assert!(proc.is_reaped());
        // Cached after the first reap.
        assert_eq!(proc.try_wait().unwrap(), Some(TerminationReason::Exited(3)));
    }

    #[test]
    fn test_stop_terminates_sleeper() {
        let _guard = crate::FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut proc = spawn("sleep", &["60"]);
        assert_eq!(proc.try_wait().unwrap(), None);

        let reason = proc.stop(Duration::from_millis(500)).unwrap();
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGTERM));
        assert!(proc.is_reaped());
    }

    #[test]
    fn test_stop_escalates_to_sigkill() {
        let _guard = crate::FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut proc = spawn("sh", &["-c", "trap '' TERM; exec sleep 60"]);
        // Give the shell time to install its trap.
        std::thread::sleep(Duration::from_millis(100));
        let reason = proc.stop(Duration::from_millis(50)).unwrap();
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGKILL));
    }

    #[test]
    fn test_drop_reaps_process() {
        let _guard = crate::FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let proc = spawn("sleep", &["60"]);
        let pid = proc.pid();
        drop(proc);
        assert_eq!(signal::kill(pid, None), Err(Errno::ESRCH));
    }
}
