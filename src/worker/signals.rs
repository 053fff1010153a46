//! Termination analysis for workers.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Exit code a forked worker uses after writing its message.
pub const EXIT_OK: i32 = 0;
/// Exit code a forked worker uses when it could not write its message.
pub const EXIT_CHANNEL_ERROR: i32 = 2;
/// Exit code a forked worker uses when its parent is already gone.
pub const EXIT_ORPHANED: i32 = 3;

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Process exited with a status code.
    Exited(i32),
    /// Process was killed by a signal.
    Signaled(Signal),
    /// Thread worker returned normally.
    Finished,
    /// Thread worker unwound.
    Panicked,
    /// Still running.
    StillAlive,
    /// Anything else `waitpid` can report.
    Unknown,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(EXIT_OK) | Self::Finished)
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(EXIT_CHANNEL_ERROR) => {
                format!("exited with code {} (result channel error)", EXIT_CHANNEL_ERROR)
            }
            Self::Exited(EXIT_ORPHANED) => {
                format!("exited with code {} (parent gone)", EXIT_ORPHANED)
            }
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Finished => "finished".to_string(),
            Self::Panicked => "panicked".to_string(),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Map a `WaitStatus` to a termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_analyze_exit_codes() {
        let pid = Pid::from_raw(1234);
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 0)),
            TerminationReason::Exited(0)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 1)),
            TerminationReason::Exited(1)
        );
    }

    #[test]
    fn test_analyze_signals() {
        let pid = Pid::from_raw(1234);
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            TerminationReason::Signaled(Signal::SIGKILL)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::StillAlive
        );
    }

    #[test]
    fn test_success_and_description() {
        assert!(TerminationReason::Exited(0).is_success());
        assert!(TerminationReason::Finished.is_success());
        assert!(!TerminationReason::Panicked.is_success());
        assert!(!TerminationReason::Signaled(Signal::SIGTERM).is_success());
        assert!(
            TerminationReason::Exited(EXIT_ORPHANED)
                .to_string()
                .contains("parent gone")
        );
        assert_eq!(
            TerminationReason::Signaled(Signal::SIGKILL).to_string(),
            "killed by signal SIGKILL"
        );
    }
}
