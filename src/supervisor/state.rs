//! Reload state: phase, gating flag, the single pending timer and the last
//! captured error.

use std::path::PathBuf;

use tokio::time::{Duration, Instant};

/// Delay of both the deferred-change retry and the failure retry.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Lifecycle phase of the supervised application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Loaded, waiting for the readiness signals
    Starting,
    /// Ready; changes restart immediately
    Running,
    /// Teardown in progress
    Restarting,
    /// Load or startup failed; retry scheduled
    Failed,
    /// Fatal error, terminal
    Exited,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
            Self::Exited => "exited",
        }
    }
}

/// Last captured load/startup error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastError {
    pub present: bool,
    pub message: String,
    pub stack_trace: String,
    /// Already printed and shown on the diagnostic page
    pub reported: bool,
}

impl LastError {
    /// Same error as the one already captured.
    pub fn is_same(&self, message: &str, stack: &str) -> bool {
        self.present && self.message == message && self.stack_trace == stack
    }

    pub fn set(&mut self, message: &str, stack: &str) {
        self.present = true;
        self.message = message.to_string();
        self.stack_trace = stack.to_string();
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// What a pending timer does when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerAction {
    /// Re-deliver a change that arrived while not restartable
    Change { path: PathBuf, seq: u64 },
    /// Retry a failed start
    Start,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTimer {
    pub deadline: Instant,
    pub action: TimerAction,
}

/// State owned by the restart controller.
#[derive(Debug)]
pub struct ReloadState {
    pub phase: Phase,
    /// True only between readiness and the next teardown request
    pub restartable: bool,
    pub pending: Option<PendingTimer>,
    pub last_error: LastError,
    /// Incremented on every load
    pub generation: u64,
    /// Sequence number of the newest qualifying change
    pub change_seq: u64,
    /// `change_seq` when the latest load began
    pub loaded_seq: u64,
}

impl Default for ReloadState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReloadState {
    pub const fn new() -> Self {
        Self {
            phase: Phase::Starting,
            restartable: false,
            pending: None,
            last_error: LastError {
                present: false,
                message: String::new(),
                stack_trace: String::new(),
                reported: false,
            },
            generation: 0,
            change_seq: 0,
            loaded_seq: 0,
        }
    }

    /// Defer a change. Coalesces into any pending timer; a pending change
    /// timer is raised to the newer sequence number.
    ///
    /// Returns `true` when a new timer was armed.
    pub fn schedule_change(&mut self, path: PathBuf, seq: u64, now: Instant) -> bool {
        match &mut self.pending {
            Some(PendingTimer {
                action: TimerAction::Change { seq: pending, .. },
                ..
            }) => {
                *pending = (*pending).max(seq);
                false
            }
            Some(_) => false,
            None => {
                self.pending = Some(PendingTimer {
                    deadline: now + RETRY_DELAY,
                    action: TimerAction::Change { path, seq },
                });
                true
            }
        }
    }

    /// Schedule a start retry. Replaces a pending change timer: the start
    /// observes every change made so far.
    pub fn schedule_start(&mut self, now: Instant) {
        if matches!(
            self.pending,
            Some(PendingTimer {
                action: TimerAction::Start,
                ..
            })
        ) {
            return;
        }
        self.pending = Some(PendingTimer {
            deadline: now + RETRY_DELAY,
            action: TimerAction::Start,
        });
    }

    pub fn cancel_timer(&mut self) -> Option<PendingTimer> {
        self.pending.take()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|t| t.deadline)
    }

    /// Take the pending action if its deadline passed.
    pub fn take_due(&mut self, now: Instant) -> Option<TimerAction> {
        if self.pending.as_ref().is_some_and(|t| t.deadline <= now) {
            self.pending.take().map(|t| t.action)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str, seq: u64) -> TimerAction {
        TimerAction::Change {
            path: PathBuf::from(path),
            seq,
        }
    }

    #[test]
    fn test_schedule_change_coalesces() {
        let now = Instant::now();
        let mut state = ReloadState::new();

        assert!(state.schedule_change("/a".into(), 1, now));
        assert!(!state.schedule_change("/b".into(), 2, now + Duration::from_millis(10)));
        assert!(!state.schedule_change("/c".into(), 3, now + Duration::from_millis(20)));

        // first deadline kept, newest seq recorded
        assert_eq!(state.deadline(), Some(now + RETRY_DELAY));
        assert_eq!(state.take_due(now + RETRY_DELAY), Some(change("/a", 3)));
        assert!(state.pending.is_none());
    }

    #[test]
    fn test_change_does_not_replace_start() {
        let now = Instant::now();
        let mut state = ReloadState::new();
        state.schedule_start(now);
        assert!(!state.schedule_change("/a".into(), 1, now));
        assert_eq!(state.take_due(now + RETRY_DELAY), Some(TimerAction::Start));
    }

    #[test]
    fn test_start_supersedes_change() {
        let now = Instant::now();
        let mut state = ReloadState::new();
        state.schedule_change("/a".into(), 1, now);
        let later = now + Duration::from_millis(50);
        state.schedule_start(later);
        assert_eq!(state.deadline(), Some(later + RETRY_DELAY));
        assert_eq!(state.take_due(later + RETRY_DELAY), Some(TimerAction::Start));
    }

    #[test]
    fn test_schedule_start_idempotent() {
        let now = Instant::now();
        let mut state = ReloadState::new();
        state.schedule_start(now);
        state.schedule_start(now + Duration::from_millis(50));
        assert_eq!(state.deadline(), Some(now + RETRY_DELAY));
    }

    #[test]
    fn test_take_due_before_deadline() {
        let now = Instant::now();
        let mut state = ReloadState::new();
        state.schedule_start(now);
        assert_eq!(state.take_due(now + Duration::from_millis(99)), None);
        assert!(state.pending.is_some());
    }

    #[test]
    fn test_last_error_identity() {
        let mut last = LastError::default();
        assert!(!last.is_same("", ""));
        last.set("boom", "at main.rs:1");
        assert!(last.is_same("boom", "at main.rs:1"));
        assert!(!last.is_same("boom", "at main.rs:2"));
        last.clear();
        assert_eq!(last, LastError::default());
    }
}
