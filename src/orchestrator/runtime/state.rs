use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::audio::Answer;
use crate::orchestrator::types::{RoundCounters, TerminationReason};

/// Per-session "active" flag shared by every loop of the session.
///
/// Loops check it at their iteration boundary; async waits race
/// [`cancelled`](Self::cancelled) so they wake promptly.
#[derive(Debug)]
pub struct SessionSignal {
    active: AtomicBool,
    reason: Mutex<Option<TerminationReason>>,
    notify: Notify,
}

impl SessionSignal {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Returns `true` only for the call that actually deactivated.
    pub fn terminate(&self, reason: TerminationReason) -> bool {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        let was_active = self.active.swap(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        was_active
    }

    pub fn deactivate(&self) -> bool {
        self.terminate(TerminationReason::Cancelled)
    }

    pub fn reason(&self) -> Option<TerminationReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.is_active() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for SessionSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationRecord {
    pub questions: Vec<String>,
    pub answers: Vec<Answer>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskCardRecord {
    pub task_card: String,
    pub hand_off: String,
    pub statement: Option<Answer>,
    pub followup_questions: Vec<String>,
    pub followup_answers: Vec<Answer>,
}

/// Everything one oral attempt produced, grouped by exam part.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExamRecord {
    pub part1: ConversationRecord,
    pub part1_closing_signal: bool,
    pub part2: TaskCardRecord,
    pub part3: ConversationRecord,
    pub feedback: Option<String>,
    pub rounds: RoundCounters,
    pub termination: Option<TerminationReason>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl ExamRecord {
    pub fn answer_count(&self) -> usize {
        self.part1.answers.len()
            + usize::from(self.part2.statement.is_some())
            + self.part2.followup_answers.len()
            + self.part3.answers.len()
    }

    pub fn faulted(reason: TerminationReason, error: impl Into<String>) -> Self {
        Self {
            termination: Some(reason),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_termination_reason_wins() {
        let signal = Arc::new(SessionSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.cancelled().await })
        };

        assert!(signal.terminate(TerminationReason::Disconnected));
        assert!(!signal.terminate(TerminationReason::Completed));
        assert_eq!(signal.reason(), Some(TerminationReason::Disconnected));

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("join");
    }
}
