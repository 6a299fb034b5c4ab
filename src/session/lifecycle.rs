//! Lifecycle broadcast payloads for registry subscribers.

use std::time::SystemTime;

use crate::orchestrator::types::TerminationReason;
use crate::persistence::SessionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecyclePhase {
    Created,
    Running,
    Finalizing,
    Completed,
    Expired,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum SessionLifecyclePayload {
    #[default]
    None,
    Created(CreatedPayload),
    Finalizing(FinalizingPayload),
    Completed(CompletionPayload),
    Failed(FailurePayload),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedPayload {
    pub candidate_id: String,
    pub kind: SessionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizingPayload {
    pub reason: Option<TerminationReason>,
    pub answers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionPayload {
    pub result_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailurePayload {
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct SessionLifecycleUpdate {
    pub session_id: String,
    pub phase: SessionLifecyclePhase,
    pub issued_at: SystemTime,
    pub payload: SessionLifecyclePayload,
}

impl SessionLifecycleUpdate {
    pub fn new<S: Into<String>>(session_id: S, phase: SessionLifecyclePhase) -> Self {
        Self {
            session_id: session_id.into(),
            phase,
            issued_at: SystemTime::now(),
            payload: SessionLifecyclePayload::None,
        }
    }

    pub fn created<S: Into<String>>(session_id: S, candidate_id: &str, kind: SessionKind) -> Self {
        Self {
            payload: SessionLifecyclePayload::Created(CreatedPayload {
                candidate_id: candidate_id.to_string(),
                kind,
            }),
            ..Self::new(session_id, SessionLifecyclePhase::Created)
        }
    }

    pub fn finalizing<S: Into<String>>(
        session_id: S,
        reason: Option<TerminationReason>,
        answers: usize,
    ) -> Self {
        Self {
            payload: SessionLifecyclePayload::Finalizing(FinalizingPayload { reason, answers }),
            ..Self::new(session_id, SessionLifecyclePhase::Finalizing)
        }
    }

    /// `Expired` sessions are persisted too; `expired` selects the phase.
    pub fn completed<S: Into<String>>(session_id: S, result_id: String, expired: bool) -> Self {
        let phase = if expired {
            SessionLifecyclePhase::Expired
        } else {
            SessionLifecyclePhase::Completed
        };
        Self {
            payload: SessionLifecyclePayload::Completed(CompletionPayload { result_id }),
            ..Self::new(session_id, phase)
        }
    }

    pub fn failed<S: Into<String>>(session_id: S, error: impl Into<String>) -> Self {
        Self {
            payload: SessionLifecyclePayload::Failed(FailurePayload {
                error: error.into(),
            }),
            ..Self::new(session_id, SessionLifecyclePhase::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_helper_selects_expired_phase() {
        let update = SessionLifecycleUpdate::completed("session", "result-1".into(), true);
        assert_eq!(update.phase, SessionLifecyclePhase::Expired);
        assert_eq!(
            update.payload,
            SessionLifecyclePayload::Completed(CompletionPayload {
                result_id: "result-1".into()
            })
        );
    }

    #[test]
    fn failed_helper_carries_error() {
        let update = SessionLifecycleUpdate::failed("session", "store offline");
        assert_eq!(update.phase, SessionLifecyclePhase::Failed);
        assert!(matches!(
            update.payload,
            SessionLifecyclePayload::Failed(FailurePayload { ref error }) if error == "store offline"
        ));
    }
}
