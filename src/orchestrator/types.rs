use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::config::duration_to_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExamPhase {
    AwaitingConnection,
    Part1Init,
    Part1Conversation,
    Part2AwaitPrep,
    Part2Preparation,
    Part2Statement,
    Part2Followup,
    Part3Discussion,
    Evaluating,
    Terminated,
}

impl ExamPhase {
    /// Phases whose inbound audio is appended to the turn buffer.
    pub fn is_listening(self) -> bool {
        matches!(
            self,
            ExamPhase::Part1Conversation
                | ExamPhase::Part2Statement
                | ExamPhase::Part2Followup
                | ExamPhase::Part3Discussion
        )
    }

    /// Phases that end early on a manual submit.
    pub fn accepts_turn_end(self) -> bool {
        self.is_listening() || self == ExamPhase::Part2Preparation
    }

    pub fn is_terminal(self) -> bool {
        self == ExamPhase::Terminated
    }

    /// State name understood by the candidate client.
    pub fn client_label(self) -> &'static str {
        match self {
            ExamPhase::AwaitingConnection => "Awaiting_Connection",
            ExamPhase::Part1Init => "PartI_Initiation",
            ExamPhase::Part1Conversation => "PartI_Conversation",
            ExamPhase::Part2AwaitPrep => "PartII_Await_Task_Card",
            ExamPhase::Part2Preparation => "PartII_Preparation",
            ExamPhase::Part2Statement => "PartII_Student_Statement",
            ExamPhase::Part2Followup => "PartII_Follow_Up_Questioning",
            ExamPhase::Part3Discussion => "PartIII_Discussion",
            ExamPhase::Evaluating => "PartIV_Await_For_Feedback",
            ExamPhase::Terminated => "Terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    Disconnected,
    Cancelled,
    AiUnavailable,
    Fault,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Completed => "completed",
            TerminationReason::Disconnected => "disconnected",
            TerminationReason::Cancelled => "cancelled",
            TerminationReason::AiUnavailable => "ai_unavailable",
            TerminationReason::Fault => "fault",
        }
    }
}

/// Fire-and-forget notification for the candidate client.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    NextState {
        phase: ExamPhase,
        task_card: Option<String>,
    },
    ResumeRecording {
        phase: ExamPhase,
    },
    TimerStarted {
        phase: ExamPhase,
        duration: Duration,
    },
    AwaitingAnalysis,
    Feedback {
        text: String,
    },
    Error {
        message: String,
    },
    SessionEnded {
        reason: TerminationReason,
    },
}

impl ControlEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ControlEvent::NextState { .. } => "next_state",
            ControlEvent::ResumeRecording { .. } => "resume_recording",
            ControlEvent::TimerStarted { .. } => "timer_started",
            ControlEvent::AwaitingAnalysis => "await_for_analyze_result",
            ControlEvent::Feedback { .. } => "feedback",
            ControlEvent::Error { .. } => "error",
            ControlEvent::SessionEnded { .. } => "session_ended",
        }
    }

    /// Phase a candidate should (re)start recording in, if any.
    pub fn recording_phase(&self) -> Option<ExamPhase> {
        match self {
            ControlEvent::NextState { phase, .. } | ControlEvent::ResumeRecording { phase } => {
                Some(*phase)
            }
            _ => None,
        }
    }

    pub fn to_payload(&self) -> Value {
        let event = self.name();
        match self {
            ControlEvent::NextState {
                phase,
                task_card: Some(card),
            } => json!({ "event": event, "data": phase.client_label(), "task_card": card }),
            ControlEvent::NextState { phase, .. } | ControlEvent::ResumeRecording { phase } => {
                json!({ "event": event, "data": phase.client_label() })
            }
            ControlEvent::TimerStarted { phase, duration } => json!({
                "event": event,
                "data": phase.client_label(),
                "duration_ms": duration_to_ms(*duration),
            }),
            ControlEvent::AwaitingAnalysis => json!({ "event": event }),
            ControlEvent::Feedback { text } => json!({ "event": event, "data": text }),
            ControlEvent::Error { message } => json!({ "event": event, "data": message }),
            ControlEvent::SessionEnded { reason } => {
                json!({ "event": event, "data": reason.as_str() })
            }
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(&self.to_payload()).map(Bytes::from)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundCounters {
    pub part1: u32,
    pub followup: u32,
    pub discussion: u32,
}

/// Snapshot published by the state machine after every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExamProgress {
    pub phase: ExamPhase,
    pub rounds: RoundCounters,
    pub answers_captured: usize,
}

impl Default for ExamProgress {
    fn default() -> Self {
        Self {
            phase: ExamPhase::AwaitingConnection,
            rounds: RoundCounters::default(),
            answers_captured: 0,
        }
    }
}

/// Paper-specific inputs rendered into the phase prompts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamPaper {
    pub paper_id: String,
    pub warm_up_topics: Vec<String>,
    pub part2_topic: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listening_phases_are_the_answer_phases() {
        let listening: Vec<ExamPhase> = [
            ExamPhase::AwaitingConnection,
            ExamPhase::Part1Init,
            ExamPhase::Part1Conversation,
            ExamPhase::Part2AwaitPrep,
            ExamPhase::Part2Preparation,
            ExamPhase::Part2Statement,
            ExamPhase::Part2Followup,
            ExamPhase::Part3Discussion,
            ExamPhase::Evaluating,
            ExamPhase::Terminated,
        ]
        .into_iter()
        .filter(|phase| phase.is_listening())
        .collect();

        assert_eq!(
            listening,
            vec![
                ExamPhase::Part1Conversation,
                ExamPhase::Part2Statement,
                ExamPhase::Part2Followup,
                ExamPhase::Part3Discussion,
            ]
        );
        assert!(ExamPhase::Part2Preparation.accepts_turn_end());
        assert!(!ExamPhase::Part2AwaitPrep.accepts_turn_end());
    }

    #[test]
    fn control_events_encode_client_wire_format() {
        let next = ControlEvent::NextState {
            phase: ExamPhase::Part2Preparation,
            task_card: Some("Describe a trip".into()),
        };
        assert_eq!(
            next.to_payload(),
            json!({
                "event": "next_state",
                "data": "PartII_Preparation",
                "task_card": "Describe a trip",
            })
        );

        let timer = ControlEvent::TimerStarted {
            phase: ExamPhase::Part2Statement,
            duration: Duration::from_secs(120),
        };
        assert_eq!(timer.to_payload()["duration_ms"], 120_000);

        let analysis = ControlEvent::AwaitingAnalysis.encode().expect("encode");
        assert_eq!(analysis.as_ref(), br#"{"event":"await_for_analyze_result"}"#);
    }
}
