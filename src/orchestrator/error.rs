use thiserror::Error;

use super::types::ExamPhase;

#[derive(Debug, Error)]
pub enum ExamError {
    #[error("conversational AI unavailable in {phase:?} after {attempts} consecutive failures")]
    AiUnavailable { phase: ExamPhase, attempts: u32 },
    #[error("session cancelled")]
    Cancelled,
    #[error("answer channel closed")]
    AnswerChannelClosed,
    #[error("session start signal dropped before connection")]
    StartAborted,
}
