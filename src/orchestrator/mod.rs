//! Exam phase orchestration: configuration, examiner prompts, AI response
//! parsing and the per-session runtime.

mod constants;
mod runtime;

pub mod candidate;
pub mod config;
pub mod error;
pub mod extract;
pub mod prompts;
pub mod traits;
pub mod types;

pub use candidate::{CandidateScript, ScriptedCandidate};
pub use config::{EngineConfig, ExamConfig, MarkerPair, MarkerSet};
pub use error::ExamError;
pub use extract::{parse_response, ParsedResponse};
pub use runtime::{
    spawn_session, ConversationRecord, ExamRecord, ExamSessionHandle, SessionSignal,
    SessionTasks, SessionWiring, TaskCardRecord,
};
pub use traits::{
    ChatPart, ConversationFactory, ConversationalAi, PronunciationAssessor, PronunciationReport,
    SpeechSynthesizer, SynthesizedAudio,
};
pub use types::{ControlEvent, ExamPaper, ExamPhase, ExamProgress, RoundCounters, TerminationReason};

#[cfg(test)]
pub(crate) mod tests;
