//! Speaking Exam Core Library
//!
//! Session engine for live, AI-examined speaking tests: the exam phase state
//! machine, candidate turn capture, examiner speech synthesis and playback,
//! the session registry, evaluation, persistence, and telemetry.

pub mod audio;
pub mod evaluation;
pub mod orchestrator;
pub mod persistence;
pub mod room;
pub mod session;
pub mod synthesis;
pub mod telemetry;
