use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::orchestrator::types::{ExamPhase, RoundCounters, TerminationReason};

pub(crate) const TARGET: &str = "telemetry::exam";
pub(crate) const EVENT_PHASE: &str = "exam_phase_transition";
pub(crate) const EVENT_AI: &str = "exam_ai_exchange";
pub(crate) const EVENT_UTTERANCE: &str = "exam_utterance_synthesized";
pub(crate) const EVENT_LEVEL: &str = "exam_audio_level";
pub(crate) const EVENT_FINALIZED: &str = "exam_session_finalized";

#[derive(Debug, Serialize)]
pub struct PhaseTransitionEvent<'a> {
    pub session_id: &'a str,
    pub from: &'static str,
    pub to: &'static str,
    pub rounds: RoundCounters,
    pub elapsed_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct AiExchangeEvent<'a> {
    pub session_id: &'a str,
    pub phase: &'static str,
    pub kind: &'static str,
    pub latency_ms: u64,
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct UtteranceSynthesizedEvent {
    pub block: u64,
    pub sequence: u64,
    pub chars: usize,
    pub latency_ms: u64,
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionFinalizedEvent<'a> {
    pub session_id: &'a str,
    pub kind: &'static str,
    pub outcome: &'static str,
    pub answers: usize,
    pub result_id: Option<&'a str>,
}

pub fn record_phase_transition(
    session_id: &str,
    from: ExamPhase,
    to: ExamPhase,
    rounds: RoundCounters,
    elapsed: Duration,
) {
    let event = PhaseTransitionEvent {
        session_id,
        from: from.client_label(),
        to: to.client_label(),
        rounds,
        elapsed_ms: duration_to_ms(elapsed),
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_PHASE,
            session_id,
            from = event.from,
            to = event.to,
            elapsed_ms = event.elapsed_ms,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_PHASE,
            %err,
            "failed to encode phase transition event"
        ),
    }
}

pub fn record_ai_exchange(
    session_id: &str,
    phase: ExamPhase,
    kind: &'static str,
    latency: Duration,
    ok: bool,
) {
    let event = AiExchangeEvent {
        session_id,
        phase: phase.client_label(),
        kind,
        latency_ms: duration_to_ms(latency),
        ok,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_AI,
            session_id,
            phase = event.phase,
            kind,
            latency_ms = event.latency_ms,
            ok,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_AI,
            %err,
            "failed to encode AI exchange event"
        ),
    }
}

pub fn record_utterance_synthesized(
    block: u64,
    sequence: u64,
    chars: usize,
    latency: Duration,
    ok: bool,
) {
    let event = UtteranceSynthesizedEvent {
        block,
        sequence,
        chars,
        latency_ms: duration_to_ms(latency),
        ok,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_UTTERANCE,
            block,
            sequence,
            latency_ms = event.latency_ms,
            ok,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_UTTERANCE,
            %err,
            "failed to encode utterance event"
        ),
    }
}

/// Runs at frame cadence, so it stays at debug and skips the JSON payload.
pub fn record_audio_level(frame_index: u64, dbfs: f32, listening: bool) {
    debug!(
        target: TARGET,
        event = EVENT_LEVEL,
        frame_index,
        dbfs = f64::from(dbfs),
        listening
    );
}

pub fn record_session_finalized(
    session_id: &str,
    kind: &'static str,
    outcome: &'static str,
    answers: usize,
    result_id: Option<&str>,
) {
    let event = SessionFinalizedEvent {
        session_id,
        kind,
        outcome,
        answers,
        result_id,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_FINALIZED,
            session_id,
            kind,
            outcome,
            answers,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_FINALIZED,
            %err,
            "failed to encode session finalized event"
        ),
    }
}

/// Termination reasons as they appear in finalize telemetry.
pub fn outcome_label(reason: Option<TerminationReason>) -> &'static str {
    reason.map(|reason| reason.as_str()).unwrap_or("unknown")
}

fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
