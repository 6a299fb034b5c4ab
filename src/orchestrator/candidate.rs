//! Automatic candidate: answers every listening phase with a synthetic tone
//! through the same handle a live room would use.

use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::audio::{samples_for, AudioFrame, TurnSubmission};
use crate::orchestrator::config::duration_ms;
use crate::orchestrator::types::{ControlEvent, ExamPhase};

use super::runtime::ExamSessionHandle;

const TARGET: &str = "exam_candidate";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateScript {
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(with = "duration_ms")]
    pub frame_duration: Duration,
    #[serde(with = "duration_ms")]
    pub answer_duration: Duration,
    /// Pause between a phase opening and the first answer frame.
    #[serde(with = "duration_ms")]
    pub think_time: Duration,
    pub tone_hz: f32,
    pub amplitude: f32,
    /// Submit during preparation instead of waiting for the timer.
    pub finish_preparation_early: bool,
}

impl Default for CandidateScript {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            frame_duration: Duration::from_millis(20),
            answer_duration: Duration::from_millis(400),
            think_time: Duration::ZERO,
            tone_hz: 220.0,
            amplitude: 0.25,
            finish_preparation_early: false,
        }
    }
}

impl CandidateScript {
    fn answer_frames(&self) -> Vec<AudioFrame> {
        let channels = self.channels.max(1);
        let per_frame = samples_for(self.sample_rate, self.frame_duration).max(1);
        let total = samples_for(self.sample_rate, self.answer_duration);
        let step = TAU * self.tone_hz / self.sample_rate.max(1) as f32;

        let mut frames = Vec::with_capacity(total / per_frame + 1);
        let mut index = 0usize;
        while index < total {
            let len = per_frame.min(total - index);
            let mut samples = Vec::with_capacity(len * usize::from(channels));
            for offset in 0..len {
                let value = ((index + offset) as f32 * step).sin() * self.amplitude;
                let sample = (value * f32::from(i16::MAX)) as i16;
                samples.extend(std::iter::repeat(sample).take(usize::from(channels)));
            }
            frames.push(AudioFrame::new(samples, self.sample_rate, channels));
            index += len;
        }
        frames
    }
}

pub struct ScriptedCandidate {
    handle: Arc<ExamSessionHandle>,
    script: CandidateScript,
}

impl ScriptedCandidate {
    pub fn new(handle: Arc<ExamSessionHandle>, script: CandidateScript) -> Self {
        Self { handle, script }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut control = self.handle.subscribe_control();
        let signal = self.handle.signal();
        let mut answered = 0u64;

        loop {
            let event = tokio::select! {
                event = control.recv() => event,
                _ = signal.cancelled() => break,
            };
            let event = match event {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: TARGET, skipped, "candidate missed control events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if matches!(event, ControlEvent::SessionEnded { .. }) {
                break;
            }
            let Some(phase) = event.recording_phase() else {
                continue;
            };

            if phase == ExamPhase::Part2Preparation {
                if self.script.finish_preparation_early {
                    self.pause().await;
                    let outcome = self.handle.submit_turn();
                    debug!(target: TARGET, ?outcome, "ended preparation early");
                }
                continue;
            }
            if !phase.is_listening() {
                continue;
            }

            self.pause().await;
            for frame in self.script.answer_frames() {
                self.handle.push_frame(&frame);
            }
            match self.handle.submit_turn() {
                TurnSubmission::Submitted { sequence, samples } => {
                    answered += 1;
                    debug!(target: TARGET, ?phase, sequence, samples, "scripted answer submitted");
                }
                outcome => warn!(target: TARGET, ?phase, ?outcome, "scripted answer not taken"),
            }
        }

        info!(
            target: TARGET,
            session_id = %self.handle.session_id(),
            answered,
            "scripted candidate finished"
        );
    }

    async fn pause(&self) {
        if !self.script.think_time.is_zero() {
            sleep(self.script.think_time).await;
        }
    }
}
