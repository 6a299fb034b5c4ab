use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::audio::{encode_wav, AudioFrame};
use crate::orchestrator::config::{EngineConfig, VoiceProfile};
use crate::orchestrator::prompts::PromptSet;
use crate::orchestrator::traits::{ChatPart, ConversationalAi, SpeechSynthesizer, SynthesizedAudio};
use crate::orchestrator::types::{ControlEvent, ExamPaper};

pub(crate) const TASK_CARD: &str = "Describe a memorable trip you have taken.";
pub(crate) const HAND_OFF: &str = "You have one minute to prepare.";
pub(crate) const FEEDBACK: &str = "Fluent, with a good range of vocabulary.";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AiCall {
    pub kind: &'static str,
    pub texts: Vec<String>,
    pub audio_parts: usize,
}

/// Examiner double that answers by recognising the configured prompts.
pub(crate) struct RuleAi {
    prompts: PromptSet,
    calls: Mutex<Vec<AiCall>>,
    failing_calls: HashSet<usize>,
    always_fail: bool,
    counter: AtomicUsize,
}

impl RuleAi {
    pub(crate) fn new(prompts: PromptSet) -> Self {
        Self {
            prompts,
            calls: Mutex::new(Vec::new()),
            failing_calls: HashSet::new(),
            always_fail: false,
            counter: AtomicUsize::new(0),
        }
    }

    /// Fails the calls at these zero-based positions.
    pub(crate) fn failing_at(mut self, calls: &[usize]) -> Self {
        self.failing_calls = calls.iter().copied().collect();
        self
    }

    pub(crate) fn unavailable(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub(crate) fn calls(&self) -> Vec<AiCall> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }

    fn record(&self, call: AiCall) -> Result<()> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().expect("calls lock poisoned").push(call);
        if self.always_fail || self.failing_calls.contains(&index) {
            return Err(anyhow!("examiner model unavailable (call {index})"));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationalAi for RuleAi {
    async fn initiate(&self, prompt: &str) -> Result<String> {
        self.record(AiCall {
            kind: "initiate",
            texts: vec![prompt.to_string()],
            audio_parts: 0,
        })?;

        if prompt.contains("part two") {
            Ok(format!(
                "[task_card]{TASK_CARD}[/task_card]\n[begin_word]{HAND_OFF}[/begin_word]"
            ))
        } else {
            Ok("Good morning. Let's talk about your hometown. Where are you from?".into())
        }
    }

    async fn chat(&self, parts: Vec<ChatPart>) -> Result<String> {
        let mut texts = Vec::new();
        let mut audio_parts = 0;
        for part in parts {
            match part {
                ChatPart::Text(text) => texts.push(text),
                ChatPart::Audio { .. } => audio_parts += 1,
            }
        }
        let reply = if texts.contains(&self.prompts.analysis) {
            format!("Thank you. [feedback]{FEEDBACK}[/feedback]")
        } else if texts.contains(&self.prompts.last_turn) {
            "Thank you, that is the end of part one. [last_turn_ends][/last_turn_ends]".to_string()
        } else if texts.contains(&self.prompts.time_up) {
            "Thank you. Would you go there again?".to_string()
        } else if texts.contains(&self.prompts.part3_opening) {
            "Let's move on to part three. Why do people travel?".to_string()
        } else {
            "I see. Could you tell me more about that?".to_string()
        };

        self.record(AiCall {
            kind: "chat",
            texts,
            audio_parts,
        })?;
        Ok(reply)
    }
}

/// Voice double returning a short 16 kHz WAV tone per utterance.
pub(crate) struct ToneSynthesizer;

#[async_trait]
impl SpeechSynthesizer for ToneSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &VoiceProfile) -> Result<SynthesizedAudio> {
        let level = 1_000 + text.len() as i16;
        let wav = encode_wav(&[level; 320], 16_000)?;
        Ok(SynthesizedAudio {
            bytes: Bytes::from(wav),
            mime_type: "audio/wav".into(),
        })
    }
}

pub(crate) fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.exam.preparation_duration = Duration::from_millis(50);
    config.exam.statement_duration = Duration::from_secs(5);
    config.exam.ai_timeout = Duration::from_secs(1);
    config.synthesis.request_timeout = Duration::from_secs(1);
    config
}

pub(crate) fn paper() -> ExamPaper {
    ExamPaper {
        paper_id: "paper-7".into(),
        warm_up_topics: vec!["hometown".into(), "music".into()],
        part2_topic: "a memorable trip".into(),
    }
}

pub(crate) fn speech_frame() -> AudioFrame {
    let samples: Vec<i16> = (0..960).map(|i| if i % 2 == 0 { 3_000 } else { -3_000 }).collect();
    AudioFrame::new(samples, 48_000, 1)
}

pub(crate) async fn wait_for<F>(rx: &mut broadcast::Receiver<ControlEvent>, mut matches: F) -> ControlEvent
where
    F: FnMut(&ControlEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("control channel failed: {err}"),
            }
        }
    })
    .await
    .expect("control event in time")
}

pub(crate) fn drain(rx: &mut broadcast::Receiver<ControlEvent>) -> Vec<ControlEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
