use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::audio::Answer;

use super::config::VoiceProfile;

/// One piece of a chat turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatPart {
    Audio { mime_type: String, data: Bytes },
    Text(String),
}

impl ChatPart {
    pub fn answer(answer: &Answer) -> Self {
        ChatPart::Audio {
            mime_type: format!("audio/pcm;rate={}", answer.sample_rate),
            data: answer.pcm_le_bytes(),
        }
    }
}

/// One conversation with the examiner model. Calls on one instance are
/// issued strictly one at a time by the session's state machine.
#[async_trait]
pub trait ConversationalAi: Send + Sync {
    async fn initiate(&self, prompt: &str) -> Result<String>;

    async fn chat(&self, parts: Vec<ChatPart>) -> Result<String>;
}

#[async_trait]
pub trait ConversationFactory: Send + Sync {
    async fn open(&self, session_id: &str) -> Result<Arc<dyn ConversationalAi>>;
}

#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Bytes,
    pub mime_type: String,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Result<SynthesizedAudio>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhonemeScore {
    pub phoneme: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PronunciationReport {
    pub transcript: String,
    pub phonemes: Vec<PhonemeScore>,
    pub score: f32,
}

/// Scores one captured answer, supplied as a 16 kHz mono WAV.
#[async_trait]
pub trait PronunciationAssessor: Send + Sync {
    async fn assess(&self, wav: Bytes) -> Result<PronunciationReport>;
}
