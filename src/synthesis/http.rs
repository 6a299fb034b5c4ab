use std::io::Read;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::orchestrator::config::{SynthesisConfig, VoiceProfile};
use crate::orchestrator::traits::{SpeechSynthesizer, SynthesizedAudio};

const TARGET: &str = "synthesis_queue";
const MAX_RESPONSE_BYTES: u64 = 32 * 1024 * 1024;

/// Client for a GPT-SoVITS style `GET /tts` voice server.
#[derive(Clone)]
pub struct HttpSpeechSynthesizer {
    agent: ureq::Agent,
    endpoint: String,
    media_type: String,
}

impl HttpSpeechSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(config.request_timeout)
            .build();
        Self {
            agent,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            media_type: config.media_type.clone(),
        }
    }

    pub(crate) fn tts_url(&self) -> String {
        format!("{}/tts", self.endpoint)
    }

    fn fallback_mime(media_type: &str) -> &'static str {
        match media_type {
            "wav" => "audio/wav",
            "raw" | "pcm" => "audio/pcm",
            _ => "application/octet-stream",
        }
    }

    fn fetch(
        agent: &ureq::Agent,
        url: &str,
        media_type: &str,
        text: &str,
        voice: &VoiceProfile,
    ) -> Result<SynthesizedAudio> {
        let response = agent
            .get(url)
            .query("text", text)
            .query("text_lang", &voice.text_lang)
            .query("ref_audio_path", &voice.ref_audio_path)
            .query("prompt_text", &voice.prompt_text)
            .query("prompt_lang", &voice.prompt_lang)
            .query("media_type", media_type)
            .call()
            .map_err(|err| anyhow!("voice server request failed: {err}"))?;

        if !(200..300).contains(&response.status()) {
            return Err(anyhow!(
                "voice server returned HTTP status {}",
                response.status()
            ));
        }

        let mime_type = response
            .header("Content-Type")
            .map(str::to_string)
            .unwrap_or_else(|| Self::fallback_mime(media_type).to_string());
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_RESPONSE_BYTES)
            .read_to_end(&mut bytes)
            .context("failed to read voice server response")?;

        Ok(SynthesizedAudio {
            bytes: Bytes::from(bytes),
            mime_type,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Result<SynthesizedAudio> {
        let agent = self.agent.clone();
        let url = self.tts_url();
        let media_type = self.media_type.clone();
        let text = text.to_string();
        let voice = voice.clone();
        let started = Instant::now();

        let audio = tokio::task::spawn_blocking(move || {
            Self::fetch(&agent, &url, &media_type, &text, &voice)
        })
        .await
        .context("voice server worker panicked")??;

        debug!(
            target: TARGET,
            bytes = audio.bytes.len(),
            mime = %audio.mime_type,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "voice server responded"
        );
        Ok(audio)
    }
}
