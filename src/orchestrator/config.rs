use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::prompts::PromptSet;

pub const CONFIG_PATH_ENV: &str = "SPEAKING_EXAM_CONFIG";
const ENV_PREFIX: &str = "SPEAKING_EXAM_";

/// Top-level configuration for one engine process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub exam: ExamConfig,
    pub ingest: IngestConfig,
    pub output: OutputConfig,
    pub synthesis: SynthesisConfig,
    pub registry: RegistryConfig,
    pub topics: TopicConfig,
}

impl EngineConfig {
    /// Reads the optional JSON file named by `SPEAKING_EXAM_CONFIG`, then
    /// applies `SPEAKING_EXAM_*` overrides from the environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!(target: "engine_config", path = %path.display(), "loaded engine config");
        Ok(config)
    }

    pub(crate) fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "PART1_ROUNDS", &mut self.exam.part1_rounds);
        override_parsed(&lookup, "FOLLOWUP_ROUNDS", &mut self.exam.followup_rounds);
        override_parsed(&lookup, "DISCUSSION_ROUNDS", &mut self.exam.discussion_rounds);
        override_millis(&lookup, "PREPARATION_MS", &mut self.exam.preparation_duration);
        override_millis(&lookup, "STATEMENT_MS", &mut self.exam.statement_duration);
        override_millis(&lookup, "AI_TIMEOUT_MS", &mut self.exam.ai_timeout);
        override_parsed(&lookup, "AI_RETRY_CAP", &mut self.exam.ai_retry_cap);
        override_parsed(&lookup, "OUTPUT_SAMPLE_RATE", &mut self.output.sample_rate);
        override_parsed(&lookup, "OUTPUT_CHANNELS", &mut self.output.channels);
        override_millis(&lookup, "SWEEP_INTERVAL_MS", &mut self.registry.sweep_interval);
        override_parsed(&lookup, "FINALIZED_RETENTION", &mut self.registry.finalized_retention);
        if let Some(endpoint) = lookup("TTS_ENDPOINT") {
            self.synthesis.endpoint = endpoint;
        }
        if let Some(path) = lookup("TTS_REF_AUDIO") {
            self.synthesis.voice.ref_audio_path = path;
        }
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!(
            target: "engine_config",
            key = %format!("{ENV_PREFIX}{key}"),
            value = %raw,
            "ignoring unparsable override"
        ),
    }
}

fn override_millis<F>(lookup: &F, key: &str, slot: &mut Duration)
where
    F: Fn(&str) -> Option<String>,
{
    let mut millis = duration_to_ms(*slot);
    override_parsed(lookup, key, &mut millis);
    *slot = Duration::from_millis(millis);
}

pub(crate) fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

/// Phase timing, round counts and AI call policy for the oral exam.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExamConfig {
    pub part1_rounds: u32,
    pub followup_rounds: u32,
    pub discussion_rounds: u32,
    #[serde(with = "duration_ms")]
    pub preparation_duration: Duration,
    #[serde(with = "duration_ms")]
    pub statement_duration: Duration,
    #[serde(with = "duration_ms")]
    pub ai_timeout: Duration,
    /// Consecutive AI failures tolerated within one phase before aborting.
    pub ai_retry_cap: u32,
    pub markers: MarkerSet,
    pub prompts: PromptSet,
}

impl Default for ExamConfig {
    fn default() -> Self {
        Self {
            part1_rounds: 2,
            followup_rounds: 3,
            discussion_rounds: 3,
            preparation_duration: Duration::from_secs(60),
            statement_duration: Duration::from_secs(120),
            ai_timeout: Duration::from_secs(60),
            ai_retry_cap: 3,
            markers: MarkerSet::default(),
            prompts: PromptSet::default(),
        }
    }
}

/// Literal delimiter pair wrapping one structured block in AI output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerPair {
    pub open: String,
    pub close: String,
}

impl MarkerPair {
    /// `[name]` ... `[/name]`
    pub fn tag(name: &str) -> Self {
        Self {
            open: format!("[{name}]"),
            close: format!("[/{name}]"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerSet {
    pub task_card: MarkerPair,
    pub hand_off: MarkerPair,
    pub closing_signal: MarkerPair,
    pub feedback: MarkerPair,
}

impl MarkerSet {
    pub fn all(&self) -> [&MarkerPair; 4] {
        [
            &self.task_card,
            &self.hand_off,
            &self.closing_signal,
            &self.feedback,
        ]
    }
}

impl Default for MarkerSet {
    fn default() -> Self {
        Self {
            task_card: MarkerPair::tag("task_card"),
            hand_off: MarkerPair::tag("begin_word"),
            closing_signal: MarkerPair::tag("last_turn_ends"),
            feedback: MarkerPair::tag("feedback"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Emit one loudness reading every this many inbound frames.
    pub level_interval_frames: u32,
    pub level_channel_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            level_interval_frames: 25,
            level_channel_capacity: 32,
        }
    }
}

/// Shape and cadence of the outbound examiner track.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(with = "duration_ms")]
    pub frame_duration: Duration,
    pub queue_capacity: usize,
}

impl OutputConfig {
    pub fn samples_per_frame(&self) -> usize {
        crate::audio::samples_for(self.sample_rate, self.frame_duration)
            * usize::from(self.channels.max(1))
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            frame_duration: Duration::from_millis(10),
            queue_capacity: 64,
        }
    }
}

/// Reference voice used by the speech-synthesis collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceProfile {
    pub ref_audio_path: String,
    pub prompt_text: String,
    pub prompt_lang: String,
    pub text_lang: String,
    /// Layout assumed for `audio/pcm` responses, which carry no header.
    pub raw_sample_rate: u32,
    pub raw_channels: u16,
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self {
            ref_audio_path: String::new(),
            prompt_text: String::new(),
            prompt_lang: "en".into(),
            text_lang: "en".into(),
            raw_sample_rate: 32_000,
            raw_channels: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub endpoint: String,
    pub media_type: String,
    pub voice: VoiceProfile,
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    pub block_capacity: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9880".into(),
            media_type: "wav".into(),
            voice: VoiceProfile::default(),
            request_timeout: Duration::from_secs(30),
            block_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    pub lifecycle_capacity: usize,
    /// Finalized sessions remembered for idempotent finalize and lookup.
    pub finalized_retention: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            lifecycle_capacity: 64,
            finalized_retention: 1_024,
        }
    }
}

/// Data-channel topics shared with the candidate client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub control: String,
    pub audio_level: String,
    pub manual_submit: Vec<String>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            control: "control".into(),
            audio_level: "audio_level".into(),
            manual_submit: vec!["userManualInterruption".into(), "manual_submit".into()],
        }
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(super::duration_to_ms(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_exam_protocol() {
        let config = EngineConfig::default();
        assert_eq!(config.exam.part1_rounds, 2);
        assert_eq!(config.exam.followup_rounds, 3);
        assert_eq!(config.exam.discussion_rounds, 3);
        assert_eq!(config.exam.preparation_duration, Duration::from_secs(60));
        assert_eq!(config.exam.statement_duration, Duration::from_secs(120));
        assert_eq!(config.output.samples_per_frame(), 480);
        assert_eq!(config.exam.markers.hand_off.open, "[begin_word]");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let raw = r#"{ "exam": { "part1_rounds": 4, "preparation_duration": 1500 } }"#;
        let config: EngineConfig = serde_json::from_str(raw).expect("parse");
        assert_eq!(config.exam.part1_rounds, 4);
        assert_eq!(config.exam.preparation_duration, Duration::from_millis(1_500));
        assert_eq!(config.exam.followup_rounds, 3);
        assert_eq!(config.registry.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn environment_overrides_apply_and_skip_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PART1_ROUNDS", "5"),
            ("AI_RETRY_CAP", "not-a-number"),
            ("PREPARATION_MS", "250"),
            ("TTS_ENDPOINT", "http://tts.local:9880"),
            ("FINALIZED_RETENTION", "16"),
        ]);
        let mut config = EngineConfig::default();
        config.apply_overrides(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.exam.part1_rounds, 5);
        assert_eq!(config.exam.ai_retry_cap, 3);
        assert_eq!(config.exam.preparation_duration, Duration::from_millis(250));
        assert_eq!(config.synthesis.endpoint, "http://tts.local:9880");
        assert_eq!(config.registry.finalized_retention, 16);
    }
}
