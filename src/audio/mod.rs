//! Audio plumbing between the media room and the exam state machine.
//!
//! Inbound frames are reduced to canonical 16 kHz mono PCM by
//! [`AudioFrameIngest`]; synthesized examiner clips are decoded by
//! [`decode_clip`] and streamed back out at a fixed cadence by
//! [`AudioOutputLoop`].

mod codec;
mod ingest;
mod output;
pub(crate) mod resample;

pub use codec::{decode_clip, encode_wav, ClipFrame, DecodeError, PcmLayout, SynthesizedClip};
pub use ingest::{
    Answer, AudioFrameIngest, IngestOutcome, LevelReading, TurnGate, TurnSubmission,
};
pub use output::{AudioOutputLoop, DrainCallback, MixerStats, OutputMixer, PlaybackItem};

use std::sync::Arc;
use std::time::Duration;

/// Sample rate of every captured [`Answer`].
pub const CANONICAL_SAMPLE_RATE: u32 = 16_000;

/// One block of interleaved signed 16-bit PCM.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    pub samples: Arc<[i16]>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn new(samples: impl Into<Arc<[i16]>>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels: channels.max(1),
        }
    }

    pub fn silence(sample_rate: u32, channels: u16, duration: Duration) -> Self {
        let channels = channels.max(1);
        let per_channel = samples_for(sample_rate, duration);
        let samples = vec![0_i16; per_channel * usize::from(channels)];
        Self::new(samples, sample_rate, channels)
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples_per_channel() as f64 / self.sample_rate as f64)
    }

    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|&sample| sample == 0)
    }
}

/// Number of per-channel samples covering `duration` at `sample_rate`.
pub fn samples_for(sample_rate: u32, duration: Duration) -> usize {
    (sample_rate as u128 * duration.as_micros() / 1_000_000) as usize
}
