use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::orchestrator::config::OutputConfig;
use crate::orchestrator::SessionSignal;
use crate::room::{RoomConnection, RoomError};

use super::codec::{ClipFrame, SynthesizedClip};
use super::resample::{downmix_to_mono, f32_to_i16, SampleRateConverter};
use super::AudioFrame;

const TARGET: &str = "audio_output";

/// Entries of the ready-queue between the synthesis producer and the mixer.
#[derive(Debug)]
pub enum PlaybackItem {
    Clip {
        sequence: u64,
        text: String,
        clip: SynthesizedClip,
    },
    /// Every clip of `block` has been queued ahead of this marker.
    BlockDrained { block: u64 },
}

/// Fired once the last sample queued before a [`PlaybackItem::BlockDrained`]
/// marker has been emitted.
pub type DrainCallback = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MixerStats {
    pub frames_emitted: u64,
    pub silence_frames: u64,
    pub clip_frames: u64,
    pub clips_started: u64,
    pub corrupt_frames_skipped: u64,
    pub blocks_drained: u64,
}

/// Repacketizes queued clips into fixed-shape output frames.
pub struct OutputMixer {
    config: OutputConfig,
    ready_rx: mpsc::Receiver<PlaybackItem>,
    pending: VecDeque<i16>,
    queued_total: u64,
    played_total: u64,
    drains: VecDeque<(u64, u64)>,
    on_drain: Option<DrainCallback>,
    stats: MixerStats,
}

impl OutputMixer {
    pub fn new(config: OutputConfig, ready_rx: mpsc::Receiver<PlaybackItem>) -> Self {
        Self {
            config,
            ready_rx,
            pending: VecDeque::new(),
            queued_total: 0,
            played_total: 0,
            drains: VecDeque::new(),
            on_drain: None,
            stats: MixerStats::default(),
        }
    }

    pub fn with_drain_callback(mut self, callback: DrainCallback) -> Self {
        self.on_drain = Some(callback);
        self
    }

    pub fn stats(&self) -> MixerStats {
        self.stats
    }

    pub fn frame_duration(&self) -> Duration {
        self.config.frame_duration
    }

    /// Produces exactly one frame; silence when nothing is ready.
    pub fn next_frame(&mut self) -> AudioFrame {
        let frame_len = self.config.samples_per_frame().max(1);
        self.fill(frame_len);

        self.stats.frames_emitted += 1;
        let frame = if self.pending.is_empty() {
            self.stats.silence_frames += 1;
            AudioFrame::silence(
                self.config.sample_rate,
                self.config.channels,
                self.config.frame_duration,
            )
        } else {
            let take = frame_len.min(self.pending.len());
            let mut samples: Vec<i16> = self.pending.drain(..take).collect();
            samples.resize(frame_len, 0);
            self.played_total += take as u64;
            self.stats.clip_frames += 1;
            AudioFrame::new(samples, self.config.sample_rate, self.config.channels)
        };

        self.fire_drains();
        frame
    }

    // Pulls while the next frame would empty `pending`, so a drain marker
    // queued right behind a clip is seen on the tick that plays its tail.
    fn fill(&mut self, frame_len: usize) {
        while self.pending.len() <= frame_len {
            match self.ready_rx.try_recv() {
                Ok(PlaybackItem::Clip {
                    sequence,
                    text,
                    clip,
                }) => self.enqueue_clip(sequence, &text, &clip),
                Ok(PlaybackItem::BlockDrained { block }) => {
                    self.drains.push_back((self.queued_total, block));
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn enqueue_clip(&mut self, sequence: u64, text: &str, clip: &SynthesizedClip) {
        let mut converter = SampleRateConverter::new(clip.sample_rate, self.config.sample_rate);
        let before = self.queued_total;
        for frame in &clip.frames {
            match frame {
                ClipFrame::Pcm(samples) => {
                    let mono = downmix_to_mono(samples, clip.channels);
                    let converted = converter.convert(&mono);
                    self.push_converted(&converted);
                }
                ClipFrame::Corrupt { reason } => {
                    self.stats.corrupt_frames_skipped += 1;
                    warn!(target: TARGET, sequence, %reason, "skipping corrupt clip frame");
                }
            }
        }
        let tail = converter.flush();
        self.push_converted(&tail);

        self.stats.clips_started += 1;
        debug!(
            target: TARGET,
            sequence,
            samples = self.queued_total - before,
            text_len = text.len(),
            "clip queued for playback"
        );
    }

    fn push_converted(&mut self, samples: &[f32]) {
        let channels = usize::from(self.config.channels.max(1));
        for &sample in samples {
            let value = f32_to_i16(sample);
            for _ in 0..channels {
                self.pending.push_back(value);
            }
        }
        self.queued_total += (samples.len() * channels) as u64;
    }

    fn fire_drains(&mut self) {
        while let Some(&(position, block)) = self.drains.front() {
            if self.played_total < position {
                break;
            }
            self.drains.pop_front();
            self.stats.blocks_drained += 1;
            if let Some(callback) = self.on_drain.as_ref() {
                callback(block);
            }
        }
    }
}

/// Fixed-cadence task feeding the room's outbound track.
pub struct AudioOutputLoop {
    mixer: OutputMixer,
    sink: Arc<dyn RoomConnection>,
    signal: Arc<SessionSignal>,
}

impl AudioOutputLoop {
    pub fn new(
        mixer: OutputMixer,
        sink: Arc<dyn RoomConnection>,
        signal: Arc<SessionSignal>,
    ) -> Self {
        Self {
            mixer,
            sink,
            signal,
        }
    }

    pub fn spawn(self) -> JoinHandle<MixerStats> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> MixerStats {
        let cadence = self.mixer.frame_duration().max(Duration::from_millis(1));
        let mut ticker = interval(cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.signal.cancelled() => break,
            }
            if !self.signal.is_active() {
                break;
            }

            let frame = self.mixer.next_frame();
            match self.sink.push_frame(frame) {
                Ok(()) => {}
                Err(RoomError::Closed) => {
                    warn!(target: TARGET, "outbound track closed, stopping output loop");
                    break;
                }
                Err(err) => warn!(target: TARGET, %err, "failed to publish output frame"),
            }
        }

        let stats = self.mixer.stats();
        info!(
            target: TARGET,
            frames = stats.frames_emitted,
            silence = stats.silence_frames,
            clips = stats.clips_started,
            corrupt = stats.corrupt_frames_skipped,
            "output loop stopped"
        );
        stats
    }
}
