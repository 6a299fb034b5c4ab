use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::orchestrator::config::IngestConfig;
use crate::telemetry::events::record_audio_level;

use super::resample::{
    downmix_to_mono, f32_to_i16, frame_rms, rms_to_dbfs, SampleRateConverter,
};
use super::{AudioFrame, CANONICAL_SAMPLE_RATE};

const TARGET: &str = "audio_ingest";

/// One closed candidate turn, canonical 16 kHz mono.
#[derive(Clone, Debug, PartialEq)]
pub struct Answer {
    pub sequence: u64,
    pub sample_rate: u32,
    pub samples: Arc<[i16]>,
}

impl Answer {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }

    /// Raw little-endian PCM, the layout handed to the conversational AI.
    pub fn pcm_le_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.samples.len() * 2);
        for &sample in self.samples.iter() {
            buf.put_i16_le(sample);
        }
        buf.freeze()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Buffered { appended: usize },
    Discarded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnSubmission {
    Submitted { sequence: u64, samples: usize },
    NotAccepting,
    Undeliverable,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LevelReading {
    pub frame_index: u64,
    pub rms: f32,
    pub dbfs: f32,
    pub listening: bool,
}

/// Whether the owning session currently records and whether it will take a
/// turn-end signal.
///
/// Preparation accepts a turn end (to finish early) without recording.
#[derive(Debug, Default)]
pub struct TurnGate {
    listening: AtomicBool,
    accepting: AtomicBool,
}

impl TurnGate {
    pub fn open(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
        self.accepting.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.listening.store(false, Ordering::SeqCst);
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn take_turn(&self) -> bool {
        if self.accepting.swap(false, Ordering::SeqCst) {
            self.listening.store(false, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct IngestState {
    buffer: Vec<i16>,
    converter: Option<SampleRateConverter>,
    next_sequence: u64,
    frames_seen: u64,
    level_energy: f64,
    level_samples: usize,
}

impl IngestState {
    fn append(&mut self, sample_rate: u32, mono: &[f32]) -> usize {
        let reuse = self
            .converter
            .as_ref()
            .map(|converter| converter.from_rate() == sample_rate)
            .unwrap_or(false);
        if !reuse {
            if let Some(mut previous) = self.converter.take() {
                let tail = previous.flush();
                self.extend(&tail);
            }
            self.converter = Some(SampleRateConverter::new(sample_rate, CANONICAL_SAMPLE_RATE));
        }

        let converted = match self.converter.as_mut() {
            Some(converter) => converter.convert(mono),
            None => return 0,
        };
        self.extend(&converted);
        converted.len()
    }

    fn extend(&mut self, samples: &[f32]) {
        self.buffer
            .extend(samples.iter().map(|&sample| f32_to_i16(sample)));
    }

    fn take_answer(&mut self) -> Answer {
        if let Some(converter) = self.converter.as_mut() {
            let tail = converter.flush();
            self.extend(&tail);
        }
        let samples: Arc<[i16]> = std::mem::take(&mut self.buffer).into();
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Answer {
            sequence,
            sample_rate: CANONICAL_SAMPLE_RATE,
            samples,
        }
    }
}

/// Per-session turn buffer fed by the room's inbound audio callback.
pub struct AudioFrameIngest {
    config: IngestConfig,
    gate: TurnGate,
    state: Mutex<IngestState>,
    level_tx: broadcast::Sender<LevelReading>,
}

impl AudioFrameIngest {
    pub fn new(config: IngestConfig) -> Self {
        let (level_tx, _) = broadcast::channel(config.level_channel_capacity.max(1));
        Self {
            config,
            gate: TurnGate::default(),
            state: Mutex::new(IngestState {
                buffer: Vec::new(),
                converter: None,
                next_sequence: 0,
                frames_seen: 0,
                level_energy: 0.0,
                level_samples: 0,
            }),
            level_tx,
        }
    }

    pub fn gate(&self) -> &TurnGate {
        &self.gate
    }

    pub fn subscribe_levels(&self) -> broadcast::Receiver<LevelReading> {
        self.level_tx.subscribe()
    }

    pub fn push_frame(&self, frame: &AudioFrame) -> IngestOutcome {
        if frame.sample_rate == 0 || frame.samples.is_empty() {
            warn!(target: TARGET, sample_rate = frame.sample_rate, "dropping malformed frame");
            return IngestOutcome::Discarded;
        }

        let mono = downmix_to_mono(&frame.samples, frame.channels);
        let mut state = self.lock();
        state.frames_seen += 1;
        self.track_level(&mut state, &mono);

        if !self.gate.is_listening() {
            if let Some(converter) = state.converter.as_mut() {
                converter.reset();
            }
            return IngestOutcome::Discarded;
        }

        let appended = state.append(frame.sample_rate, &mono);
        IngestOutcome::Buffered { appended }
    }

    /// Closes the live buffer into an [`Answer`]. Always yields one, empty
    /// when nothing was captured since the previous flush.
    pub fn flush(&self) -> Answer {
        let mut state = self.lock();
        let answer = state.take_answer();
        debug!(
            target: TARGET,
            sequence = answer.sequence,
            samples = answer.samples.len(),
            "flushed turn buffer"
        );
        answer
    }

    /// Takes the current turn and delivers it to `answers`, only while the
    /// gate accepts a turn end. Delivery happens under the buffer lock so a
    /// concurrent [`close_turn`](Self::close_turn) never races a late answer
    /// into the channel.
    pub fn submit_turn(&self, answers: &mpsc::Sender<Answer>) -> TurnSubmission {
        let mut state = self.lock();
        if !self.gate.take_turn() {
            return TurnSubmission::NotAccepting;
        }
        let answer = state.take_answer();
        let sequence = answer.sequence;
        let samples = answer.samples.len();
        match answers.try_send(answer) {
            Ok(()) => {
                debug!(target: TARGET, sequence, samples, "turn submitted");
                TurnSubmission::Submitted { sequence, samples }
            }
            Err(err) => {
                warn!(target: TARGET, sequence, %err, "turn answer undeliverable");
                TurnSubmission::Undeliverable
            }
        }
    }

    /// Closes the gate and flushes regardless of whether it was accepting.
    pub fn close_turn(&self) -> Answer {
        let mut state = self.lock();
        self.gate.close();
        state.take_answer()
    }

    /// Drops buffered audio without producing an answer.
    pub fn clear(&self) {
        let mut state = self.lock();
        let dropped = state.buffer.len();
        state.buffer.clear();
        if let Some(converter) = state.converter.as_mut() {
            converter.reset();
        }
        if dropped > 0 {
            debug!(target: TARGET, dropped, "cleared stale turn audio");
        }
    }

    pub fn buffered_samples(&self) -> usize {
        self.lock().buffer.len()
    }

    fn track_level(&self, state: &mut IngestState, mono: &[f32]) {
        let rms = frame_rms(mono) as f64;
        state.level_energy += rms * rms * mono.len() as f64;
        state.level_samples += mono.len();

        let interval = u64::from(self.config.level_interval_frames.max(1));
        if state.frames_seen % interval != 0 {
            return;
        }

        let window_rms = if state.level_samples == 0 {
            0.0
        } else {
            (state.level_energy / state.level_samples as f64).sqrt() as f32
        };
        state.level_energy = 0.0;
        state.level_samples = 0;

        let reading = LevelReading {
            frame_index: state.frames_seen,
            rms: window_rms,
            dbfs: rms_to_dbfs(window_rms),
            listening: self.gate.is_listening(),
        };
        record_audio_level(reading.frame_index, reading.dbfs, reading.listening);
        // Nobody listening is fine; telemetry never blocks ingest.
        let _ = self.level_tx.send(reading);
    }

    fn lock(&self) -> MutexGuard<'_, IngestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
