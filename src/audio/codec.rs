//! Decoding of synthesized examiner audio and WAV encoding of answers.

use std::io::Cursor;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use thiserror::Error;
use tracing::warn;

const TARGET: &str = "audio_codec";

/// Source frames are cut at this length so a damaged stretch costs at most
/// one frame.
const CLIP_FRAME_MS: u64 = 20;

/// Highest rate accepted from a clip header or raw layout.
const MAX_SAMPLE_RATE: u32 = 384_000;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported audio mime type `{0}`")]
    UnsupportedMime(String),
    #[error("unsupported wav sample format: {format:?} at {bits} bits")]
    UnsupportedFormat { format: SampleFormat, bits: u16 },
    #[error("audio payload is empty")]
    Empty,
    #[error("implausible sample rate {0} Hz")]
    SampleRate(u32),
    #[error(transparent)]
    Wav(#[from] hound::Error),
}

/// Layout of headerless PCM payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmLayout {
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClipFrame {
    Pcm(Vec<i16>),
    Corrupt { reason: String },
}

/// Decoded clip in its native rate and interleaved channel layout.
#[derive(Clone, Debug, PartialEq)]
pub struct SynthesizedClip {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: Vec<ClipFrame>,
}

impl SynthesizedClip {
    pub fn sample_count(&self) -> usize {
        self.frames
            .iter()
            .map(|frame| match frame {
                ClipFrame::Pcm(samples) => samples.len(),
                ClipFrame::Corrupt { .. } => 0,
            })
            .sum()
    }

    pub fn corrupt_frames(&self) -> usize {
        self.frames
            .iter()
            .filter(|frame| matches!(frame, ClipFrame::Corrupt { .. }))
            .count()
    }
}

enum Container {
    Wav,
    RawPcm,
}

fn classify(mime_type: &str, bytes: &[u8]) -> Option<Container> {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => Some(Container::Wav),
        "audio/pcm" | "audio/l16" | "audio/raw" => Some(Container::RawPcm),
        "" | "application/octet-stream" if bytes.starts_with(b"RIFF") => Some(Container::Wav),
        _ => None,
    }
}

/// Decodes one synthesis response into 20 ms source frames.
pub fn decode_clip(
    bytes: &[u8],
    mime_type: &str,
    raw_layout: PcmLayout,
) -> Result<SynthesizedClip, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    match classify(mime_type, bytes) {
        Some(Container::Wav) => decode_wav(bytes),
        Some(Container::RawPcm) => decode_raw(bytes, raw_layout),
        None => Err(DecodeError::UnsupportedMime(mime_type.to_string())),
    }
}

fn frame_len(sample_rate: u32, channels: u16) -> Result<usize, DecodeError> {
    if sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE {
        return Err(DecodeError::SampleRate(sample_rate));
    }
    let per_channel = u64::from(sample_rate) * CLIP_FRAME_MS / 1_000;
    let samples = per_channel * u64::from(channels.max(1));
    Ok(usize::try_from(samples).unwrap_or(usize::MAX).max(1))
}

fn decode_wav(bytes: &[u8]) -> Result<SynthesizedClip, DecodeError> {
    let mut reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let declared = reader.len() as usize;
    let chunk = frame_len(spec.sample_rate, spec.channels)?;

    let samples: Box<dyn Iterator<Item = Result<i16, hound::Error>> + '_> =
        match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, bits) if bits <= 16 => Box::new(
                reader
                    .samples::<i16>()
                    .map(move |sample| sample.map(|value| value << (16 - bits))),
            ),
            (SampleFormat::Int, bits) if bits <= 32 => Box::new(
                reader
                    .samples::<i32>()
                    .map(move |sample| sample.map(|value| (value >> (bits - 16)) as i16)),
            ),
            (SampleFormat::Float, 32) => Box::new(reader.samples::<f32>().map(|sample| {
                sample.map(|value| (value.clamp(-1.0, 1.0) * 32_767.0).round() as i16)
            })),
            (format, bits) => return Err(DecodeError::UnsupportedFormat { format, bits }),
        };

    // The header's length is untrusted; the payload bounds every allocation.
    let readable = declared.min(bytes.len());
    let mut frames = Vec::with_capacity(readable / chunk + 1);
    let mut current = Vec::with_capacity(chunk.min(readable));
    for sample in samples.take(declared) {
        match sample {
            Ok(value) => {
                current.push(value);
                if current.len() == chunk {
                    frames.push(ClipFrame::Pcm(std::mem::take(&mut current)));
                }
            }
            Err(err) => {
                current.clear();
                frames.push(ClipFrame::Corrupt {
                    reason: err.to_string(),
                });
                break;
            }
        }
    }
    if !current.is_empty() {
        frames.push(ClipFrame::Pcm(current));
    }

    let clip = SynthesizedClip {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        frames,
    };
    if clip.corrupt_frames() > 0 {
        warn!(
            target: TARGET,
            corrupt = clip.corrupt_frames(),
            total = clip.frames.len(),
            "wav payload has unreadable frames"
        );
    }
    Ok(clip)
}

fn decode_raw(bytes: &[u8], layout: PcmLayout) -> Result<SynthesizedClip, DecodeError> {
    let chunk_bytes = frame_len(layout.sample_rate, layout.channels)?.saturating_mul(2);
    let channels = usize::from(layout.channels.max(1));
    let frames = bytes
        .chunks(chunk_bytes)
        .map(|chunk| {
            if chunk.len() % (2 * channels) != 0 {
                return ClipFrame::Corrupt {
                    reason: format!("truncated pcm frame of {} bytes", chunk.len()),
                };
            }
            ClipFrame::Pcm(
                chunk
                    .chunks_exact(2)
                    .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                    .collect(),
            )
        })
        .collect();

    Ok(SynthesizedClip {
        sample_rate: layout.sample_rate,
        channels: layout.channels.max(1),
        frames,
    })
}

/// Encodes mono 16-bit PCM as a WAV file.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, hound::Error> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
