//! Sample-rate conversion and channel remixing helpers.

/// Streaming linear-interpolation converter.
///
/// Keeps the fractional read cursor and the unread tail between blocks so
/// consecutive frames of one turn are converted without seams.
#[derive(Debug)]
pub(crate) struct SampleRateConverter {
    from_rate: u32,
    to_rate: u32,
    step: f64,
    cursor: f64,
    buffer: Vec<f32>,
}

impl SampleRateConverter {
    pub(crate) fn new(from_rate: u32, to_rate: u32) -> Self {
        let step = if to_rate == 0 {
            1.0
        } else {
            from_rate as f64 / to_rate as f64
        };
        Self {
            from_rate,
            to_rate,
            step,
            cursor: 0.0,
            buffer: Vec::new(),
        }
    }

    pub(crate) fn from_rate(&self) -> u32 {
        self.from_rate
    }

    fn is_passthrough(&self) -> bool {
        self.from_rate == 0 || self.to_rate == 0 || self.from_rate == self.to_rate
    }

    pub(crate) fn convert(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        self.buffer.extend_from_slice(input);
        if self.buffer.len() < 2 {
            return Vec::new();
        }

        let mut output = Vec::with_capacity(
            (input.len() as f64 / self.step).ceil() as usize + 1,
        );
        let mut cursor = self.cursor;
        while cursor + 1.0 < self.buffer.len() as f64 {
            output.push(self.interpolate(cursor));
            cursor += self.step;
        }

        let consumed = (cursor.floor() as usize).saturating_sub(1);
        if consumed > 0 && consumed <= self.buffer.len() {
            self.buffer.drain(0..consumed);
            cursor -= consumed as f64;
        }

        self.cursor = cursor;
        output
    }

    /// Drains the held tail, repeating the last sample so it interpolates.
    pub(crate) fn flush(&mut self) -> Vec<f32> {
        if self.is_passthrough() {
            self.cursor = 0.0;
            return std::mem::take(&mut self.buffer);
        }

        let Some(&last) = self.buffer.last() else {
            self.cursor = 0.0;
            return Vec::new();
        };
        self.buffer.push(last);

        let mut output = Vec::new();
        let mut cursor = self.cursor;
        while cursor + 1.0 < self.buffer.len() as f64 {
            output.push(self.interpolate(cursor));
            cursor += self.step;
        }

        self.reset();
        output
    }

    pub(crate) fn reset(&mut self) {
        self.buffer.clear();
        self.cursor = 0.0;
    }

    fn interpolate(&self, cursor: f64) -> f32 {
        let base = cursor.floor() as usize;
        let frac = (cursor - base as f64) as f32;
        let current = self.buffer[base];
        let next = self.buffer[base + 1];
        current + (next - current) * frac
    }
}

/// Averages interleaved channels into one normalised mono track.
pub(crate) fn downmix_to_mono(interleaved: &[i16], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    interleaved
        .chunks(channels)
        .map(|chunk| {
            let sum: f32 = chunk.iter().map(|&sample| i16_to_f32(sample)).sum();
            sum / chunk.len() as f32
        })
        .collect()
}

pub(crate) fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32_768.0
}

pub(crate) fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32_767.0).round() as i16
}

pub(crate) fn frame_rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }

    let energy: f32 = frame.iter().map(|sample| sample * sample).sum();
    (energy / frame.len() as f32).sqrt()
}

/// RMS expressed in dBFS, floored so silence stays finite.
pub(crate) fn rms_to_dbfs(rms: f32) -> f32 {
    const FLOOR_DB: f32 = -100.0;
    if rms <= 0.0 {
        return FLOOR_DB;
    }
    (20.0 * rms.log10()).max(FLOOR_DB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_when_rates_match() {
        let mut converter = SampleRateConverter::new(16_000, 16_000);
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(converter.convert(&input), input);
        assert!(converter.flush().is_empty());
    }

    #[test]
    fn downsampling_preserves_duration_across_blocks() {
        let mut converter = SampleRateConverter::new(48_000, 16_000);
        let block = vec![0.5_f32; 480];
        let mut produced = 0;
        for _ in 0..10 {
            produced += converter.convert(&block).len();
        }
        produced += converter.flush().len();
        // 100 ms at 16 kHz, give or take the interpolation edge.
        assert!((1_598..=1_602).contains(&produced), "produced {produced}");
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = [16_384_i16, -16_384, 8_192, 8_192];
        let mono = downmix_to_mono(&stereo, 2);
        assert_eq!(mono.len(), 2);
        assert!(mono[0].abs() < 1e-6);
        assert!((mono[1] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn dbfs_is_floored_for_silence() {
        assert_eq!(rms_to_dbfs(0.0), -100.0);
        assert!((rms_to_dbfs(1.0)).abs() < 1e-6);
    }
}
