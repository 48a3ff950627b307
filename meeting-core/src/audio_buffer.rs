use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// One chunk of PCM audio as it arrived from the transport, timestamped
/// in wall-clock seconds (client-supplied, trusted as-is).
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub start: f64,
    pub end: f64,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(start: f64, end: f64, samples: Vec<i16>) -> Self {
        Self { start, end, samples }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Append-only, time-indexed ring of recent audio. Frames are appended
/// in arrival order and read back by stream-relative time range; old
/// frames are evicted by comparing their own `end` timestamp against
/// the current wall clock, not by arrival order, matching the
/// reference implementation's `time.time() - max_duration` cutoff.
pub struct AudioBuffer {
    frames: VecDeque<AudioFrame>,
    max_duration: std::time::Duration,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(max_duration_secs: f64, sample_rate: u32) -> Self {
        Self {
            frames: VecDeque::new(),
            max_duration: std::time::Duration::from_secs_f64(max_duration_secs.max(0.0)),
            sample_rate,
        }
    }

    pub fn write(&mut self, frame: AudioFrame) {
        self.frames.push_back(frame);
        self.cleanup();
    }

    /// Drops frames whose `end` timestamp is older than `max_duration`
    /// relative to the current wall clock, then, as a backstop against an
    /// unbounded queue of tiny frames, drops the oldest until the frame
    /// count is within `100 * max_duration` seconds worth of frames. Runs
    /// automatically on every `write`; exposed publicly so a periodic GC
    /// task can also reclaim frames during a silent stretch with no
    /// incoming audio.
    pub fn cleanup(&mut self) {
        let cutoff = wall_clock_now_secs() - self.max_duration.as_secs_f64();
        while let Some(front) = self.frames.front() {
            if front.end < cutoff {
                self.frames.pop_front();
            } else {
                break;
            }
        }
        let cap = (100.0 * self.max_duration.as_secs_f64()).round() as usize;
        while self.frames.len() > cap.max(1) {
            self.frames.pop_front();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn latest_end(&self) -> Option<f64> {
        self.frames.back().map(|f| f.end)
    }

    /// Returns i16 PCM samples covering `[start, end]`, stitching across
    /// frame boundaries, plus the actual `[start, end]` span covered (the
    /// min/max of the overlaps actually found). Returns `(empty, 0.0,
    /// 0.0)` if nothing overlaps. Per-frame clipping indices are computed
    /// by linear interpolation over the frame's sample count with integer
    /// truncation, matching the reference implementation.
    pub fn read(&self, start: f64, end: f64) -> (Vec<i16>, f64, f64) {
        if end <= start {
            return (Vec::new(), 0.0, 0.0);
        }
        let mut out = Vec::new();
        let mut actual_start: Option<f64> = None;
        let mut actual_end: Option<f64> = None;
        for frame in &self.frames {
            if frame.end <= start || frame.start >= end {
                continue;
            }
            let overlap_start = start.max(frame.start);
            let overlap_end = end.min(frame.end);
            let n_samples = frame.samples.len();
            if n_samples == 0 || frame.duration() <= 0.0 {
                continue;
            }
            let start_idx =
                (((overlap_start - frame.start) / frame.duration()) * n_samples as f64) as usize;
            let end_idx =
                (((overlap_end - frame.start) / frame.duration()) * n_samples as f64) as usize;
            let start_idx = start_idx.min(n_samples);
            let end_idx = end_idx.min(n_samples);
            if start_idx < end_idx {
                out.extend_from_slice(&frame.samples[start_idx..end_idx]);
                actual_start = Some(actual_start.map_or(overlap_start, |s: f64| s.min(overlap_start)));
                actual_end = Some(actual_end.map_or(overlap_end, |e: f64| e.max(overlap_end)));
            }
        }
        match (actual_start, actual_end) {
            (Some(s), Some(e)) => (out, s, e),
            _ => (Vec::new(), 0.0, 0.0),
        }
    }

    /// Reads the most recent `duration` seconds ending at the newest
    /// frame's end timestamp.
    pub fn read_latest(&self, duration: f64) -> (Vec<i16>, f64, f64) {
        match self.latest_end() {
            Some(end) => self.read((end - duration).max(0.0), end),
            None => (Vec::new(), 0.0, 0.0),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Seconds since the Unix epoch, the wall-clock basis `cleanup` compares
/// frame `end` timestamps against.
pub fn wall_clock_now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Converts little-endian i16 PCM bytes to samples.
pub fn bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Converts i16 PCM samples to float32 in `[-1, 1]`, the format the VAD
/// model, ASR, and embedder black boxes all expect.
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Inverse of [`i16_to_f32`]: multiplies by 32768 and rounds, clamping to
/// the i16 range.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_stitches_across_frame_boundaries() {
        let t0 = wall_clock_now_secs();
        let mut buf = AudioBuffer::new(60.0, 16);
        buf.write(AudioFrame::new(t0, t0 + 1.0, vec![0; 16]));
        buf.write(AudioFrame::new(t0 + 1.0, t0 + 2.0, vec![1; 16]));
        let (out, actual_start, actual_end) = buf.read(t0 + 0.5, t0 + 1.5);
        assert_eq!(out.len(), 16);
        assert!(out[..8].iter().all(|&s| s == 0));
        assert!(out[8..].iter().all(|&s| s == 1));
        assert_eq!(actual_start, t0 + 0.5);
        assert_eq!(actual_end, t0 + 1.5);
    }

    #[test]
    fn read_outside_range_is_empty() {
        let t0 = wall_clock_now_secs();
        let mut buf = AudioBuffer::new(60.0, 16);
        buf.write(AudioFrame::new(t0, t0 + 1.0, vec![0; 16]));
        let (out, start, end) = buf.read(t0 + 5.0, t0 + 6.0);
        assert!(out.is_empty());
        assert_eq!((start, end), (0.0, 0.0));
    }

    #[test]
    fn read_latest_anchors_to_newest_frame_end() {
        let t0 = wall_clock_now_secs();
        let mut buf = AudioBuffer::new(60.0, 16);
        buf.write(AudioFrame::new(t0, t0 + 1.0, vec![0; 16]));
        buf.write(AudioFrame::new(t0 + 1.0, t0 + 2.0, vec![1; 16]));
        let (out, ..) = buf.read_latest(1.0);
        assert!(out.iter().all(|&s| s == 1));
    }

    #[test]
    fn cleanup_evicts_frames_past_max_duration() {
        let t0 = wall_clock_now_secs();
        let mut buf = AudioBuffer::new(60.0, 16);
        buf.write(AudioFrame::new(t0 - 120.0, t0 - 119.0, vec![0; 16]));
        buf.write(AudioFrame::new(t0, t0 + 1.0, vec![1; 16]));
        assert_eq!(buf.frames.len(), 1);
        assert_eq!(buf.latest_end(), Some(t0 + 1.0));
    }

    #[test]
    fn i16_f32_roundtrip_is_close() {
        let samples: Vec<i16> = vec![0, 16384, -16384, 32767, -32768];
        let floats = i16_to_f32(&samples);
        let back = f32_to_i16(&floats);
        for (s, b) in samples.iter().zip(back.iter()) {
            assert!((*s as i32 - *b as i32).abs() <= 1);
        }
    }

    #[test]
    fn empty_buffer_read_is_empty() {
        let buf = AudioBuffer::new(60.0, 16);
        let (out, start, end) = buf.read(0.0, 1.0);
        assert!(out.is_empty());
        assert_eq!((start, end), (0.0, 0.0));
    }
}
