//! Two-level voice-activity detection: a black-box speech-probability
//! model wrapped by an exponential smoothing filter and a quick/long
//! dual-threshold state machine.

use std::sync::Mutex;

/// Black-box VAD probability model: `prob(frame) -> [0,1]`. Implementors
/// receive float32 samples in `[-1, 1]` at 16 kHz. `&self` rather than
/// `&mut self` so a `VadModel` can be shared across long/short detectors
/// without cloning; implementations with internal state use interior
/// mutability.
pub trait VadModel: Send + Sync {
    fn predict(&self, frame: &[f32]) -> f32;
}

const EARSHOT_FRAME: usize = 256; // 16ms at 16kHz, earshot's native window

/// `VadModel` backed by the `earshot` WebRTC-derived detector. Frames of
/// arbitrary length are chopped into earshot's fixed 16ms windows; the
/// returned probability is the mean across those windows, with a final
/// short window zero-padded.
pub struct EarshotVad {
    detector: Mutex<earshot::Detector>,
}

impl Default for EarshotVad {
    fn default() -> Self {
        Self::new()
    }
}

impl EarshotVad {
    pub fn new() -> Self {
        Self {
            detector: Mutex::new(earshot::Detector::default()),
        }
    }
}

impl VadModel for EarshotVad {
    fn predict(&self, frame: &[f32]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let samples_i16: Vec<i16> = frame
            .iter()
            .map(|&s| (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            .collect();

        let mut detector = self.detector.lock().expect("earshot detector lock poisoned");
        let mut sum = 0.0f32;
        let mut n = 0usize;
        let mut pos = 0;
        while pos < samples_i16.len() {
            let end = (pos + EARSHOT_FRAME).min(samples_i16.len());
            let chunk = &samples_i16[pos..end];
            let p = if chunk.len() == EARSHOT_FRAME {
                detector.predict_i16(chunk)
            } else {
                let mut padded = chunk.to_vec();
                padded.resize(EARSHOT_FRAME, 0);
                detector.predict_i16(&padded)
            };
            sum += p;
            n += 1;
            pos += EARSHOT_FRAME;
        }
        if n == 0 { 0.0 } else { sum / n as f32 }
    }
}

/// Tagged VAD state-machine event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart,
    ShortPause,
    LongPause,
    ShortTimeout,
    LongTimeout,
}

/// One VAD level's thresholds.
#[derive(Debug, Clone)]
pub struct QuickLevelConfig {
    pub activation_threshold: f32,
    pub min_silence_duration: f64,
    pub force_trigger: f64,
}

impl Default for QuickLevelConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 0.3,
            min_silence_duration: 0.3,
            force_trigger: 2.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LongLevelConfig {
    pub activation_threshold: f32,
    pub min_silence_duration: f64,
    pub min_silence_duration_short: f64,
    pub adaptive_threshold: f64,
    pub force_trigger: f64,
}

impl Default for LongLevelConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 0.5,
            min_silence_duration: 0.8,
            min_silence_duration_short: 0.5,
            adaptive_threshold: 3.0,
            force_trigger: 20.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VoiceDetectorConfig {
    pub quick: QuickLevelConfig,
    pub long: LongLevelConfig,
    pub exp_filter_alpha: f32,
}

impl Default for VoiceDetectorConfig {
    fn default() -> Self {
        Self {
            quick: QuickLevelConfig::default(),
            long: LongLevelConfig::default(),
            exp_filter_alpha: 0.8,
        }
    }
}

struct ExpFilter {
    alpha: f32,
    last: Option<f32>,
}

impl ExpFilter {
    fn new(alpha: f32) -> Self {
        Self { alpha, last: None }
    }

    fn apply(&mut self, value: f32) -> f32 {
        let smoothed = match self.last {
            None => value,
            Some(prev) => self.alpha * value + (1.0 - self.alpha) * prev,
        };
        self.last = Some(smoothed);
        smoothed
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

/// The two-level VAD state machine: a quick level that fires short pauses
/// and a long level that fires long pauses, both fed by the same
/// exponentially-smoothed probability stream. Holds no reference to the
/// audio buffer; callers feed it one frame at a time and react to the
/// returned event.
pub struct VoiceDetector {
    cfg: VoiceDetectorConfig,
    filter: ExpFilter,
    is_speaking: bool,
    quick_speech_duration: f64,
    long_speech_duration: f64,
    silence_duration: f64,
    can_trigger_short_pause: bool,
}

impl VoiceDetector {
    pub fn new(cfg: VoiceDetectorConfig) -> Self {
        let alpha = cfg.exp_filter_alpha;
        Self {
            cfg,
            filter: ExpFilter::new(alpha),
            is_speaking: false,
            quick_speech_duration: 0.0,
            long_speech_duration: 0.0,
            silence_duration: 0.0,
            can_trigger_short_pause: true,
        }
    }

    pub fn reset(&mut self) {
        self.filter.reset();
        self.is_speaking = false;
        self.quick_speech_duration = 0.0;
        self.long_speech_duration = 0.0;
        self.silence_duration = 0.0;
        self.can_trigger_short_pause = true;
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    /// Feeds one frame's raw (unsmoothed) probability through the state
    /// machine. `duration` is the frame's duration in seconds.
    pub fn update(&mut self, raw_prob: f32, duration: f64) -> Option<VadEvent> {
        let smoothed = self.filter.apply(raw_prob);
        let voiced = smoothed >= self.cfg.quick.activation_threshold;

        if voiced {
            self.silence_duration = 0.0;
            if !self.is_speaking {
                self.is_speaking = true;
                self.quick_speech_duration = 0.0;
                self.long_speech_duration = 0.0;
                self.can_trigger_short_pause = true;
                return Some(VadEvent::SpeechStart);
            }

            self.quick_speech_duration += duration;
            self.long_speech_duration += duration;
            self.can_trigger_short_pause = true;

            if self.long_speech_duration >= self.cfg.long.force_trigger {
                self.long_speech_duration = 0.0;
                return Some(VadEvent::LongTimeout);
            }
            if self.quick_speech_duration >= self.cfg.quick.force_trigger {
                self.quick_speech_duration = 0.0;
                return Some(VadEvent::ShortTimeout);
            }
            None
        } else {
            if !self.is_speaking {
                return None;
            }
            self.silence_duration += duration;

            let effective_long_silence = if self.long_speech_duration >= self.cfg.long.adaptive_threshold
            {
                self.cfg.long.min_silence_duration_short
            } else {
                self.cfg.long.min_silence_duration
            };

            if self.silence_duration >= effective_long_silence {
                self.is_speaking = false;
                self.can_trigger_short_pause = true;
                Some(VadEvent::LongPause)
            } else if self.silence_duration >= self.cfg.quick.min_silence_duration
                && self.can_trigger_short_pause
            {
                self.can_trigger_short_pause = false;
                Some(VadEvent::ShortPause)
            } else {
                None
            }
        }
    }

    /// Runs `model.predict(frame)` and feeds the result through
    /// [`VoiceDetector::update`]. Callers running on an async runtime
    /// should invoke this inside `spawn_blocking`, since `VadModel`
    /// implementations do CPU-bound inference.
    pub fn process_frame(&mut self, model: &dyn VadModel, frame: &[f32], duration: f64) -> Option<VadEvent> {
        let prob = model.predict(frame);
        self.update(prob, duration)
    }
}

/// A scripted `VadModel` used by tests to drive the state machine with a
/// fixed probability sequence.
pub struct ScriptedVad {
    probs: Mutex<std::collections::VecDeque<f32>>,
}

impl ScriptedVad {
    pub fn new(probs: impl IntoIterator<Item = f32>) -> Self {
        Self {
            probs: Mutex::new(probs.into_iter().collect()),
        }
    }
}

impl VadModel for ScriptedVad {
    fn predict(&self, _frame: &[f32]) -> f32 {
        self.probs.lock().expect("scripted vad lock poisoned").pop_front().unwrap_or(0.0)
    }
}
