use serde::Deserialize;

use crate::error::CoreError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SentenceSplitConfig {
    pub enable: bool,
    /// Below this duration, a long segment falls back to whole-segment
    /// ASR + identification instead of sentence splitting.
    pub min_duration_for_split: f64,
}

impl Default for SentenceSplitConfig {
    fn default() -> Self {
        Self {
            enable: true,
            min_duration_for_split: 3.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frame duration fed to the VAD model and processor loop, seconds.
    pub frame_duration_secs: f64,
    pub sentence_split: SentenceSplitConfig,
    /// ASR language hint (`audio.asr.language`).
    pub asr_language: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_duration_secs: 0.032,
            sentence_split: SentenceSplitConfig::default(),
            asr_language: "zh".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// How much audio history `AudioBuffer` retains before wall-clock
    /// cleanup discards frames, seconds (`buffer.long_buffer_duration`).
    pub max_duration_secs: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 300.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeakerConfig {
    /// Base cosine-distance threshold below which two embeddings are
    /// considered the same speaker (`speaker.threshold.base`).
    pub base_distance_threshold: f64,
    /// `speaker_merge_threshold = base_distance_threshold * merge_threshold_factor`.
    pub merge_threshold_factor: f64,
    /// Adaptive threshold decay: `new = decay * prev + (1 - decay) * observed`.
    pub adaptive_decay: f64,
    /// Adaptive threshold is clamped to `[base * min_factor, base * max_factor]`
    /// rather than letting it drift unbounded.
    pub adaptive_min_factor: f64,
    pub adaptive_max_factor: f64,
    /// K: number of embedding samples retained per speaker
    /// (`speaker.embedding.max_embeddings`).
    pub max_embeddings: usize,
    /// Minimum segment duration, seconds, for an embedding to be trusted
    /// enough to update an existing speaker's profile, create a new
    /// speaker, or be trusted as a sentence-split boundary
    /// (`speaker.embedding.min_chunk_duration`).
    pub min_chunk_duration: f64,
    /// Upper bound on the audio handed to the embedder, seconds
    /// (`speaker.embedding.max_chunk_duration`).
    pub max_chunk_duration: f64,
    /// Size of the MRU ring consulted before a full registry scan.
    pub recent_ids_capacity: usize,
    /// Size of the per-speaker rolling recent-distance ring used by
    /// `is_same_speaker`'s `avg_h`/`std_h` terms.
    pub recent_distances_capacity: usize,
    /// Rolling reference-audio window used for speaker-change detection
    /// during a long segment, seconds.
    pub ref_audio_max_duration_secs: f64,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            base_distance_threshold: 0.25,
            merge_threshold_factor: 1.25,
            adaptive_decay: 0.9,
            adaptive_min_factor: 0.5,
            adaptive_max_factor: 2.0,
            max_embeddings: 3,
            min_chunk_duration: 3.0,
            max_chunk_duration: 20.0,
            recent_ids_capacity: 5,
            recent_distances_capacity: 10,
            ref_audio_max_duration_secs: 10.0,
        }
    }
}

impl SpeakerConfig {
    pub fn merge_threshold(&self) -> f64 {
        self.base_distance_threshold * self.merge_threshold_factor
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadLevelSettings {
    pub activation_threshold: f32,
    pub min_silence_duration_secs: f64,
    pub min_silence_duration_short_secs: f64,
    pub adaptive_threshold_secs: f64,
    pub force_trigger_secs: f64,
}

impl Default for VadLevelSettings {
    fn default() -> Self {
        Self {
            activation_threshold: 0.3,
            min_silence_duration_secs: 0.3,
            min_silence_duration_short_secs: 0.3,
            adaptive_threshold_secs: 3.0,
            force_trigger_secs: 2.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadModelConfig {
    pub quick: VadLevelSettings,
    pub long: VadLevelSettings,
    pub exp_filter_alpha: f32,
    /// Enables short-VAD handling (`SHORT_PAUSE`/`SHORT_TIMEOUT`
    /// dispatch) at all.
    pub enable_quick: bool,
    /// Honours `SHORT_TIMEOUT` events (vs. treating them as a no-op).
    pub enable_quick_timeout: bool,
}

impl Default for VadModelConfig {
    fn default() -> Self {
        Self {
            quick: VadLevelSettings {
                activation_threshold: 0.3,
                min_silence_duration_secs: 0.3,
                min_silence_duration_short_secs: 0.3,
                adaptive_threshold_secs: 3.0,
                force_trigger_secs: 2.5,
            },
            long: VadLevelSettings {
                activation_threshold: 0.5,
                min_silence_duration_secs: 0.8,
                min_silence_duration_short_secs: 0.5,
                adaptive_threshold_secs: 3.0,
                force_trigger_secs: 20.0,
            },
            exp_filter_alpha: 0.8,
            enable_quick: false,
            enable_quick_timeout: false,
        }
    }
}

impl VadModelConfig {
    pub fn to_shared_vad_config(&self) -> shared_vad::VoiceDetectorConfig {
        shared_vad::VoiceDetectorConfig {
            quick: shared_vad::QuickLevelConfig {
                activation_threshold: self.quick.activation_threshold,
                min_silence_duration: self.quick.min_silence_duration_secs,
                force_trigger: self.quick.force_trigger_secs,
            },
            long: shared_vad::LongLevelConfig {
                activation_threshold: self.long.activation_threshold,
                min_silence_duration: self.long.min_silence_duration_secs,
                min_silence_duration_short: self.long.min_silence_duration_short_secs,
                adaptive_threshold: self.long.adaptive_threshold_secs,
                force_trigger: self.long.force_trigger_secs,
            },
            exp_filter_alpha: self.exp_filter_alpha,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadManagerConfig {
    /// Segments older than this relative to the newest are dropped on
    /// cleanup (`vad_manager.cleanup_interval` drives how often this
    /// runs at the transport layer; the manager itself cleans up on
    /// every insert).
    pub retention_secs: f64,
    pub cleanup_interval_secs: f64,
}

impl Default for VadManagerConfig {
    fn default() -> Self {
        Self {
            retention_secs: 120.0,
            cleanup_interval_secs: 60.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Bounded channel capacity; `put` blocks (backpressure) once full.
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub buffer: BufferConfig,
    pub speaker: SpeakerConfig,
    pub vad_model: VadModelConfig,
    pub vad_manager: VadManagerConfig,
    pub events: EventsConfig,
}

impl Config {
    /// Parses a TOML document into a `Config`. An absent file should be
    /// handled by the caller falling back to `Config::default()`; a
    /// present-but-malformed document is always a `ConfigInvalid` error.
    pub fn from_toml_str(raw: &str) -> Result<Self, CoreError> {
        toml::from_str(raw).map_err(|e| CoreError::ConfigInvalid(e.to_string()))
    }
}
