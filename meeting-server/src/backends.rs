//! Whisper and ONNX-backed implementations of `meeting-core`'s
//! black-box `Asr` and `Embedder` traits.

use std::sync::Mutex;

use meeting_core::asr::{Asr, AsrOutput};
use meeting_core::embedding::Embedder;
use meeting_core::error::CoreError;
use ort::session::Session;
use ort::value::Tensor;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperState};

/// Sampling and decode-retry knobs carried over from the CLI, applied to
/// every `recognize()` call.
#[derive(Clone, Debug)]
pub struct WhisperOpts {
    pub dynamic_audio_ctx: bool,
    pub temperature_inc: Option<f32>,
    pub entropy_thold: Option<f32>,
}

/// `Asr` backed by a `whisper-rs` context. One `WhisperState` is reused
/// across calls (state re-creation is the expensive part); `full()` is
/// always called with `no_context`, so reuse is safe across unrelated
/// audio slices handed in by the processor.
pub struct WhisperAsr {
    ctx: WhisperContext,
    state: Mutex<WhisperState>,
    sampling_strategy: SamplingStrategy,
    opts: WhisperOpts,
}

impl WhisperAsr {
    pub fn new(ctx: WhisperContext, sampling_strategy: SamplingStrategy, opts: WhisperOpts) -> Result<Self, CoreError> {
        let state = ctx
            .create_state()
            .map_err(|e| CoreError::ModelLoad(e.to_string()))?;
        Ok(Self {
            ctx,
            state: Mutex::new(state),
            sampling_strategy,
            opts,
        })
    }
}

impl Asr for WhisperAsr {
    fn recognize(&self, audio: &[i16], language: &str) -> Result<AsrOutput, CoreError> {
        let audio_f32: Vec<f32> = audio.iter().map(|&s| s as f32 / 32768.0).collect();

        let mut params = FullParams::new(self.sampling_strategy.clone());
        let lang = language.trim();
        let lang = if lang.is_empty() || lang == "auto" { None } else { Some(lang) };
        params.set_language(lang);
        params.set_suppress_nst(true);
        params.set_print_progress(false);
        params.set_print_special(false);
        params.set_print_realtime(false);
        params.set_single_segment(false);
        params.set_token_timestamps(true);
        params.set_no_context(true);

        if let Some(v) = self.opts.temperature_inc {
            params.set_temperature_inc(v);
        }
        if let Some(v) = self.opts.entropy_thold {
            params.set_entropy_thold(v);
        }
        if self.opts.dynamic_audio_ctx {
            let needed = (audio_f32.len() as i32 * 1500) / (16_000 * 30);
            let aligned = ((needed + 63) / 64) * 64;
            params.set_audio_ctx(aligned.max(384));
        }

        let mut state = self.state.lock().expect("whisper state lock poisoned");
        state.full(params, &audio_f32).map_err(|e| CoreError::ModelInference(e.to_string()))?;

        let n_segments = state.full_n_segments();
        let eot_id = self.ctx.token_eot();

        let mut text = String::new();
        let mut token_timestamps = Vec::new();

        for i in 0..n_segments {
            let Some(segment) = state.get_segment(i) else {
                continue;
            };
            let n_tokens = segment.n_tokens();
            for j in 0..n_tokens {
                let Some(token) = segment.get_token(j) else {
                    continue;
                };
                if token.token_id() >= eot_id {
                    continue;
                }
                let token_text = token
                    .to_str_lossy()
                    .map_err(|e| CoreError::ModelInference(e.to_string()))?
                    .to_string();
                let token_data = token.token_data();
                // whisper reports timestamps in centiseconds
                token_timestamps.push([token_data.t0 * 10, token_data.t1 * 10]);
                if !text.is_empty() && !text.ends_with(' ') && !token_text.starts_with(' ') {
                    text.push(' ');
                }
                text.push_str(token_text.trim());
            }
        }

        Ok(AsrOutput {
            text: text.trim().to_string(),
            token_timestamps,
        })
    }
}

/// `Embedder` backed by an ONNX speaker-embedding model. The session is
/// held behind a `Mutex` since `ort::session::Session::run` takes `&mut
/// self`; callers already invoke `embed` from `spawn_blocking`.
pub struct OrtEmbedder {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

impl OrtEmbedder {
    pub fn new(session: Session, input_name: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            session: Mutex::new(session),
            input_name: input_name.into(),
            output_name: output_name.into(),
        }
    }
}

impl Embedder for OrtEmbedder {
    fn embed(&self, audio_f32: &[f32]) -> Result<Vec<f32>, CoreError> {
        let array = ndarray::Array2::from_shape_vec((1, audio_f32.len()), audio_f32.to_vec())
            .map_err(|e| CoreError::ModelInference(e.to_string()))?;
        let tensor = Tensor::from_array(array).map_err(|e| CoreError::ModelInference(e.to_string()))?;

        let mut session = self.session.lock().expect("onnx session lock poisoned");
        let outputs = session
            .run(ort::inputs! { self.input_name.as_str() => tensor })
            .map_err(|e| CoreError::ModelInference(e.to_string()))?;

        let embedding = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| CoreError::ModelInference(format!("missing onnx output '{}'", self.output_name)))?
            .try_extract_array::<f32>()
            .map_err(|e| CoreError::ModelInference(e.to_string()))?;
        Ok(embedding.iter().copied().collect())
    }
}
