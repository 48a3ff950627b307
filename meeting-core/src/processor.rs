//! Orchestrates VAD segmentation, ASR, and speaker diarization into
//! timestamped transcription events.

use std::sync::Arc;

use shared_protocol::{ServerMessage, TranscriptionEvent};
use shared_vad::{VadEvent, VoiceDetector};
use tokio::sync::Mutex as AsyncMutex;

use crate::asr::{Asr, AsrOutput};
use crate::audio_buffer::{i16_to_f32, AudioBuffer, AudioFrame};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::CoreError;
use crate::events::EventProducer;
use crate::speaker::{coerce_invalid, cosine_distance, SpeakerRegistry, SpeakerStorage, INVALID_DISTANCE, UNKNOWN_SPEAKER};
use crate::text::{split_sentences_with_timestamps, Sentence};
use crate::vad_manager::{SegmentKind, VadManager, VadSegment};

/// State for the in-progress long segment (Idle/Active).
struct LongSegmentState {
    active: bool,
    start: f64,
}

impl LongSegmentState {
    fn new() -> Self {
        Self { active: false, start: 0.0 }
    }
}

/// Tracks the anchor used for short-VAD handling (`last_short_vad_end`).
struct ShortSegmentState {
    last_short_vad_end: Option<f64>,
}

impl ShortSegmentState {
    fn new() -> Self {
        Self { last_short_vad_end: None }
    }
}

fn speaker_id_label(id: u32) -> String {
    if id == UNKNOWN_SPEAKER {
        String::new()
    } else {
        id.to_string()
    }
}

/// One merged group of sentences assigned a single speaker.
struct MergedSegment {
    start_ms: i64,
    end_ms: i64,
    text: String,
    timestamp: Vec<[i64; 2]>,
}

pub struct AudioProcessor {
    audio_buffer: AsyncMutex<AudioBuffer>,
    vad_manager: AsyncMutex<VadManager>,
    speaker_registry: AsyncMutex<SpeakerRegistry>,
    voice_detector: AsyncMutex<VoiceDetector>,
    long_state: AsyncMutex<LongSegmentState>,
    short_state: AsyncMutex<ShortSegmentState>,
    vad_model: Arc<dyn shared_vad::VadModel>,
    asr: Arc<dyn Asr>,
    embedder: Arc<dyn Embedder>,
    events: EventProducer,
    storage: SpeakerStorage,
    meeting_id: AsyncMutex<i64>,
    cfg: Config,
    language: AsyncMutex<String>,
}

impl AudioProcessor {
    pub fn new(
        cfg: Config,
        vad_model: Arc<dyn shared_vad::VadModel>,
        asr: Arc<dyn Asr>,
        embedder: Arc<dyn Embedder>,
        events: EventProducer,
        storage: SpeakerStorage,
        meeting_id: i64,
    ) -> Result<Self, CoreError> {
        let speakers = storage.load(meeting_id)?;
        let registry = SpeakerRegistry::from_stored(cfg.speaker.clone(), speakers);
        let language = cfg.audio.asr_language.clone();
        Ok(Self {
            audio_buffer: AsyncMutex::new(AudioBuffer::new(cfg.buffer.max_duration_secs, cfg.audio.sample_rate)),
            vad_manager: AsyncMutex::new(VadManager::new(cfg.vad_manager.retention_secs)),
            speaker_registry: AsyncMutex::new(registry),
            voice_detector: AsyncMutex::new(VoiceDetector::new(cfg.vad_model.to_shared_vad_config())),
            long_state: AsyncMutex::new(LongSegmentState::new()),
            short_state: AsyncMutex::new(ShortSegmentState::new()),
            vad_model,
            asr,
            embedder,
            events,
            storage,
            meeting_id: AsyncMutex::new(meeting_id),
            cfg,
            language: AsyncMutex::new(language),
        })
    }

    pub async fn set_language(&self, language: String) {
        *self.language.lock().await = language;
    }

    /// Switches the active speaker-identity scope to a new meeting
    /// without reconnecting: persists the current registry, then reloads
    /// (or starts fresh) under the new id.
    pub async fn switch_meeting(&self, meeting_id: i64) -> Result<(), CoreError> {
        let old_id = {
            let mut guard = self.meeting_id.lock().await;
            let old = *guard;
            *guard = meeting_id;
            old
        };
        {
            let registry = self.speaker_registry.lock().await;
            self.storage.save(old_id, registry.speakers())?;
        }
        let speakers = self.storage.load(meeting_id)?;
        let mut registry = self.speaker_registry.lock().await;
        *registry = SpeakerRegistry::from_stored(self.cfg.speaker.clone(), speakers);
        Ok(())
    }

    /// Feeds one frame of audio into the pipeline: buffers it, runs VAD,
    /// and reacts to whatever state-machine event (if any) comes out.
    pub async fn process_audio(&self, samples: Vec<i16>, start: f64, end: f64) -> Result<(), CoreError> {
        if samples.is_empty() {
            return Err(CoreError::AudioFormat("empty audio frame".to_string()));
        }
        let duration = end - start;
        if !(0.01..=0.2).contains(&duration) {
            tracing::warn!(duration, "frame duration outside the expected [10ms, 200ms] range");
        }

        {
            let mut buffer = self.audio_buffer.lock().await;
            buffer.write(AudioFrame::new(start, end, samples.clone()));
        }

        let frame_f32 = i16_to_f32(&samples);
        let vad_model = self.vad_model.clone();
        let event = {
            let mut detector_guard = self.voice_detector.lock().await;
            // VadModel::predict does CPU-bound inference; route it through
            // spawn_blocking, taking the detector along since it must
            // observe every frame in order.
            let placeholder = VoiceDetector::new(self.cfg.vad_model.to_shared_vad_config());
            let detector = std::mem::replace(&mut *detector_guard, placeholder);
            let (detector, event) = tokio::task::spawn_blocking(move || {
                let mut detector = detector;
                let event = detector.process_frame(vad_model.as_ref(), &frame_f32, duration);
                (detector, event)
            })
            .await
            .map_err(|e| CoreError::ModelInference(e.to_string()))?;
            *detector_guard = detector;
            event
        };

        match event {
            Some(VadEvent::SpeechStart) => self.long_segment_start(start, duration).await,
            Some(VadEvent::ShortPause) => self.on_short_pause(end).await?,
            Some(VadEvent::ShortTimeout) => self.on_short_timeout(end).await?,
            Some(VadEvent::LongPause) => self.long_segment_end(end).await?,
            Some(VadEvent::LongTimeout) => {}
            None => {}
        }
        Ok(())
    }

    /// `start(ts, d)`: the 2-frame lookback preserves onset phonemes.
    async fn long_segment_start(&self, ts: f64, frame_duration: f64) {
        let mut state = self.long_state.lock().await;
        state.active = true;
        state.start = (ts - 2.0 * frame_duration).max(0.0);
    }

    /// `end(ts)`: processes `[start, ts]` and returns the long segment to
    /// Idle. Holds `long_state` across the whole ASR+embedding pass
    /// (`process_long_range`), matching `long_vad_lock`'s "held across
    /// ASR + embedding inference for the whole segment" contract.
    async fn long_segment_end(&self, ts: f64) -> Result<(), CoreError> {
        let mut state = self.long_state.lock().await;
        if !state.active {
            return Ok(());
        }
        let start = state.start;
        if ts > start {
            self.process_long_range(start, ts).await?;
        }
        state.active = false;
        Ok(())
    }

    async fn short_anchor(&self, state: &ShortSegmentState, ts: f64) -> f64 {
        match state.last_short_vad_end {
            Some(t) => t,
            None => {
                let long = self.long_state.lock().await;
                if long.active {
                    long.start
                } else {
                    ts
                }
            }
        }
    }

    /// Holds `short_state` across `short_anchor` and `handle_short_vad`
    /// (the parallel ASR+embedding calls), matching `short_vad_lock`'s
    /// contract.
    async fn on_short_pause(&self, ts: f64) -> Result<(), CoreError> {
        if !self.cfg.vad_model.enable_quick {
            return Ok(());
        }
        let mut state = self.short_state.lock().await;
        let anchor = self.short_anchor(&state, ts).await;
        self.handle_short_vad(anchor, ts, SegmentKind::ShortPause).await?;
        state.last_short_vad_end = Some(ts);
        Ok(())
    }

    /// `SHORT_TIMEOUT` re-runs the same short handler but deliberately
    /// does not advance `last_short_vad_end`, preserved as a deliberate
    /// hysteresis.
    async fn on_short_timeout(&self, ts: f64) -> Result<(), CoreError> {
        if !self.cfg.vad_model.enable_quick || !self.cfg.vad_model.enable_quick_timeout {
            return Ok(());
        }
        {
            let state = self.short_state.lock().await;
            let anchor = self.short_anchor(&state, ts).await;
            self.handle_short_vad(anchor, ts, SegmentKind::ShortTimeout).await?;
        }
        self.try_split_point_search().await?;
        Ok(())
    }

    /// Reads the slice, runs ASR and speaker identification (no
    /// update) concurrently, records a VADSegment, and emits a non-final
    /// transcription event.
    async fn handle_short_vad(&self, start: f64, end: f64, kind: SegmentKind) -> Result<(), CoreError> {
        let (samples, actual_start, actual_end) = self.read_audio(start, end).await;
        if samples.len() < 100 {
            return Ok(());
        }

        let samples_for_asr = samples.clone();
        let (asr_result, embed_result) =
            tokio::join!(self.recognize_samples(samples_for_asr), self.embed_samples(samples));

        let asr_output = match asr_result {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(error = %err, "ASR inference failed for short segment");
                AsrOutput { text: String::new(), token_timestamps: Vec::new() }
            }
        };

        let duration = actual_end - actual_start;
        let speaker_id = match embed_result {
            Ok(embedding) => {
                let mut registry = self.speaker_registry.lock().await;
                registry.identify(embedding, duration, false)
            }
            Err(err) => {
                tracing::warn!(error = %err, "embedding failed for short segment");
                UNKNOWN_SPEAKER
            }
        };

        let token_starts: Vec<i64> = asr_output.token_timestamps.iter().map(|t| t[0]).collect();
        let mut segment = VadSegment::new(actual_start, actual_end, kind);
        segment.annotate(speaker_id, asr_output.text.clone(), token_starts);
        {
            let mut mgr = self.vad_manager.lock().await;
            mgr.add_segment(segment);
        }

        self.events
            .put(ServerMessage::Transcription(TranscriptionEvent {
                text: asr_output.text,
                speaker_id: speaker_id_label(speaker_id),
                start_time: actual_start,
                end_time: actual_end,
                is_final: false,
                timestamp: asr_output.token_timestamps,
            }))
            .await;

        Ok(())
    }

    /// Searches for a speaker-change boundary inside the middle
    /// segment of the last three recorded VADSegments, and if found,
    /// finalises the long segment up to that point without ending it.
    async fn try_split_point_search(&self) -> Result<(), CoreError> {
        let window: Vec<VadSegment> = {
            let mgr = self.vad_manager.lock().await;
            mgr.recent(3).into_iter().cloned().collect()
        };
        if window.len() < 3 {
            return Ok(());
        }
        let (seg_n2, seg_n1, seg_n) = (&window[0], &window[1], &window[2]);
        let merge_threshold = self.cfg.speaker.merge_threshold();

        let embed_n2 = self.embed_slice(seg_n2.start, seg_n2.end).await?;
        let embed_n = self.embed_slice(seg_n.start, seg_n.end).await?;
        let d_orig = coerce_invalid(cosine_distance(&embed_n2, &embed_n));
        if d_orig < merge_threshold {
            return Ok(());
        }

        let embed_n1 = self.embed_slice(seg_n1.start, seg_n1.end).await?;
        let d_prev = coerce_invalid(cosine_distance(&embed_n2, &embed_n1));
        let d_next = coerce_invalid(cosine_distance(&embed_n1, &embed_n));
        if d_prev >= d_orig && d_next >= d_orig {
            return Ok(());
        }

        let mut best_t: Option<f64> = None;
        let mut best_combined = f64::INFINITY;
        for &t_ms in &seg_n1.asr_token_start_times_ms {
            if t_ms < 100 {
                continue;
            }
            let split_t = seg_n1.start + t_ms as f64 / 1000.0;
            if split_t <= seg_n1.start || split_t >= seg_n1.end {
                continue;
            }
            let embed_left = self.embed_slice(seg_n1.start, split_t).await?;
            let embed_right = self.embed_slice(split_t, seg_n1.end).await?;
            let d1 = coerce_invalid(cosine_distance(&embed_n2, &embed_left));
            let d2 = coerce_invalid(cosine_distance(&embed_right, &embed_n));
            if d1 < d_orig && d2 < d_orig && (d1 - d2).abs() <= 0.2 * d_orig {
                let combined = (d1 + d2) / 2.0;
                if combined < best_combined {
                    best_combined = combined;
                    best_t = Some(split_t);
                }
            }
        }

        if let Some(split_t) = best_t {
            if best_combined < 0.8 * d_orig {
                let mut state = self.long_state.lock().await;
                if !state.active {
                    return Ok(());
                }
                let start = state.start;
                if split_t > start {
                    self.process_long_range(start, split_t).await?;
                    state.start = split_t;
                }
            }
        }

        Ok(())
    }

    /// Processes `[start, end]` as a long-segment finalisation: ASR over
    /// the whole slice, then either the whole-segment fallback or
    /// sentence-split + merge + diarize.
    /// Does not touch `long_state` — callers decide whether the segment
    /// ends or just moves its start.
    async fn process_long_range(&self, start: f64, end: f64) -> Result<(), CoreError> {
        let (samples, actual_start, actual_end) = self.read_audio(start, end).await;
        if samples.is_empty() {
            return Ok(());
        }
        let duration = actual_end - actual_start;

        let asr_output = match self.recognize_samples(samples.clone()).await {
            Ok(output) => Some(output),
            Err(err) => {
                tracing::warn!(error = %err, "ASR inference failed for long segment");
                None
            }
        };

        let sentences = asr_output.as_ref().and_then(|output| {
            if output.text.trim().is_empty()
                || duration < self.cfg.audio.sentence_split.min_duration_for_split
                || !self.cfg.audio.sentence_split.enable
            {
                return None;
            }
            match split_sentences_with_timestamps(&output.text, &output.token_timestamps, self.cfg.speaker.min_chunk_duration) {
                Ok(sentences) if !sentences.is_empty() => Some(sentences),
                Ok(_) => None,
                Err(err) => {
                    tracing::warn!(error = %err, "sentence splitting failed, falling back to whole-segment");
                    None
                }
            }
        });

        match sentences {
            None => self.emit_whole_segment(actual_start, actual_end, samples, asr_output).await,
            Some(sentences) => self.emit_merged_sentences(actual_start, sentences).await,
        }
    }

    /// Fallback branch: no usable sentence split, so
    /// the whole slice is identified and emitted as one final event.
    async fn emit_whole_segment(
        &self,
        start: f64,
        end: f64,
        samples: Vec<i16>,
        asr_output: Option<AsrOutput>,
    ) -> Result<(), CoreError> {
        let duration = end - start;
        let speaker_id = match self.embed_samples(samples).await {
            Ok(embedding) => {
                let mut registry = self.speaker_registry.lock().await;
                registry.identify(embedding, duration, true)
            }
            Err(err) => {
                tracing::warn!(error = %err, "embedding failed for whole-segment fallback");
                UNKNOWN_SPEAKER
            }
        };

        let (text, timestamp) = match asr_output {
            Some(output) => (output.text, output.token_timestamps),
            None => (String::new(), Vec::new()),
        };

        self.events
            .put(ServerMessage::Transcription(TranscriptionEvent {
                text,
                speaker_id: speaker_id_label(speaker_id),
                start_time: start,
                end_time: end,
                is_final: true,
                timestamp,
            }))
            .await;

        self.persist_speakers().await;
        Ok(())
    }

    /// Sentence-merge pass plus the second-pass unknown-speaker
    /// resolution, emitting one final event per merged segment.
    async fn emit_merged_sentences(&self, segment_start: f64, sentences: Vec<Sentence>) -> Result<(), CoreError> {
        let merge_threshold = self.cfg.speaker.merge_threshold();
        let sample_rate = { self.audio_buffer.lock().await.sample_rate() };
        let max_ref_samples = (self.cfg.speaker.ref_audio_max_duration_secs * sample_rate as f64) as usize;

        let abs_range = |s: &Sentence| (segment_start + s.start_ms as f64 / 1000.0, segment_start + s.end_ms as f64 / 1000.0);

        let (s0, e0) = abs_range(&sentences[0]);
        let (samples0, ..) = self.read_audio(s0, e0).await;
        let mut ref_audio: Vec<i16> = samples0;
        if ref_audio.len() > max_ref_samples {
            let drop = ref_audio.len() - max_ref_samples;
            ref_audio.drain(0..drop);
        }

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut current = vec![0usize];
        for i in 1..sentences.len() {
            let (si, ei) = abs_range(&sentences[i]);
            let (samples_i, ..) = self.read_audio(si, ei).await;

            let embed_i = self.embed_samples(samples_i.clone()).await;
            let embed_ref = self.embed_samples(ref_audio.clone()).await;
            let d = match (embed_i, embed_ref) {
                (Ok(a), Ok(b)) => {
                    let raw = cosine_distance(&a, &b);
                    if raw >= INVALID_DISTANCE { 0.0 } else { raw }
                }
                // embedding failure is treated as a forced cut, not a match.
                _ => f64::INFINITY,
            };

            if d > merge_threshold {
                groups.push(std::mem::take(&mut current));
                current = vec![i];
            } else {
                current.push(i);
            }

            ref_audio.extend(samples_i);
            if ref_audio.len() > max_ref_samples {
                let drop = ref_audio.len() - max_ref_samples;
                ref_audio.drain(0..drop);
            }
        }
        groups.push(current);

        let merged: Vec<MergedSegment> = groups
            .iter()
            .map(|idxs| {
                let first = &sentences[idxs[0]];
                let last = &sentences[*idxs.last().expect("group is never empty")];
                let mut text = String::new();
                let mut timestamp = Vec::new();
                for &i in idxs {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(&sentences[i].text);
                    timestamp.extend(sentences[i].timestamp.iter().copied());
                }
                MergedSegment { start_ms: first.start_ms, end_ms: last.end_ms, text, timestamp }
            })
            .collect();

        let mut speaker_ids = Vec::with_capacity(merged.len());
        let mut embeddings: Vec<Option<Vec<f32>>> = Vec::with_capacity(merged.len());
        for m in &merged {
            let abs_start = segment_start + m.start_ms as f64 / 1000.0;
            let abs_end = segment_start + m.end_ms as f64 / 1000.0;
            let (samples, ..) = self.read_audio(abs_start, abs_end).await;
            let duration = abs_end - abs_start;
            match self.embed_samples(samples).await {
                Ok(embedding) => {
                    let speaker_id = {
                        let mut registry = self.speaker_registry.lock().await;
                        registry.identify(embedding.clone(), duration, true)
                    };
                    speaker_ids.push(speaker_id);
                    embeddings.push(Some(embedding));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "embedding failed for merged sentence segment");
                    speaker_ids.push(UNKNOWN_SPEAKER);
                    embeddings.push(None);
                }
            }
        }

        // Second pass: reassign isolated speaker_id==0
        // segments to the nearest non-zero neighbour, computed from the
        // pre-reassignment snapshot so nothing propagates transitively.
        let original_ids = speaker_ids.clone();
        for i in 0..speaker_ids.len() {
            if original_ids[i] != UNKNOWN_SPEAKER {
                continue;
            }
            let Some(my_embed) = embeddings[i].as_ref() else { continue };
            let mut best: Option<(u32, f64)> = None;
            if i > 0 && original_ids[i - 1] != UNKNOWN_SPEAKER {
                if let Some(e) = embeddings[i - 1].as_ref() {
                    best = Some((original_ids[i - 1], coerce_invalid(cosine_distance(my_embed, e))));
                }
            }
            if i + 1 < original_ids.len() && original_ids[i + 1] != UNKNOWN_SPEAKER {
                if let Some(e) = embeddings[i + 1].as_ref() {
                    let d = coerce_invalid(cosine_distance(my_embed, e));
                    if best.as_ref().map(|(_, bd)| d < *bd).unwrap_or(true) {
                        best = Some((original_ids[i + 1], d));
                    }
                }
            }
            if let Some((id, _)) = best {
                speaker_ids[i] = id;
            }
        }

        for (m, speaker_id) in merged.into_iter().zip(speaker_ids.into_iter()) {
            let abs_start = segment_start + m.start_ms as f64 / 1000.0;
            let abs_end = segment_start + m.end_ms as f64 / 1000.0;
            self.events
                .put(ServerMessage::Transcription(TranscriptionEvent {
                    text: m.text,
                    speaker_id: speaker_id_label(speaker_id),
                    start_time: abs_start,
                    end_time: abs_end,
                    is_final: true,
                    timestamp: m.timestamp,
                }))
                .await;
        }

        self.persist_speakers().await;
        Ok(())
    }

    async fn read_audio(&self, start: f64, end: f64) -> (Vec<i16>, f64, f64) {
        let buffer = self.audio_buffer.lock().await;
        buffer.read(start, end)
    }

    async fn recognize_samples(&self, samples: Vec<i16>) -> Result<AsrOutput, CoreError> {
        let language = self.language.lock().await.clone();
        let asr = self.asr.clone();
        tokio::task::spawn_blocking(move || asr.recognize(&samples, &language))
            .await
            .map_err(|e| CoreError::ModelInference(e.to_string()))?
    }

    async fn embed_samples(&self, samples: Vec<i16>) -> Result<Vec<f32>, CoreError> {
        let mut audio = i16_to_f32(&samples);
        let max_samples = (self.cfg.speaker.max_chunk_duration * self.cfg.audio.sample_rate as f64) as usize;
        if audio.len() > max_samples {
            let drop = audio.len() - max_samples;
            audio.drain(0..drop);
        }
        let embedder = self.embedder.clone();
        tokio::task::spawn_blocking(move || embedder.embed(&audio))
            .await
            .map_err(|e| CoreError::ModelInference(e.to_string()))?
    }

    async fn embed_slice(&self, start: f64, end: f64) -> Result<Vec<f32>, CoreError> {
        let (samples, ..) = self.read_audio(start, end).await;
        self.embed_samples(samples).await
    }

    async fn persist_speakers(&self) {
        let registry = self.speaker_registry.lock().await;
        let meeting_id = *self.meeting_id.lock().await;
        if let Err(err) = self.storage.save(meeting_id, registry.speakers()) {
            tracing::warn!(error = %err, "failed to persist speaker storage");
        }
    }

    /// Forces any pending long segment to flush immediately, used when
    /// the client sends `AudioStreamStop`. Ends the segment at the
    /// buffer's own latest timestamp rather than a wall-clock reading,
    /// since `start`/`end` throughout the pipeline are stream-relative
    /// seconds chosen by the client, not epoch time.
    pub async fn force_process_pending(&self) -> Result<(), CoreError> {
        let ts = self.audio_buffer.lock().await.latest_end().unwrap_or(0.0);
        self.long_segment_end(ts).await
    }

    /// Reclaims buffer/history space that has aged out since the last
    /// write or segment close. `AudioBuffer`/`VadManager` already clean
    /// up on every insert, so this only matters during a quiet stretch
    /// with no incoming audio; meant to be driven by a periodic task at
    /// `vad_manager.cleanup_interval_secs`.
    pub async fn run_periodic_cleanup(&self) {
        self.audio_buffer.lock().await.cleanup();
        let min_time = crate::audio_buffer::wall_clock_now_secs() - self.cfg.vad_manager.retention_secs;
        self.vad_manager.lock().await.cleanup(min_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speaker::SpeakerStorage;
    use shared_vad::ScriptedVad;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAsr {
        text: String,
        token_timestamps: Vec<[i64; 2]>,
    }

    impl Asr for StubAsr {
        fn recognize(&self, _audio: &[i16], _language: &str) -> Result<AsrOutput, CoreError> {
            Ok(AsrOutput { text: self.text.clone(), token_timestamps: self.token_timestamps.clone() })
        }
    }

    struct StubEmbedder {
        calls: AtomicUsize,
        vectors: Vec<Vec<f32>>,
    }

    impl Embedder for StubEmbedder {
        fn embed(&self, _audio_f32: &[f32]) -> Result<Vec<f32>, CoreError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.vectors[i % self.vectors.len()].clone())
        }
    }

    fn temp_storage(name: &str) -> SpeakerStorage {
        let dir = std::env::temp_dir().join(format!("meeting-core-processor-test-{name}-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        SpeakerStorage::new(dir)
    }

    fn test_processor(asr_text: &str, timestamps: Vec<[i64; 2]>, embeddings: Vec<Vec<f32>>) -> AudioProcessor {
        let cfg = Config::default();
        let vad_model: Arc<dyn shared_vad::VadModel> = Arc::new(ScriptedVad::new(std::iter::empty()));
        let asr: Arc<dyn Asr> = Arc::new(StubAsr { text: asr_text.to_string(), token_timestamps: timestamps });
        let embedder: Arc<dyn Embedder> =
            Arc::new(StubEmbedder { calls: AtomicUsize::new(0), vectors: embeddings });
        let (events, _rx) = crate::events::channel(16);
        let storage = temp_storage("test");
        AudioProcessor::new(cfg, vad_model, asr, embedder, events, storage, 1).unwrap()
    }

    #[tokio::test]
    async fn long_segment_fallback_on_empty_asr_text_emits_whole_segment() {
        let processor = test_processor("", vec![], vec![vec![1.0, 0.0, 0.0]]);
        let t0 = crate::audio_buffer::wall_clock_now_secs();
        processor.long_segment_start(t0, 0.032).await;
        {
            let mut buffer = processor.audio_buffer.lock().await;
            buffer.write(AudioFrame::new(t0, t0 + 4.0, vec![100; 64_000]));
        }
        processor.long_segment_end(t0 + 4.0).await.unwrap();
        assert!(!processor.long_state.lock().await.active);
    }

    #[tokio::test]
    async fn mismatched_asr_timestamps_falls_back_to_whole_segment() {
        let timestamps: Vec<[i64; 2]> = (0..15).map(|i| [i * 100, i * 100 + 90]).collect();
        let text = "one two three four five six seven eight nine ten \
                    eleven twelve thirteen fourteen fifteen sixteen seventeen \
                    eighteen nineteen twenty";
        let processor = test_processor(text, timestamps, vec![vec![1.0, 0.0, 0.0]]);
        let t0 = crate::audio_buffer::wall_clock_now_secs();
        processor.long_segment_start(t0, 0.032).await;
        {
            let mut buffer = processor.audio_buffer.lock().await;
            buffer.write(AudioFrame::new(t0, t0 + 4.0, vec![100; 64_000]));
        }
        processor.long_segment_end(t0 + 4.0).await.unwrap();
        assert!(!processor.long_state.lock().await.active);
    }

    #[tokio::test]
    async fn short_vad_disabled_by_default_never_records_a_segment() {
        let processor = test_processor("hi", vec![[0, 200]], vec![vec![1.0, 0.0, 0.0]]);
        let t0 = crate::audio_buffer::wall_clock_now_secs();
        {
            let mut buffer = processor.audio_buffer.lock().await;
            buffer.write(AudioFrame::new(t0, t0 + 1.0, vec![100; 16_000]));
        }
        processor.on_short_pause(t0 + 1.0).await.unwrap();
        assert!(processor.vad_manager.lock().await.is_empty());
    }

    #[tokio::test]
    async fn short_vad_when_enabled_records_a_non_final_segment() {
        let mut cfg = Config::default();
        cfg.vad_model.enable_quick = true;
        let vad_model: Arc<dyn shared_vad::VadModel> = Arc::new(ScriptedVad::new(std::iter::empty()));
        let asr: Arc<dyn Asr> = Arc::new(StubAsr { text: "hi".to_string(), token_timestamps: vec![[0, 200]] });
        let embedder: Arc<dyn Embedder> =
            Arc::new(StubEmbedder { calls: AtomicUsize::new(0), vectors: vec![vec![1.0, 0.0, 0.0]] });
        let (events, mut rx) = crate::events::channel(16);
        let storage = temp_storage("short-vad");
        let processor = AudioProcessor::new(cfg, vad_model, asr, embedder, events, storage, 1).unwrap();

        let t0 = crate::audio_buffer::wall_clock_now_secs();
        {
            let mut buffer = processor.audio_buffer.lock().await;
            buffer.write(AudioFrame::new(t0, t0 + 1.0, vec![100; 16_000]));
        }
        processor.on_short_pause(t0 + 1.0).await.unwrap();
        assert_eq!(processor.vad_manager.lock().await.len(), 1);
        let event = rx.recv().await.unwrap();
        match event {
            ServerMessage::Transcription(t) => {
                assert!(!t.is_final);
                assert_eq!(t.text, "hi");
            }
            _ => panic!("expected a transcription event"),
        }
    }
}
