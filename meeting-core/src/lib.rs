//! Speech-analytics core: ingestion, two-level VAD segmentation, ASR,
//! speaker diarization with persistent identity, and incremental/final
//! transcription events. No transport of its own — `meeting-server`
//! drives this library over a WebSocket connection per session.

pub mod asr;
pub mod audio_buffer;
pub mod config;
pub mod embedding;
pub mod error;
pub mod events;
pub mod processor;
pub mod speaker;
pub mod text;
pub mod vad_manager;

pub use asr::{Asr, AsrOutput};
pub use config::Config;
pub use embedding::Embedder;
pub use error::CoreError;
pub use processor::AudioProcessor;
