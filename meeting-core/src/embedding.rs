use crate::error::CoreError;

/// Black-box speaker-embedding model: maps a float32 PCM segment to a
/// fixed-length embedding vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, audio_f32: &[f32]) -> Result<Vec<f32>, CoreError>;
}
