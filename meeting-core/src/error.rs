use thiserror::Error;

/// Typed failure kinds for the speech-analytics core. Only
/// [`CoreError::AudioFormat`] and [`CoreError::SplitFailure`] are ever
/// surfaced to a caller as `Err` from the streaming hot path;
/// `ModelInference`/`StorageWrite` on that path are logged and absorbed
/// (they degrade the feature they came from rather than aborting the
/// session). `ConfigInvalid` and `ModelLoad` are startup-time failures
/// and are always propagated.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("unsupported audio format: {0}")]
    AudioFormat(String),

    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("model inference failed: {0}")]
    ModelInference(String),

    #[error("failed to persist speaker storage: {0}")]
    StorageWrite(#[source] std::io::Error),

    #[error("sentence split failed: {0}")]
    SplitFailure(String),

    #[error("event channel full, dropping event")]
    EventChannelFull,
}
