use serde::{Deserialize, Serialize};

pub const SAMPLE_RATE: u32 = 16000;

/// Messages the client sends over the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Sent once after connection, required before any audio frame.
    Configure {
        token: Option<String>,
        language: Option<String>,
        meeting_id: Option<i64>,
    },
    /// Switch the active speaker-identity scope without reconnecting.
    SwitchMeeting { meeting_id: i64 },
    /// Trigger a forced flush of any pending long segment.
    AudioStreamStop,
    // No explicit AudioChunk variant: binary WebSocket frames are
    // implicitly little-endian i16 PCM audio, carrying their own
    // end timestamp via a small header (see `AUDIO_FRAME_HEADER_LEN`).
}

/// Every binary audio frame is prefixed with 8 bytes: the frame's end
/// timestamp in seconds as a little-endian f64, followed by raw
/// little-endian i16 PCM samples.
pub const AUDIO_FRAME_HEADER_LEN: usize = 8;

/// Transcription event emitted to the transport as a `transcription`
/// event, either a non-final preview or a finalized segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionEvent {
    pub text: String,
    pub speaker_id: String,
    pub start_time: f64,
    pub end_time: f64,
    #[serde(rename = "isFinal")]
    pub is_final: bool,
    pub timestamp: Vec<[i64; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemComponents {
    pub audio: bool,
    pub llm: bool,
    pub rag: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Transcription(TranscriptionEvent),
    Error(ErrorEvent),
    SystemStatus {
        status: String,
        components: SystemComponents,
    },
}

/// On-disk schema for one speaker's persisted embeddings, as written to
/// `data/speakers.{meeting_id}.json`. Field names are the
/// stable JSON keys that must round-trip untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEmbedding {
    pub duration: f64,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSpeaker {
    pub embeddings: Vec<StoredEmbedding>,
    pub average_embedding: Vec<f32>,
    pub average_distance: f64,
    pub adaptive_threshold: f64,
    /// Unknown fields round-trip untouched.
    #[serde(flatten)]
    pub extra: std::collections::HashMap<String, serde_json::Value>,
}
