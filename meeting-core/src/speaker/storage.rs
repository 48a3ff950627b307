use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use shared_protocol::{StoredEmbedding, StoredSpeaker};

use crate::error::CoreError;

use super::engine::{SpeakerEmbedding, SpeakerEmbeddings};

/// Persists speaker profiles to `{data_dir}/speakers.{meeting_id}.json`,
/// one file per meeting. Writes go through a temp file and an atomic
/// rename so a crash mid-write never leaves a corrupt or truncated file
/// in place.
pub struct SpeakerStorage {
    data_dir: PathBuf,
    lock: std::sync::Mutex<()>,
}

impl SpeakerStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            lock: std::sync::Mutex::new(()),
        }
    }

    fn path_for(&self, meeting_id: i64) -> PathBuf {
        self.data_dir.join(format!("speakers.{meeting_id}.json"))
    }

    /// Loads the persisted profiles for `meeting_id`. A missing file is
    /// not an error — it just means no speakers have been seen yet.
    /// Speaker ids that fail to parse as `u32` (corrupt key) are skipped
    /// rather than failing the whole load.
    pub fn load(&self, meeting_id: i64) -> Result<HashMap<u32, SpeakerEmbeddings>, CoreError> {
        let path = self.path_for(meeting_id);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let _guard = self.lock.lock().expect("speaker storage lock poisoned");
        let raw = std::fs::read_to_string(&path).map_err(CoreError::StorageWrite)?;
        let stored: HashMap<String, StoredSpeaker> =
            serde_json::from_str(&raw).map_err(|e| CoreError::ConfigInvalid(e.to_string()))?;

        Ok(stored
            .into_iter()
            .filter_map(|(id, speaker)| id.parse::<u32>().ok().map(|id| (id, from_stored(id, speaker))))
            .collect())
    }

    /// Atomically writes the full set of profiles for `meeting_id`.
    pub fn save(&self, meeting_id: i64, speakers: &HashMap<u32, SpeakerEmbeddings>) -> Result<(), CoreError> {
        let _guard = self.lock.lock().expect("speaker storage lock poisoned");
        std::fs::create_dir_all(&self.data_dir).map_err(CoreError::StorageWrite)?;
        let stored: HashMap<String, StoredSpeaker> = speakers
            .iter()
            .map(|(id, profile)| (id.to_string(), to_stored(profile)))
            .collect();
        let serialized =
            serde_json::to_string_pretty(&stored).map_err(|e| CoreError::ConfigInvalid(e.to_string()))?;

        let final_path = self.path_for(meeting_id);
        let tmp_path = final_path.with_extension("json.tmp");
        write_atomic(&tmp_path, &final_path, serialized.as_bytes())
    }
}

fn write_atomic(tmp_path: &Path, final_path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    {
        let mut f = std::fs::File::create(tmp_path).map_err(CoreError::StorageWrite)?;
        f.write_all(bytes).map_err(CoreError::StorageWrite)?;
        f.sync_all().map_err(CoreError::StorageWrite)?;
    }
    std::fs::rename(tmp_path, final_path).map_err(CoreError::StorageWrite)
}

fn to_stored(profile: &SpeakerEmbeddings) -> StoredSpeaker {
    StoredSpeaker {
        embeddings: profile
            .vectors
            .iter()
            .map(|e| StoredEmbedding {
                duration: e.duration,
                embedding: e.embedding.clone(),
            })
            .collect(),
        average_embedding: profile.centroid.clone(),
        average_distance: profile.mean_pairwise_distance,
        adaptive_threshold: profile.adaptive_threshold,
        extra: HashMap::new(),
    }
}

fn from_stored(id: u32, stored: StoredSpeaker) -> SpeakerEmbeddings {
    let vectors: Vec<SpeakerEmbedding> = stored
        .embeddings
        .into_iter()
        .map(|e| SpeakerEmbedding {
            embedding: e.embedding,
            duration: e.duration,
        })
        .collect();
    SpeakerEmbeddings::from_parts(id, vectors, stored.adaptive_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips_profiles() {
        let dir = std::env::temp_dir().join(format!("meeting-core-test-{}", std::process::id()));
        let storage = SpeakerStorage::new(&dir);

        let mut speakers = HashMap::new();
        let profile = SpeakerEmbeddings::new(
            1,
            SpeakerEmbedding {
                embedding: vec![0.1, 0.2, 0.3],
                duration: 2.5,
            },
            0.25,
        );
        speakers.insert(1, profile);

        storage.save(42, &speakers).unwrap();
        let loaded = storage.load(42).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&1].vectors.len(), 1);
        assert!((loaded[&1].centroid[0] - 0.1).abs() < 1e-6);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_of_missing_meeting_is_empty_not_an_error() {
        let dir = std::env::temp_dir().join(format!("meeting-core-test-missing-{}", std::process::id()));
        let storage = SpeakerStorage::new(&dir);
        let loaded = storage.load(999).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn unknown_fields_round_trip_untouched() {
        let dir = std::env::temp_dir().join(format!("meeting-core-test-extra-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("speakers.7.json");
        std::fs::write(
            &path,
            r#"{"1": {"embeddings": [{"duration": 2.0, "embedding": [0.1]}], "average_embedding": [0.1], "average_distance": 0.0, "adaptive_threshold": 0.25, "note": "custom"}}"#,
        )
        .unwrap();

        let storage = SpeakerStorage::new(&dir);
        let loaded = storage.load(7).unwrap();
        assert_eq!(loaded.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}
