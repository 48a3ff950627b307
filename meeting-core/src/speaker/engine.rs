use std::collections::{HashMap, VecDeque};

use crate::config::SpeakerConfig;

use super::{coerce_invalid, cosine_distance};

/// Sentinel speaker id meaning "unknown / not yet identified"
/// (`speaker_id` is a positive integer, with `0` reserved for unknown).
pub const UNKNOWN_SPEAKER: u32 = 0;

/// One stored embedding sample contributing to a speaker's profile.
#[derive(Debug, Clone)]
pub struct SpeakerEmbedding {
    pub embedding: Vec<f32>,
    pub duration: f64,
}

/// A speaker's aggregated voice profile: up to `K` retained embedding
/// samples plus the running statistics derived from them.
#[derive(Debug, Clone)]
pub struct SpeakerEmbeddings {
    pub id: u32,
    pub vectors: Vec<SpeakerEmbedding>,
    pub centroid: Vec<f32>,
    pub mean_pairwise_distance: f64,
    pub adaptive_threshold: f64,
    recent_distances: VecDeque<f64>,
}

impl SpeakerEmbeddings {
    pub fn new(id: u32, first: SpeakerEmbedding, base_threshold: f64) -> Self {
        let centroid = first.embedding.clone();
        Self {
            id,
            vectors: vec![first],
            centroid,
            mean_pairwise_distance: 0.0,
            adaptive_threshold: base_threshold,
            recent_distances: VecDeque::new(),
        }
    }

    /// Rebuilds a profile from persisted storage, recomputing the
    /// centroid from the stored vectors rather than trusting a
    /// possibly-stale stored aggregate.
    pub fn from_parts(
        id: u32,
        vectors: Vec<SpeakerEmbedding>,
        adaptive_threshold: f64,
    ) -> Self {
        let dims = vectors.first().map(|v| v.embedding.len()).unwrap_or(0);
        let mut profile = Self {
            id,
            vectors,
            centroid: vec![0.0; dims],
            mean_pairwise_distance: 0.0,
            adaptive_threshold,
            recent_distances: VecDeque::new(),
        };
        profile.recompute();
        profile
    }

    fn recompute(&mut self) {
        let dims = self.centroid.len().max(
            self.vectors.first().map(|v| v.embedding.len()).unwrap_or(0),
        );
        let mut sums = vec![0.0f64; dims];
        for sample in &self.vectors {
            for (s, &v) in sums.iter_mut().zip(sample.embedding.iter()) {
                *s += v as f64;
            }
        }
        let n = self.vectors.len().max(1) as f64;
        self.centroid = sums.iter().map(|s| (s / n) as f32).collect();

        if self.vectors.len() < 2 {
            self.mean_pairwise_distance = 0.0;
        } else {
            let mut total = 0.0;
            let mut pairs = 0usize;
            for i in 0..self.vectors.len() {
                for j in (i + 1)..self.vectors.len() {
                    total +=
                        coerce_invalid(cosine_distance(&self.vectors[i].embedding, &self.vectors[j].embedding));
                    pairs += 1;
                }
            }
            self.mean_pairwise_distance = total / pairs as f64;
        }
    }

    /// Adds a new embedding sample: grows the sample set below capacity
    /// `K`; at capacity, replaces the most outlying stored sample only if
    /// the new one is, on average, a better fit than the existing spread.
    fn add_embedding(&mut self, sample: SpeakerEmbedding, cfg: &SpeakerConfig) {
        if self.vectors.len() < cfg.max_embeddings {
            self.vectors.push(sample);
            self.recompute();
            return;
        }
        let distances: Vec<f64> = self
            .vectors
            .iter()
            .map(|v| coerce_invalid(cosine_distance(&sample.embedding, &v.embedding)))
            .collect();
        let avg_new = distances.iter().sum::<f64>() / distances.len().max(1) as f64;
        if avg_new < self.mean_pairwise_distance {
            if let Some((idx, _)) = distances
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
            {
                self.vectors[idx] = sample;
                self.recompute();
            }
        }
    }

    /// Folds a matched observation into this profile: records the
    /// observed distance into the recent-distance ring, updates the
    /// adaptive threshold, and adds the embedding sample.
    fn record_match(&mut self, sample: SpeakerEmbedding, distance: f64, cfg: &SpeakerConfig) {
        self.recent_distances.push_back(distance);
        while self.recent_distances.len() > cfg.recent_distances_capacity.max(1) {
            self.recent_distances.pop_front();
        }
        let blended = cfg.adaptive_decay * self.adaptive_threshold + (1.0 - cfg.adaptive_decay) * distance;
        let base = cfg.base_distance_threshold;
        self.adaptive_threshold = blended.clamp(base * cfg.adaptive_min_factor, base * cfg.adaptive_max_factor);
        self.add_embedding(sample, cfg);
    }

    /// Whether `candidate` (observed over `candidate_duration` seconds)
    /// is the same speaker as this profile. Returns the computed distance
    /// alongside the verdict so the caller can rank candidates and, on a
    /// match, fold the observation in via [`Self::observe`].
    pub fn is_same_speaker(&self, candidate: &[f32], candidate_duration: f64) -> (bool, f64) {
        if candidate_duration < 0.1 {
            return (false, f64::INFINITY);
        }
        let distance = coerce_invalid(cosine_distance(candidate, &self.centroid));
        let duration_factor = 1.0 + (3.0 - candidate_duration).max(0.0) / 3.0 * 0.25;
        let threshold_eff = self.adaptive_threshold * duration_factor;

        let avg_h = if self.recent_distances.is_empty() {
            threshold_eff
        } else {
            self.recent_distances.iter().sum::<f64>() / self.recent_distances.len() as f64
        };
        let std_h = if self.recent_distances.len() < 2 {
            threshold_eff * 0.1
        } else {
            let mean = avg_h;
            let variance = self.recent_distances.iter().map(|d| (d - mean).powi(2)).sum::<f64>()
                / self.recent_distances.len() as f64;
            variance.sqrt()
        };

        let is_same = distance < threshold_eff || distance < avg_h + std_h;
        (is_same, distance)
    }

    /// Records a matched observation (called after `is_same_speaker`
    /// returns true and the caller allows updates).
    pub fn observe(&mut self, embedding: Vec<f32>, duration: f64, distance: f64, cfg: &SpeakerConfig) {
        self.record_match(SpeakerEmbedding { embedding, duration }, distance, cfg);
    }
}

/// Identifies and tracks speakers within the scope of one meeting,
/// mirroring the reference's MRU-before-full-scan lookup order: a small
/// ring of recently active speaker ids is always checked first, and a
/// full registry scan only happens when the caller allows it (i.e. the
/// observed segment is long enough to trust for identification).
pub struct SpeakerRegistry {
    speakers: HashMap<u32, SpeakerEmbeddings>,
    recent_ids: VecDeque<u32>,
    last_issued_id: u32,
    cfg: SpeakerConfig,
}

impl SpeakerRegistry {
    pub fn new(cfg: SpeakerConfig) -> Self {
        Self {
            speakers: HashMap::new(),
            recent_ids: VecDeque::new(),
            last_issued_id: 0,
            cfg,
        }
    }

    pub fn from_stored(cfg: SpeakerConfig, speakers: HashMap<u32, SpeakerEmbeddings>) -> Self {
        let last_issued_id = speakers.keys().copied().max().unwrap_or(0);
        Self {
            speakers,
            recent_ids: VecDeque::new(),
            last_issued_id,
            cfg,
        }
    }

    pub fn speakers(&self) -> &HashMap<u32, SpeakerEmbeddings> {
        &self.speakers
    }

    fn touch_recent(&mut self, id: u32) {
        self.recent_ids.retain(|&existing| existing != id);
        self.recent_ids.push_front(id);
        if self.recent_ids.len() > self.cfg.recent_ids_capacity.max(1) {
            self.recent_ids.pop_back();
        }
    }

    /// Finds the best (lowest-distance) match for `embedding` among
    /// `ids`, per `is_same_speaker`. Returns `None` if no candidate
    /// matches.
    fn best_match(&self, ids: impl Iterator<Item = u32>, embedding: &[f32], duration: f64) -> Option<(u32, f64)> {
        let mut best: Option<(u32, f64)> = None;
        for id in ids {
            if let Some(profile) = self.speakers.get(&id) {
                let (is_same, distance) = profile.is_same_speaker(embedding, duration);
                if is_same && best.as_ref().map(|(_, d)| distance < *d).unwrap_or(true) {
                    best = Some((id, distance));
                }
            }
        }
        best
    }

    /// Closest MRU entry by raw cosine distance, ignoring the
    /// `is_same_speaker` gate — used for the short-audio unmatched
    /// fallback, which never creates a new speaker or persists.
    fn closest_recent(&self, embedding: &[f32]) -> Option<u32> {
        self.recent_ids
            .iter()
            .filter_map(|&id| {
                self.speakers
                    .get(&id)
                    .map(|p| (id, coerce_invalid(cosine_distance(embedding, &p.centroid))))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    fn add_new_speaker(&mut self, embedding: Vec<f32>, duration: f64) -> u32 {
        self.last_issued_id += 1;
        let id = self.last_issued_id;
        let profile = SpeakerEmbeddings::new(
            id,
            SpeakerEmbedding { embedding, duration },
            self.cfg.base_distance_threshold,
        );
        self.speakers.insert(id, profile);
        id
    }

    /// Resolves a speaker id for `embedding`, observed over `duration`
    /// seconds. Returns [`UNKNOWN_SPEAKER`] (`0`) when the segment can't
    /// be trusted and no MRU candidate exists.
    pub fn identify(&mut self, embedding: Vec<f32>, duration: f64, allow_update: bool) -> u32 {
        let allow_update = allow_update && duration >= self.cfg.min_chunk_duration;

        if self.speakers.is_empty() {
            if !allow_update {
                return UNKNOWN_SPEAKER;
            }
            let id = self.add_new_speaker(embedding, duration);
            self.touch_recent(id);
            return id;
        }

        let recent_snapshot: Vec<u32> = self.recent_ids.iter().copied().collect();
        if let Some((id, distance)) = self.best_match(recent_snapshot.iter().copied(), &embedding, duration) {
            if allow_update {
                if let Some(profile) = self.speakers.get_mut(&id) {
                    profile.observe(embedding, duration, distance, &self.cfg);
                }
                self.touch_recent(id);
            }
            return id;
        }

        if !allow_update {
            return self.closest_recent(&embedding).unwrap_or(UNKNOWN_SPEAKER);
        }

        let remaining: Vec<u32> = self
            .speakers
            .keys()
            .copied()
            .filter(|id| !recent_snapshot.contains(id))
            .collect();
        if let Some((id, distance)) = self.best_match(remaining.into_iter(), &embedding, duration) {
            if let Some(profile) = self.speakers.get_mut(&id) {
                profile.observe(embedding, duration, distance, &self.cfg);
            }
            self.touch_recent(id);
            return id;
        }

        let id = self.add_new_speaker(embedding, duration);
        self.touch_recent(id);
        id
    }

    /// Cosine distance between `embedding` and speaker `id`'s centroid,
    /// used by the speaker-change split search without
    /// going through the full `identify` match/update flow.
    pub fn distance_to(&self, id: u32, embedding: &[f32]) -> f64 {
        self.speakers
            .get(&id)
            .map(|p| coerce_invalid(cosine_distance(embedding, &p.centroid)))
            .unwrap_or(super::INVALID_DISTANCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SpeakerConfig {
        SpeakerConfig::default()
    }

    #[test]
    fn first_observation_creates_a_new_speaker() {
        let mut registry = SpeakerRegistry::new(cfg());
        let id = registry.identify(vec![1.0, 0.0, 0.0], 4.0, true);
        assert_eq!(id, 1);
        assert_eq!(registry.speakers().len(), 1);
    }

    #[test]
    fn similar_embedding_matches_existing_speaker() {
        let mut registry = SpeakerRegistry::new(cfg());
        let id1 = registry.identify(vec![1.0, 0.0, 0.0], 4.0, true);
        let id2 = registry.identify(vec![0.99, 0.01, 0.0], 4.0, true);
        assert_eq!(id1, id2);
    }

    #[test]
    fn dissimilar_embedding_creates_a_second_speaker() {
        let mut registry = SpeakerRegistry::new(cfg());
        let id1 = registry.identify(vec![1.0, 0.0, 0.0], 4.0, true);
        let id2 = registry.identify(vec![0.0, 1.0, 0.0], 4.0, true);
        assert_ne!(id1, id2);
    }

    #[test]
    fn short_audio_on_empty_registry_is_unknown() {
        let mut registry = SpeakerRegistry::new(cfg());
        let id = registry.identify(vec![1.0, 0.0, 0.0], 0.5, false);
        assert_eq!(id, UNKNOWN_SPEAKER);
        assert!(registry.speakers().is_empty());
    }

    #[test]
    fn short_audio_never_creates_a_new_speaker_when_history_exists() {
        let mut registry = SpeakerRegistry::new(cfg());
        let id1 = registry.identify(vec![1.0, 0.0, 0.0], 4.0, true);
        let id2 = registry.identify(vec![0.0, 1.0, 0.0], 0.1, false);
        assert_eq!(id1, id2);
        assert_eq!(registry.speakers().len(), 1);
    }

    #[test]
    fn single_vector_profile_has_zero_mean_pairwise_distance() {
        let profile = SpeakerEmbeddings::new(
            1,
            SpeakerEmbedding {
                embedding: vec![0.1, 0.2, 0.3],
                duration: 4.0,
            },
            0.25,
        );
        assert_eq!(profile.mean_pairwise_distance, 0.0);
    }
}
