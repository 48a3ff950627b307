use std::collections::VecDeque;

/// Which VAD-level event closed this segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    ShortPause,
    ShortTimeout,
}

/// A closed short-VAD segment: created on every `SHORT_PAUSE`/
/// `SHORT_TIMEOUT` and annotated in place with its ASR and speaker
/// results once both complete.
#[derive(Debug, Clone)]
pub struct VadSegment {
    pub start: f64,
    pub end: f64,
    pub kind: SegmentKind,
    pub speaker_id: Option<u32>,
    pub asr_text: Option<String>,
    pub asr_token_start_times_ms: Vec<i64>,
    pub processed: bool,
}

impl VadSegment {
    pub fn new(start: f64, end: f64, kind: SegmentKind) -> Self {
        Self {
            start,
            end,
            kind,
            speaker_id: None,
            asr_text: None,
            asr_token_start_times_ms: Vec::new(),
            processed: false,
        }
    }

    pub fn annotate(&mut self, speaker_id: u32, asr_text: String, token_start_times_ms: Vec<i64>) {
        self.speaker_id = Some(speaker_id);
        self.asr_text = Some(asr_text);
        self.asr_token_start_times_ms = token_start_times_ms;
        self.processed = true;
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Append-only history of closed `VADSegment`s, annotated with ASR and
/// speaker results, so the speaker-change split search
/// can look back a fixed window without re-deriving segments from the
/// raw VAD event stream.
pub struct VadManager {
    segments: VecDeque<VadSegment>,
    retention_secs: f64,
}

impl VadManager {
    pub fn new(retention_secs: f64) -> Self {
        Self {
            segments: VecDeque::new(),
            retention_secs: retention_secs.max(0.0),
        }
    }

    pub fn add_segment(&mut self, segment: VadSegment) {
        let min_time = segment.end - self.retention_secs;
        self.segments.push_back(segment);
        self.cleanup(min_time);
    }

    /// Drops segments whose `end` is older than `min_time`. Exposed
    /// publicly so a periodic GC task can reclaim history during a
    /// stretch with no incoming segments.
    pub fn cleanup(&mut self, min_time: f64) {
        while let Some(front) = self.segments.front() {
            if front.end < min_time {
                self.segments.pop_front();
            } else {
                break;
            }
        }
    }

    /// The `n` most recently closed segments, oldest first. Returns fewer
    /// than `n` if history is shorter.
    pub fn recent(&self, n: usize) -> Vec<&VadSegment> {
        let len = self.segments.len();
        let skip = len.saturating_sub(n);
        self.segments.iter().skip(skip).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_returns_in_chronological_order() {
        let mut mgr = VadManager::new(120.0);
        mgr.add_segment(VadSegment::new(0.0, 1.0, SegmentKind::ShortPause));
        mgr.add_segment(VadSegment::new(1.0, 2.0, SegmentKind::ShortPause));
        mgr.add_segment(VadSegment::new(2.0, 3.0, SegmentKind::ShortPause));
        let recent = mgr.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].start, 1.0);
        assert_eq!(recent[1].start, 2.0);
    }

    #[test]
    fn recent_caps_at_available_history() {
        let mut mgr = VadManager::new(120.0);
        mgr.add_segment(VadSegment::new(0.0, 1.0, SegmentKind::ShortPause));
        assert_eq!(mgr.recent(3).len(), 1);
    }

    #[test]
    fn cleanup_drops_segments_ending_before_min_time() {
        let mut mgr = VadManager::new(120.0);
        mgr.add_segment(VadSegment::new(0.0, 1.0, SegmentKind::ShortPause));
        mgr.add_segment(VadSegment::new(1.0, 2.0, SegmentKind::ShortPause));
        mgr.cleanup(1.5);
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.recent(1)[0].start, 1.0);
    }

    #[test]
    fn annotate_marks_segment_processed() {
        let mut seg = VadSegment::new(0.0, 1.0, SegmentKind::ShortPause);
        assert!(!seg.processed);
        seg.annotate(1, "hello".to_string(), vec![0, 200]);
        assert!(seg.processed);
        assert_eq!(seg.speaker_id, Some(1));
    }
}
