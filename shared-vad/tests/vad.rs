use shared_vad::{ScriptedVad, VadEvent, VoiceDetector, VoiceDetectorConfig};

fn run(probs: &[f32], frame_duration: f64) -> Vec<Option<VadEvent>> {
    let model = ScriptedVad::new(probs.iter().copied());
    let mut detector = VoiceDetector::new(VoiceDetectorConfig::default());
    let frame = vec![0.0f32; 16];
    probs
        .iter()
        .map(|_| detector.process_frame(&model, &frame, frame_duration))
        .collect()
}

#[test]
fn speech_start_fires_once_then_goes_quiet() {
    let events = run(&[0.9, 0.9, 0.9], 0.02);
    assert_eq!(events[0], Some(VadEvent::SpeechStart));
    assert_eq!(events[1], None);
    assert_eq!(events[2], None);
}

#[test]
fn silence_after_speech_yields_short_then_long_pause() {
    let mut probs = vec![0.9];
    probs.extend(std::iter::repeat(0.0).take(60));
    let events = run(&probs, 0.02);
    assert_eq!(events[0], Some(VadEvent::SpeechStart));
    assert!(events.contains(&Some(VadEvent::ShortPause)));
    assert!(events.contains(&Some(VadEvent::LongPause)));
}

#[test]
fn no_speech_before_activation_produces_no_events() {
    let events = run(&[0.1, 0.1, 0.1, 0.1], 0.1);
    assert!(events.iter().all(|e| e.is_none()));
}

#[test]
fn re_feeding_same_sequence_from_a_fresh_detector_is_idempotent() {
    let probs: Vec<f32> = {
        let mut v = vec![0.9, 0.9];
        v.extend(std::iter::repeat(0.0).take(18));
        v
    };
    let first = run(&probs, 0.05);
    let second = run(&probs, 0.05);
    assert_eq!(first, second);
}

#[test]
fn sustained_speech_crosses_quick_force_trigger_exactly_once_before_long() {
    let mut probs = vec![0.9];
    probs.extend(std::iter::repeat(0.9).take(30));
    let events = run(&probs, 0.1);
    let short_timeouts = events.iter().filter(|e| **e == Some(VadEvent::ShortTimeout)).count();
    let long_timeouts = events.iter().filter(|e| **e == Some(VadEvent::LongTimeout)).count();
    assert_eq!(short_timeouts, 1);
    assert_eq!(long_timeouts, 0);
}

#[test]
fn adaptive_threshold_shortens_long_pause_after_sustained_speech() {
    // Push long_speech_duration past the adaptive_threshold (3.0s) before
    // silence begins, then confirm long pause fires at the shortened
    // min_silence_duration_short (0.5s) rather than the base 0.8s.
    let mut probs = vec![0.9];
    probs.extend(std::iter::repeat(0.9).take(35)); // 3.5s of voiced frames
    probs.extend(std::iter::repeat(0.0).take(6)); // 0.6s silence
    let events = run(&probs, 0.1);
    let silence_start = 36;
    let long_pause_index = events[silence_start..]
        .iter()
        .position(|e| *e == Some(VadEvent::LongPause));
    assert!(long_pause_index.is_some());
    assert!(long_pause_index.unwrap() <= 5);
}

#[test]
fn reset_clears_speaking_state_and_filter_memory() {
    let model = ScriptedVad::new([0.9, 0.9]);
    let mut detector = VoiceDetector::new(VoiceDetectorConfig::default());
    let frame = vec![0.0f32; 16];
    detector.process_frame(&model, &frame, 0.1);
    assert!(detector.is_speaking());
    detector.reset();
    assert!(!detector.is_speaking());
}
