//! Deterministic tokenizer and sentence splitter used to turn a flat ASR
//! transcript plus its (separately-tokenized) timestamps into
//! timestamped sentences for the `transcription` event.

use crate::error::CoreError;

const PUNCTUATION: &[char] = &[
    '，', '。', '！', '？', '；', '：', '、', '．', ',', '.', ':', ';', '!', '?', '(', ')', '[', ']',
    '{', '}', '\'', '"', '…',
];

const EMOJI: &[char] = &['😀', '😂', '🙂', '🙁', '👍', '👎', '❤', '😊', '😢', '🔥'];

const SENTENCE_TERMINATORS: &[char] = &['。', '！', '？', '!', '?'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    Cjk,
    Emoji,
    Punctuation,
    Other,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub text: String,
    pub kind: TokenKind,
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3040..=0x30FF | 0x30A0..=0x30FF | 0xAC00..=0xD7A3)
}

fn classify(c: char) -> Option<TokenKind> {
    if c.is_whitespace() {
        None
    } else if PUNCTUATION.contains(&c) {
        Some(TokenKind::Punctuation)
    } else if EMOJI.contains(&c) {
        Some(TokenKind::Emoji)
    } else if is_cjk(c) {
        Some(TokenKind::Cjk)
    } else if c.is_ascii_alphanumeric() {
        Some(TokenKind::Word)
    } else {
        Some(TokenKind::Other)
    }
}

/// Tokenizes free text: ASCII alphanumeric runs become a single `Word`
/// token, CJK characters and fixed-set emoji are one token each,
/// punctuation from [`PUNCTUATION`] is one token each, everything else
/// (other than whitespace, which is dropped) is one rune per token.
pub fn tokenize(s: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word_buf = String::new();

    let flush = |buf: &mut String, tokens: &mut Vec<Token>| {
        if !buf.is_empty() {
            tokens.push(Token {
                text: std::mem::take(buf),
                kind: TokenKind::Word,
            });
        }
    };

    for c in s.chars() {
        match classify(c) {
            None => flush(&mut word_buf, &mut tokens),
            Some(TokenKind::Word) => word_buf.push(c),
            Some(kind) => {
                flush(&mut word_buf, &mut tokens);
                tokens.push(Token {
                    text: c.to_string(),
                    kind,
                });
            }
        }
    }
    flush(&mut word_buf, &mut tokens);
    tokens
}

fn is_terminator(token: &Token) -> bool {
    token.kind == TokenKind::Punctuation
        && token.text.chars().next().is_some_and(|c| SENTENCE_TERMINATORS.contains(&c))
}

/// A sentence boundary drawn from the raw ASR token stream, with
/// per-token timing preserved for progressive client-side highlighting.
#[derive(Debug, Clone)]
pub struct Sentence {
    pub text: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub timestamp: Vec<[i64; 2]>,
}

/// Reconciles `text`'s deterministic tokenization against the ASR's own
/// `token_timestamps`, splits at [`SENTENCE_TERMINATORS`], and
/// forward-merges sentences shorter than `min_chunk_duration_secs` into
/// whatever follows them.
///
/// If the two token counts differ by more than one,
/// splitting fails outright (`Err(SplitFailure)`, triggering the
/// long-segment whole-slice fallback); a difference of exactly one is
/// tolerated by truncating both to the shorter length.
pub fn split_sentences_with_timestamps(
    text: &str,
    token_timestamps: &[[i64; 2]],
    min_chunk_duration_secs: f64,
) -> Result<Vec<Sentence>, CoreError> {
    let tokens = tokenize(text);

    let diff = tokens.len().abs_diff(token_timestamps.len());
    if diff > 1 {
        return Err(CoreError::SplitFailure(format!(
            "token/timestamp count mismatch: {} tokens vs {} timestamps",
            tokens.len(),
            token_timestamps.len()
        )));
    }
    let n = tokens.len().min(token_timestamps.len());
    let tokens = &tokens[..n];
    let token_timestamps = &token_timestamps[..n];

    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let mut raw: Vec<Sentence> = Vec::new();
    let mut current_text = String::new();
    let mut current_start: Option<i64> = None;
    let mut current_timestamp: Vec<[i64; 2]> = Vec::new();

    for (token, ts) in tokens.iter().zip(token_timestamps.iter()) {
        if current_start.is_none() {
            current_start = Some(ts[0]);
        }
        if matches!(token.kind, TokenKind::Word) && !current_text.is_empty() && !current_text.ends_with(' ') {
            current_text.push(' ');
        }
        current_text.push_str(&token.text);
        current_timestamp.push(*ts);

        if is_terminator(token) {
            raw.push(Sentence {
                text: current_text.trim().to_string(),
                start_ms: current_start.unwrap_or(ts[0]),
                end_ms: ts[1],
                timestamp: std::mem::take(&mut current_timestamp),
            });
            current_text.clear();
            current_start = None;
        }
    }

    if !current_text.trim().is_empty() {
        raw.push(Sentence {
            text: current_text.trim().to_string(),
            start_ms: current_start.unwrap_or(0),
            end_ms: token_timestamps.last().map(|t| t[1]).unwrap_or(0),
            timestamp: current_timestamp,
        });
    }

    Ok(merge_short_sentences(raw, min_chunk_duration_secs))
}

/// Any sentence shorter than `min_chunk_duration_secs` absorbs into the
/// sentence that follows it; a trailing short sentence with nothing
/// left to follow it merges into the previous emitted sentence instead.
fn merge_short_sentences(sentences: Vec<Sentence>, min_chunk_duration_secs: f64) -> Vec<Sentence> {
    let min_ms = (min_chunk_duration_secs * 1000.0) as i64;

    let mut result: Vec<Sentence> = Vec::with_capacity(sentences.len());
    let mut pending: Option<Sentence> = None;
    for sentence in sentences.into_iter() {
        match pending.take() {
            None => pending = Some(sentence),
            Some(prev) => {
                let prev_duration = prev.end_ms - prev.start_ms;
                if prev_duration < min_ms {
                    pending = Some(merge_two(prev, sentence));
                } else {
                    result.push(prev);
                    pending = Some(sentence);
                }
            }
        }
    }
    if let Some(last) = pending {
        let last_duration = last.end_ms - last.start_ms;
        if last_duration < min_ms && !result.is_empty() {
            let prev = result.pop().unwrap();
            result.push(merge_two(prev, last));
        } else {
            result.push(last);
        }
    }
    result
}

fn merge_two(prev: Sentence, next: Sentence) -> Sentence {
    let mut combined_text = prev.text;
    if !combined_text.is_empty() {
        combined_text.push(' ');
    }
    combined_text.push_str(&next.text);
    let mut combined_timestamp = prev.timestamp;
    combined_timestamp.extend(next.timestamp.iter().copied());
    Sentence {
        text: combined_text,
        start_ms: prev.start_ms,
        end_ms: next.end_ms,
        timestamp: combined_timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_groups_ascii_words_and_splits_cjk_per_rune() {
        let tokens = tokenize("hello 你好!");
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "你", "好", "!"]);
    }

    #[test]
    fn splits_on_terminal_punctuation() {
        let text = "Hello world. Bye!";
        // tokens: Hello, world, ., Bye, ! = 5 tokens
        let timestamps = vec![[0, 300], [300, 600], [600, 650], [700, 900], [900, 950]];
        let sentences = split_sentences_with_timestamps(text, &timestamps, 0.0).unwrap();
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[1].start_ms, 700);
    }

    #[test]
    fn short_leading_sentence_merges_forward() {
        let text = "Hi. This is longer.";
        // tokens: Hi, ., This, is, longer, . = 6 tokens
        let timestamps = vec![
            [0, 100],
            [100, 120],
            [200, 400],
            [400, 600],
            [600, 1200],
            [1200, 1250],
        ];
        let sentences = split_sentences_with_timestamps(text, &timestamps, 1.0).unwrap();
        assert_eq!(sentences.len(), 1);
        assert!(sentences[0].text.starts_with("Hi"));
    }

    #[test]
    fn no_terminators_yields_single_trailing_sentence() {
        let text = "just talking";
        let timestamps = vec![[0, 100], [100, 400]];
        let sentences = split_sentences_with_timestamps(text, &timestamps, 0.0).unwrap();
        assert_eq!(sentences.len(), 1);
        assert_eq!(sentences[0].end_ms, 400);
    }

    #[test]
    fn off_by_one_timestamp_count_truncates() {
        let text = "Hi!"; // tokens: Hi, ! = 2
        let timestamps = vec![[0, 100]]; // only 1 timestamp
        let sentences = split_sentences_with_timestamps(text, &timestamps, 0.0).unwrap();
        assert_eq!(sentences.len(), 1);
        assert_eq!(sentences[0].text, "Hi");
    }

    #[test]
    fn large_token_timestamp_mismatch_fails() {
        let text = "one two three four five six seven eight nine ten \
                    eleven twelve thirteen fourteen fifteen sixteen seventeen \
                    eighteen nineteen twenty";
        let timestamps: Vec<[i64; 2]> = (0..15).map(|i| [i * 100, i * 100 + 90]).collect();
        let result = split_sentences_with_timestamps(text, &timestamps, 0.0);
        assert!(result.is_err());
    }
}
