//! Examiner speech: sentence splitting and the sequential synthesis producer.

mod http;
mod queue;

pub use http::HttpSpeechSynthesizer;
pub use queue::{QueueStats, SpeechSink, SynthesisHandle, UtteranceSynthesisQueue};

use std::time::Duration;

use thiserror::Error;

use crate::audio::DecodeError;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("synthesis request timed out after {0:?}")]
    Timeout(Duration),
    #[error("synthesis request failed: {0:#}")]
    Request(anyhow::Error),
    #[error("synthesized audio could not be decoded: {0}")]
    Decode(#[from] DecodeError),
}

/// Splits one examiner text block into sentence-scale utterances.
///
/// Lines are split first, whitespace inside a line is collapsed, then each
/// line is cut after runs of sentence terminators. A `.` between two digits
/// is a decimal point, not a boundary. Fragments without any letter or digit
/// are dropped.
pub fn split_utterances(text: &str) -> Vec<String> {
    let mut utterances = Vec::new();
    for line in text.split(['\n', '\r']) {
        let normalized = line.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut rest = normalized.as_str();
        while let Some(boundary) = find_sentence_boundary(rest) {
            push_fragment(&mut utterances, &rest[..boundary]);
            rest = &rest[boundary..];
        }
        push_fragment(&mut utterances, rest);
    }
    utterances
}

fn find_sentence_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    let mut previous: Option<char> = None;
    while let Some((idx, ch)) = chars.next() {
        if !is_sentence_terminator(ch) {
            previous = Some(ch);
            continue;
        }

        let next = chars.peek().map(|&(_, next)| next);
        let decimal_point = ch == '.'
            && previous.map_or(false, |prev| prev.is_ascii_digit())
            && next.map_or(false, |next| next.is_ascii_digit());
        if decimal_point {
            previous = Some(ch);
            continue;
        }

        let mut boundary = idx + ch.len_utf8();
        while let Some(&(next_idx, next)) = chars.peek() {
            if !is_sentence_terminator(next) {
                break;
            }
            boundary = next_idx + next.len_utf8();
            chars.next();
        }
        return Some(boundary);
    }
    None
}

fn is_sentence_terminator(ch: char) -> bool {
    matches!(
        ch,
        '.' | '!' | '?' | '。' | '！' | '？' | '…' | ';' | '；'
    )
}

fn push_fragment(out: &mut Vec<String>, fragment: &str) {
    let trimmed = fragment.trim();
    if trimmed.chars().any(char::is_alphanumeric) {
        out.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminators_in_order() {
        assert_eq!(split_utterances("A. B. C."), vec!["A.", "B.", "C."]);
    }

    #[test]
    fn newlines_split_and_whitespace_collapses() {
        let text = "Good  morning,\tcandidate\n\nWhat is   your name?  Where do you live";
        assert_eq!(
            split_utterances(text),
            vec![
                "Good morning, candidate",
                "What is your name?",
                "Where do you live"
            ]
        );
    }

    #[test]
    fn terminator_runs_stay_with_their_sentence() {
        assert_eq!(
            split_utterances("Really?! Yes... Fine."),
            vec!["Really?!", "Yes...", "Fine."]
        );
    }

    #[test]
    fn decimals_are_not_boundaries() {
        assert_eq!(
            split_utterances("The score rose 3.5 points. Well done."),
            vec!["The score rose 3.5 points.", "Well done."]
        );
    }

    #[test]
    fn drops_empty_and_punctuation_only_fragments() {
        assert!(split_utterances("  \n ... \n !? ").is_empty());
        assert_eq!(split_utterances("你好。请坐！"), vec!["你好。", "请坐！"]);
    }
}
