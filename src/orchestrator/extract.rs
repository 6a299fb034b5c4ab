//! Marker-delimited sub-fields in free-form AI output.
//!
//! Pure functions only. A missing or unterminated marker is never an error:
//! extraction yields `None` and the caller decides whether to log it.

use super::config::{MarkerPair, MarkerSet};

/// Content of the last `open ... close` block, trimmed.
pub fn extract_block(text: &str, marker: &MarkerPair) -> Option<String> {
    let start = text.rfind(marker.open.as_str())? + marker.open.len();
    let end = text[start..].find(marker.close.as_str())? + start;
    Some(text[start..end].trim().to_string())
}

pub fn contains_marker(text: &str, marker: &MarkerPair) -> bool {
    text.contains(marker.open.as_str())
}

/// Removes every recognised block, close marker included. An unterminated
/// open marker is dropped on its own. Line breaks survive so utterance
/// splitting still sees them; blank lines do not.
pub fn strip_blocks(text: &str, markers: &[&MarkerPair]) -> String {
    let mut remaining = text.to_string();
    for marker in markers {
        let mut stripped = String::with_capacity(remaining.len());
        let mut rest = remaining.as_str();
        while let Some(open_at) = rest.find(marker.open.as_str()) {
            stripped.push_str(&rest[..open_at]);
            let after_open = &rest[open_at + marker.open.len()..];
            rest = match after_open.find(marker.close.as_str()) {
                Some(close_at) => &after_open[close_at + marker.close.len()..],
                None => after_open,
            };
        }
        stripped.push_str(rest);
        remaining = stripped;
    }
    remaining
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Text with every marker block removed; what the examiner says aloud.
    pub spoken: String,
    pub task_card: Option<String>,
    pub hand_off: Option<String>,
    pub feedback: Option<String>,
    pub closing_signal: bool,
}

pub fn parse_response(text: &str, markers: &MarkerSet) -> ParsedResponse {
    ParsedResponse {
        spoken: strip_blocks(text, &markers.all()),
        task_card: extract_block(text, &markers.task_card),
        hand_off: extract_block(text, &markers.hand_off),
        feedback: extract_block(text, &markers.feedback),
        closing_signal: contains_marker(text, &markers.closing_signal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_last_complete_block() {
        let marker = MarkerPair::tag("task_card");
        let text = "draft [task_card]old[/task_card] final [task_card]\n Describe a city \n[/task_card]";
        assert_eq!(
            extract_block(text, &marker).as_deref(),
            Some("Describe a city")
        );
    }

    #[test]
    fn missing_or_unterminated_markers_yield_none() {
        let marker = MarkerPair::tag("feedback");
        assert_eq!(extract_block("no markers at all", &marker), None);
        assert_eq!(extract_block("[feedback] never closed", &marker), None);
        assert_eq!(extract_block("[/feedback] closed first", &marker), None);
    }

    #[test]
    fn spoken_text_drops_all_blocks() {
        let markers = MarkerSet::default();
        let text = "Thank you. [task_card]Talk about a book.[/task_card]\n\
                    [begin_word]You have one minute to prepare.[/begin_word]";
        let parsed = parse_response(text, &markers);

        assert_eq!(parsed.spoken, "Thank you.");
        assert_eq!(parsed.task_card.as_deref(), Some("Talk about a book."));
        assert_eq!(
            parsed.hand_off.as_deref(),
            Some("You have one minute to prepare.")
        );
        assert!(!parsed.closing_signal);
        assert_eq!(parsed.feedback, None);
    }

    #[test]
    fn closing_signal_is_detected_with_empty_body() {
        let parsed = parse_response(
            "That's all for part one. [last_turn_ends][/last_turn_ends]",
            &MarkerSet::default(),
        );
        assert!(parsed.closing_signal);
        assert_eq!(parsed.spoken, "That's all for part one.");
    }

    #[test]
    fn spoken_text_keeps_line_breaks_for_utterance_splitting() {
        let parsed = parse_response(
            "Good   morning\n[feedback]kept aside[/feedback]\nWhat is your name",
            &MarkerSet::default(),
        );
        assert_eq!(parsed.spoken, "Good morning\nWhat is your name");
        assert_eq!(
            crate::synthesis::split_utterances(&parsed.spoken),
            vec!["Good morning", "What is your name"]
        );
    }

    #[test]
    fn unterminated_marker_is_removed_from_speech() {
        let parsed = parse_response("Well done [feedback] good fluency", &MarkerSet::default());
        assert_eq!(parsed.spoken, "Well done good fluency");
        assert_eq!(parsed.feedback, None);
    }
}
