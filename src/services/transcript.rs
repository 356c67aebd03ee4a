// Transcript Reader
// Turns a saved transcript into timestamped fragments for replay.
// Lines are either "<timestamp> <text>" or bare text; bare lines are stamped at a fixed chunk spacing.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptLine {
    pub timestamp: String,
    pub text: String,
}

/// `HH:MM:SS`, hours not wrapped (e.g. 100:00:00).
pub fn format_timestamp(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}

fn clock_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // "00:01:20", "1:20", "1:02:03.5", "[65]", "[00:01:10]"
    RE.get_or_init(|| {
        Regex::new(r"^(?:\[(\d+(?:\.\d+)?|\d{1,3}(?::\d{2}){1,2}(?:\.\d+)?)\]|(\d{1,3}(?::\d{2}){1,2}(?:\.\d+)?))$")
            .unwrap()
    })
}

fn seconds_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+(?:\.\d+)?$").unwrap())
}

/// Split a leading timestamp token off `line`, if there is one followed by text.
/// Plain numbers ("65") only count when `allow_seconds` is set.
fn split_timestamp(line: &str, allow_seconds: bool) -> Option<(String, String)> {
    let (head, rest) = line.split_once(char::is_whitespace)?;
    let text = rest.trim();
    if text.is_empty() {
        return None;
    }
    let timestamp = match clock_re().captures(head) {
        Some(caps) => caps.get(1).or_else(|| caps.get(2))?.as_str().to_string(),
        None if allow_seconds && seconds_re().is_match(head) => head.to_string(),
        None => return None,
    };
    Some((timestamp, text.to_string()))
}

/// Parse transcript content. Blank lines are skipped; bare text lines are stamped
/// `0, chunk_secs, 2*chunk_secs, ...` in `HH:MM:SS`. A leading plain number is read as
/// a timestamp only when every line starts with one, so prose like "2024 was..." stays text.
pub fn parse_transcript(content: &str, chunk_secs: u64) -> Vec<TranscriptLine> {
    let lines: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let allow_seconds = lines.iter().all(|line| split_timestamp(line, true).is_some());

    let mut elapsed = 0u64;
    lines
        .into_iter()
        .map(|line| match split_timestamp(line, allow_seconds) {
            Some((timestamp, text)) => TranscriptLine { timestamp, text },
            None => {
                let timestamp = format_timestamp(elapsed);
                elapsed += chunk_secs;
                TranscriptLine {
                    timestamp,
                    text: line.to_string(),
                }
            }
        })
        .collect()
}
