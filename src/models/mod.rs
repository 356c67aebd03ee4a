// LiveTopics Data Models
// Fragments flowing in from the transcriber, oracle verdicts, and events flowing out to the sink

use serde::{Deserialize, Serialize};

/// Timestamp used for the synthetic fragment produced by summary compaction.
pub const SUMMARY_TIMESTAMP: &str = "summary";

// ============ Inbound ============

/// One timestamped unit of transcribed text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Display timestamp, kept exactly as received from the producer.
    pub timestamp: String,
    pub text: String,
    /// Submission order within a session. This is the ordering and dwell key;
    /// timestamps are never compared.
    #[serde(default)]
    pub seq: u64,
}

impl Fragment {
    pub fn new(seq: u64, timestamp: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            text: text.into(),
            seq,
        }
    }
}

/// Join fragment texts with single spaces, in buffer order.
pub fn combined_text(fragments: &[Fragment]) -> String {
    fragments
        .iter()
        .map(|f| f.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

// ============ Oracle Verdicts ============

/// Fine-grained classification of a single fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicVerdict {
    pub topic: String,
    pub changed: bool,
}

/// Major-topic change proposal for the open segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeVerdict {
    pub label: String,
    pub is_change: bool,
    /// Clamped to `[0, 1]` by the oracle.
    pub confidence: f64,
}

// ============ Outbound ============

/// A closed major-topic interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedSegment {
    pub start_timestamp: String,
    pub end_timestamp: String,
    pub label: String,
}

impl CommittedSegment {
    /// `"<start>-<end>"` with both sides verbatim; no width is assumed.
    pub fn interval(&self) -> String {
        format!("{}-{}", self.start_timestamp, self.end_timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    FineGrained,
    Major,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::FineGrained => "fine_grained",
            DetectorKind::Major => "major",
        }
    }
}

/// Structured event delivered to the downstream sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TopicEvent {
    TopicChange {
        timestamp: String,
        topic: String,
    },
    MajorTopicChange {
        interval: String,
        topic: String,
    },
    Diagnostic {
        source: DetectorKind,
        message: String,
        severity: Severity,
    },
}

impl From<&CommittedSegment> for TopicEvent {
    fn from(segment: &CommittedSegment) -> Self {
        TopicEvent::MajorTopicChange {
            interval: segment.interval(),
            topic: segment.label.clone(),
        }
    }
}

impl TopicEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TopicEvent::TopicChange { .. } => "topic_change",
            TopicEvent::MajorTopicChange { .. } => "major_topic_change",
            TopicEvent::Diagnostic { .. } => "diagnostic",
        }
    }
}
