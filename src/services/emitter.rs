// Event Emitter
// Delivers structured topic events to a downstream sink and mirrors each one into the log.

use crate::models::{CommittedSegment, DetectorKind, Severity, TopicEvent};
use std::io::Write;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("event sink closed")]
    Closed,
    #[error("failed to write event: {0}")]
    Write(String),
}

/// Downstream consumer of topic events (UI push layer, file, test harness).
pub trait EventSink: Send + Sync {
    fn send(&self, event: TopicEvent) -> Result<(), EmitError>;
}

/// Forwards events into an unbounded tokio channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TopicEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<TopicEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TopicEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: TopicEvent) -> Result<(), EmitError> {
        self.tx.send(event).map_err(|_| EmitError::Closed)
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn send(&self, event: TopicEvent) -> Result<(), EmitError> {
        let line = serde_json::to_string(&event).map_err(|e| EmitError::Write(e.to_string()))?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| EmitError::Write("writer lock poisoned".to_string()))?;
        writeln!(writer, "{}", line).map_err(|e| EmitError::Write(e.to_string()))?;
        writer.flush().map_err(|e| EmitError::Write(e.to_string()))
    }
}

/// Per-detector handle onto the shared sink.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    source: DetectorKind,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>, source: DetectorKind) -> Self {
        Self { sink, source }
    }

    pub fn source(&self) -> DetectorKind {
        self.source
    }

    pub fn topic_change(&self, timestamp: &str, topic: &str) -> Result<(), EmitError> {
        info!("[EMITTER] topic_change at {}: {}", timestamp, topic);
        self.sink.send(TopicEvent::TopicChange {
            timestamp: timestamp.to_string(),
            topic: topic.to_string(),
        })
    }

    pub fn major_topic_change(&self, segment: &CommittedSegment) -> Result<(), EmitError> {
        info!(
            "[EMITTER] major_topic_change {}: {}",
            segment.interval(),
            segment.label
        );
        self.sink.send(TopicEvent::from(segment))
    }

    /// Diagnostics are best effort: a rejected diagnostic is logged, never propagated.
    pub fn diagnostic(&self, message: impl Into<String>, severity: Severity) {
        let message = message.into();
        match severity {
            Severity::Error => error!(source = self.source.as_str(), "{}", message),
            Severity::Warning => warn!(source = self.source.as_str(), "{}", message),
            Severity::Info | Severity::Success => {
                info!(source = self.source.as_str(), "{}", message)
            }
        }
        if let Err(e) = self.sink.send(TopicEvent::Diagnostic {
            source: self.source,
            message,
            severity,
        }) {
            debug!("[EMITTER] diagnostic dropped: {}", e);
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.diagnostic(message, Severity::Info);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.diagnostic(message, Severity::Success);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.diagnostic(message, Severity::Warning);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.diagnostic(message, Severity::Error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::channel();
        let emitter = EventEmitter::new(Arc::new(sink), DetectorKind::FineGrained);

        emitter.topic_change("00:00:20", "Intro").unwrap();
        emitter.info("analyzing");

        assert_eq!(
            rx.try_recv().unwrap(),
            TopicEvent::TopicChange {
                timestamp: "00:00:20".to_string(),
                topic: "Intro".to_string()
            }
        );
        match rx.try_recv().unwrap() {
            TopicEvent::Diagnostic { source, severity, .. } => {
                assert_eq!(source, DetectorKind::FineGrained);
                assert_eq!(severity, Severity::Info);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_closed_channel_reports_error() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);
        let emitter = EventEmitter::new(Arc::new(sink), DetectorKind::Major);
        let segment = CommittedSegment {
            start_timestamp: "0".to_string(),
            end_timestamp: "65".to_string(),
            label: "Intro".to_string(),
        };
        assert!(matches!(emitter.major_topic_change(&segment), Err(EmitError::Closed)));
        // Diagnostics swallow the failure
        emitter.error("still fine");
    }

    #[test]
    fn test_json_lines_sink() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.send(TopicEvent::MajorTopicChange {
            interval: "65-90".to_string(),
            topic: "BTC Analysis".to_string(),
        })
        .unwrap();
        let written = String::from_utf8(sink.writer.into_inner().unwrap()).unwrap();
        assert_eq!(
            written,
            "{\"event\":\"major_topic_change\",\"interval\":\"65-90\",\"topic\":\"BTC Analysis\"}\n"
        );
    }
}
