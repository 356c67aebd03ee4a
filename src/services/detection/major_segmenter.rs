// Major Topic Segmenter
// Chapter-level segmentation as a dwell- and confidence-gated state machine:
//   NoSegment --(initial_fragments buffered, detect_initial)--> Open
//   Open --(dwell >= min_dwell, is_change && confidence >= threshold)--> commit, Open
//   any --(stop)--> Flushed (terminal; an open segment is emitted exactly once)
// Memory is bounded: the open buffer is compacted to head + most recent context, and the
// previous-segment summary is capped to a character budget.

use crate::models::{combined_text, CommittedSegment, DetectorKind, Fragment, SUMMARY_TIMESTAMP};
use crate::services::config_store::DetectionConfig;
use crate::services::emitter::{EmitError, EventEmitter};
use crate::services::oracle::TopicOracle;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::worker::Detector;

#[derive(Debug, Clone, PartialEq)]
pub struct OpenSegment {
    pub label: String,
    pub start_timestamp: String,
    /// Fragments with a greater `seq` count toward dwell.
    pub last_transition_seq: u64,
    pub last_transition_timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentState {
    NoSegment,
    Open(OpenSegment),
    Flushed,
}

/// Context carried forward from the last committed segment; replaced wholesale on each commit.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviousSegmentSummary {
    fragments: Vec<Fragment>,
}

impl PreviousSegmentSummary {
    /// Keep the fragments as-is while their combined text fits `max_prev_len` characters,
    /// otherwise collapse to `[first, synthetic, last]` where the synthetic fragment holds
    /// the first `max_prev_len` characters.
    pub fn compact(fragments: Vec<Fragment>, max_prev_len: usize) -> Self {
        let text = combined_text(&fragments);
        if fragments.is_empty() || text.chars().count() <= max_prev_len {
            return Self { fragments };
        }

        let first = fragments[0].clone();
        let last = fragments[fragments.len() - 1].clone();
        let synthetic = Fragment {
            timestamp: SUMMARY_TIMESTAMP.to_string(),
            text: text.chars().take(max_prev_len).collect(),
            seq: first.seq,
        };
        Self {
            fragments: vec![first, synthetic, last],
        }
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn text(&self) -> String {
        combined_text(&self.fragments)
    }
}

/// Replace an over-long buffer with its head plus the `keep_recent` newest fragments.
/// Returns whether anything was dropped.
pub fn compact_buffer(buffer: &mut Vec<Fragment>, max_current: usize, keep_recent: usize) -> bool {
    if buffer.len() <= max_current || buffer.is_empty() {
        return false;
    }
    let keep = keep_recent.min(buffer.len() - 1);
    let tail_start = buffer.len() - keep;
    buffer.drain(1..tail_start);
    true
}

pub struct MajorTopicSegmenter {
    oracle: Arc<dyn TopicOracle>,
    emitter: EventEmitter,
    config: DetectionConfig,
    state: SegmentState,
    buffer: Vec<Fragment>,
    previous: Option<PreviousSegmentSummary>,
}

impl MajorTopicSegmenter {
    pub fn new(oracle: Arc<dyn TopicOracle>, emitter: EventEmitter, config: DetectionConfig) -> Self {
        Self {
            oracle,
            emitter,
            config,
            state: SegmentState::NoSegment,
            buffer: Vec::new(),
            previous: None,
        }
    }

    pub fn state(&self) -> &SegmentState {
        &self.state
    }

    pub fn label(&self) -> Option<&str> {
        match &self.state {
            SegmentState::Open(open) => Some(open.label.as_str()),
            _ => None,
        }
    }

    pub fn start_timestamp(&self) -> Option<&str> {
        match &self.state {
            SegmentState::Open(open) => Some(open.start_timestamp.as_str()),
            _ => None,
        }
    }

    pub fn buffer(&self) -> &[Fragment] {
        &self.buffer
    }

    pub fn previous_summary(&self) -> Option<&PreviousSegmentSummary> {
        self.previous.as_ref()
    }

    /// Feed one fragment through the state machine.
    pub async fn process(&mut self, fragment: Fragment) -> Result<(), EmitError> {
        match self.state {
            SegmentState::Flushed => {
                debug!("[MAJOR_TOPIC] ignoring {} after flush", fragment.timestamp);
                Ok(())
            }
            SegmentState::NoSegment => {
                self.open_initial(fragment).await;
                Ok(())
            }
            SegmentState::Open(_) => self.extend_open(fragment).await,
        }
    }

    /// Close out on stop. Emits the open segment at most once, then the segmenter is terminal.
    pub fn flush(&mut self) -> Result<Option<CommittedSegment>, EmitError> {
        let state = std::mem::replace(&mut self.state, SegmentState::Flushed);
        let buffer = std::mem::take(&mut self.buffer);

        let SegmentState::Open(open) = state else {
            debug!("[MAJOR_TOPIC] flush with no open segment");
            return Ok(None);
        };
        let Some(last) = buffer.last() else {
            return Ok(None);
        };

        let segment = CommittedSegment {
            start_timestamp: open.start_timestamp,
            end_timestamp: last.timestamp.clone(),
            label: open.label,
        };
        info!(
            "[MAJOR_TOPIC] final segment {} ({})",
            segment.interval(),
            segment.label
        );
        self.emitter.major_topic_change(&segment)?;
        Ok(Some(segment))
    }

    fn append(&mut self, fragment: Fragment) {
        self.buffer.push(fragment);
        let before = self.buffer.len();
        if compact_buffer(&mut self.buffer, self.config.max_current, self.config.keep_recent) {
            debug!(
                "[MAJOR_TOPIC] compacted buffer {} -> {} fragments",
                before,
                self.buffer.len()
            );
        }
    }

    async fn open_initial(&mut self, fragment: Fragment) {
        self.append(fragment);
        if self.buffer.len() < self.config.initial_fragments.max(1) {
            debug!(
                "[MAJOR_TOPIC] waiting for more fragments ({}/{})",
                self.buffer.len(),
                self.config.initial_fragments
            );
            return;
        }

        let text = combined_text(&self.buffer);
        let label = match self.oracle.detect_initial(&text).await {
            Ok(label) => label,
            Err(e) => {
                self.emitter
                    .error(format!("Initial major topic detection failed: {}", e));
                return;
            }
        };

        let (Some(first), Some(last)) = (self.buffer.first(), self.buffer.last()) else {
            return;
        };
        let open = OpenSegment {
            label,
            start_timestamp: first.timestamp.clone(),
            last_transition_seq: last.seq,
            last_transition_timestamp: last.timestamp.clone(),
        };
        info!(
            "[MAJOR_TOPIC] opened first segment '{}' at {}",
            open.label, open.start_timestamp
        );
        self.state = SegmentState::Open(open);
    }

    async fn extend_open(&mut self, fragment: Fragment) -> Result<(), EmitError> {
        let (current_label, last_transition_seq) = match &self.state {
            SegmentState::Open(open) => (open.label.clone(), open.last_transition_seq),
            _ => return Ok(()),
        };

        self.append(fragment.clone());

        let dwell = self
            .buffer
            .iter()
            .filter(|f| f.seq > last_transition_seq)
            .count();
        if dwell < self.config.min_dwell {
            debug!(
                "[MAJOR_TOPIC] dwell {}/{} at {}, holding",
                dwell, self.config.min_dwell, fragment.timestamp
            );
            return Ok(());
        }

        let text = combined_text(&self.buffer);
        let summary = self.previous.as_ref().map(PreviousSegmentSummary::text);
        let verdict = match self
            .oracle
            .detect_change(&text, &current_label, summary.as_deref())
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                // Hold state; the fragment stays buffered for the next cycle
                self.emitter.error(format!(
                    "Major topic detection failed at {}: {}",
                    fragment.timestamp, e
                ));
                return Ok(());
            }
        };

        if verdict.is_change && verdict.confidence >= self.config.confidence_threshold {
            return self.commit(fragment, verdict.label);
        }

        if verdict.is_change {
            self.emitter.warning(format!(
                "Discarded major topic change to '{}' at {}: confidence {:.2} below {:.2}",
                verdict.label, fragment.timestamp, verdict.confidence, self.config.confidence_threshold
            ));
        } else {
            debug!(
                "[MAJOR_TOPIC] no change at {} (confidence {:.2})",
                fragment.timestamp, verdict.confidence
            );
        }
        Ok(())
    }

    fn commit(&mut self, fragment: Fragment, new_label: String) -> Result<(), EmitError> {
        let SegmentState::Open(open) = &mut self.state else {
            return Ok(());
        };

        let segment = CommittedSegment {
            start_timestamp: open.start_timestamp.clone(),
            end_timestamp: fragment.timestamp.clone(),
            label: open.label.clone(),
        };
        *open = OpenSegment {
            label: new_label,
            start_timestamp: fragment.timestamp.clone(),
            last_transition_seq: fragment.seq,
            last_transition_timestamp: fragment.timestamp.clone(),
        };

        let closed = std::mem::replace(&mut self.buffer, vec![fragment]);
        self.previous = Some(PreviousSegmentSummary::compact(
            closed,
            self.config.max_prev_len,
        ));

        self.emitter.success(format!(
            "Major topic detected: {} for interval {}",
            segment.label,
            segment.interval()
        ));
        self.emitter.major_topic_change(&segment)
    }
}

#[async_trait]
impl Detector for MajorTopicSegmenter {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Major
    }

    fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    async fn on_fragment(&mut self, fragment: Fragment) -> anyhow::Result<()> {
        self.process(fragment).await?;
        Ok(())
    }

    async fn on_stop(&mut self) -> anyhow::Result<()> {
        self.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Severity, TopicEvent};
    use crate::services::emitter::ChannelSink;
    use crate::services::oracle::testing::ScriptedOracle;
    use std::collections::HashMap;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        oracle: Arc<ScriptedOracle>,
        segmenter: MajorTopicSegmenter,
        events: UnboundedReceiver<TopicEvent>,
        next_seq: u64,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(DetectionConfig::default())
        }

        fn with_config(config: DetectionConfig) -> Self {
            let oracle = Arc::new(ScriptedOracle::new());
            let (sink, events) = ChannelSink::channel();
            let emitter = EventEmitter::new(Arc::new(sink), DetectorKind::Major);
            let segmenter = MajorTopicSegmenter::new(oracle.clone(), emitter, config);
            Self {
                oracle,
                segmenter,
                events,
                next_seq: 0,
            }
        }

        async fn feed(&mut self, timestamp: &str, text: &str) {
            let fragment = Fragment::new(self.next_seq, timestamp, text);
            self.next_seq += 1;
            self.segmenter.process(fragment).await.unwrap();
        }

        fn drain(&mut self) -> Vec<TopicEvent> {
            let mut out = Vec::new();
            while let Ok(e) = self.events.try_recv() {
                out.push(e);
            }
            out
        }

        /// t=0, t=5 open "Intro".
        async fn open_intro(&mut self) {
            self.oracle.push_initial("Intro");
            self.feed("0", "intro").await;
            self.feed("5", "intro2").await;
        }

        /// Intro through t=60, then commit "BTC Analysis" at t=65.
        async fn commit_btc_after_intro(&mut self) {
            self.open_intro().await;
            for t in (10..=60).step_by(5) {
                self.feed(&t.to_string(), "still intro").await;
            }
            self.oracle.push_change("BTC Analysis", true, 0.8);
            self.feed("65", "bitcoin chart").await;
        }
    }

    fn majors(events: &[TopicEvent]) -> Vec<(String, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                TopicEvent::MajorTopicChange { interval, topic } => {
                    Some((interval.clone(), topic.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn fragments(n: usize) -> Vec<Fragment> {
        (0..n)
            .map(|i| Fragment::new(i as u64, format!("{}", i * 5), format!("f{}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_opens_first_segment_without_emission() {
        let mut h = Harness::new();
        h.oracle.push_initial("Intro");

        h.feed("0", "intro").await;
        assert_eq!(h.segmenter.state(), &SegmentState::NoSegment);
        assert_eq!(h.oracle.calls_of("detect_initial"), 0);

        h.feed("5", "intro2").await;
        assert_eq!(h.segmenter.label(), Some("Intro"));
        assert_eq!(h.segmenter.start_timestamp(), Some("0"));
        match h.segmenter.state() {
            SegmentState::Open(open) => assert_eq!(open.last_transition_timestamp, "5"),
            other => panic!("expected open segment, got {other:?}"),
        }
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn test_no_change_keeps_growing() {
        let mut h = Harness::new();
        h.open_intro().await;

        for t in (10..=60).step_by(5) {
            h.feed(&t.to_string(), "still intro").await;
        }

        assert!(majors(&h.drain()).is_empty());
        assert_eq!(h.segmenter.buffer().len(), 13);
        assert_eq!(h.segmenter.label(), Some("Intro"));
        // t=10 only reaches dwell 1; every later fragment is classified
        assert_eq!(h.oracle.calls_of("detect_change"), 10);
    }

    #[tokio::test]
    async fn test_commit_closes_and_reopens() {
        let mut h = Harness::new();
        h.commit_btc_after_intro().await;

        assert_eq!(
            majors(&h.drain()),
            vec![("0-65".to_string(), "Intro".to_string())]
        );
        assert_eq!(h.segmenter.label(), Some("BTC Analysis"));
        assert_eq!(h.segmenter.start_timestamp(), Some("65"));
        assert_eq!(h.segmenter.buffer().len(), 1);
        assert_eq!(h.segmenter.buffer()[0].timestamp, "65");

        let summary = h.segmenter.previous_summary().unwrap();
        assert_eq!(summary.fragments().len(), 14);
        assert!(summary.text().starts_with("intro intro2"));
    }

    #[tokio::test]
    async fn test_low_confidence_is_discarded_visibly() {
        let mut h = Harness::new();
        h.open_intro().await;
        for t in (10..=60).step_by(5) {
            h.feed(&t.to_string(), "still intro").await;
        }
        h.drain();

        h.oracle.push_change("BTC Analysis", true, 0.5);
        h.feed("65", "bitcoin chart").await;

        let events = h.drain();
        assert!(majors(&events).is_empty());
        assert!(events.iter().any(|e| matches!(
            e,
            TopicEvent::Diagnostic { severity: Severity::Warning, message, .. }
                if message.contains("BTC Analysis")
        )));
        assert_eq!(h.segmenter.label(), Some("Intro"));
        assert_eq!(h.segmenter.start_timestamp(), Some("0"));
    }

    #[tokio::test]
    async fn test_final_flush_once() {
        let mut h = Harness::new();
        h.commit_btc_after_intro().await;
        for t in (70..=90).step_by(5) {
            h.feed(&t.to_string(), "more bitcoin").await;
        }
        h.drain();

        let flushed = h.segmenter.flush().unwrap().unwrap();
        assert_eq!(flushed.interval(), "65-90");
        assert_eq!(
            majors(&h.drain()),
            vec![("65-90".to_string(), "BTC Analysis".to_string())]
        );

        assert!(h.segmenter.flush().unwrap().is_none());
        assert!(h.drain().is_empty());
        assert_eq!(h.segmenter.state(), &SegmentState::Flushed);

        // Terminal: later fragments are ignored
        h.feed("95", "late").await;
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn test_flush_without_segment_emits_nothing() {
        let mut h = Harness::new();
        h.feed("0", "only one").await;
        assert!(h.segmenter.flush().unwrap().is_none());
        assert!(h.drain().is_empty());
        assert_eq!(h.segmenter.state(), &SegmentState::Flushed);
    }

    #[tokio::test]
    async fn test_detection_failure_holds_state() {
        let mut h = Harness::new();
        h.open_intro().await;
        h.feed("10", "a").await;
        h.drain();
        let before = h.segmenter.state().clone();

        h.oracle.push_change_failure();
        h.feed("15", "b").await;

        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            TopicEvent::Diagnostic { severity: Severity::Error, .. }
        ));
        assert_eq!(h.segmenter.state(), &before);
        assert_eq!(h.segmenter.buffer().last().unwrap().timestamp, "15");

        h.oracle.push_change("Q&A", true, 0.9);
        h.feed("20", "questions").await;
        assert_eq!(
            majors(&h.drain()),
            vec![("0-20".to_string(), "Intro".to_string())]
        );
    }

    #[tokio::test]
    async fn test_initial_failure_retries_with_larger_buffer() {
        let mut h = Harness::new();
        h.oracle.push_initial_failure().push_initial("Intro");

        h.feed("0", "a").await;
        h.feed("5", "b").await;
        assert_eq!(h.segmenter.state(), &SegmentState::NoSegment);
        assert_eq!(h.drain().len(), 1);

        h.feed("10", "c").await;
        assert_eq!(h.segmenter.label(), Some("Intro"));
        assert_eq!(h.segmenter.start_timestamp(), Some("0"));
        assert_eq!(h.oracle.calls_of("detect_initial"), 2);
    }

    #[tokio::test]
    async fn test_dwell_blocks_rapid_recommit() {
        let mut h = Harness::new();
        h.commit_btc_after_intro().await;
        h.drain();
        let calls_before = h.oracle.calls_of("detect_change");

        h.oracle.push_change("Altcoins", true, 0.99);
        h.feed("70", "eth").await;
        // dwell 1: not classified, the scripted verdict is still queued
        assert_eq!(h.oracle.calls_of("detect_change"), calls_before);
        assert!(majors(&h.drain()).is_empty());

        h.feed("75", "sol").await;
        assert_eq!(
            majors(&h.drain()),
            vec![("65-75".to_string(), "BTC Analysis".to_string())]
        );
        assert_eq!(h.segmenter.label(), Some("Altcoins"));
    }

    #[tokio::test]
    async fn test_buffer_stays_bounded() {
        let mut h = Harness::new();
        h.open_intro().await;

        for i in 0..250u64 {
            h.feed(&format!("{}", 10 + i * 5), "filler").await;
            assert!(h.segmenter.buffer().len() <= 100);
        }
        // Head fragment survives every compaction
        assert_eq!(h.segmenter.buffer()[0].timestamp, "0");
        assert_eq!(h.segmenter.start_timestamp(), Some("0"));
    }

    #[test]
    fn test_compact_buffer_keeps_head_and_recent() {
        let mut buffer = fragments(101);
        assert!(compact_buffer(&mut buffer, 100, 50));
        assert_eq!(buffer.len(), 51);
        assert_eq!(buffer[0].seq, 0);
        assert_eq!(buffer[1].seq, 51);
        assert_eq!(buffer[50].seq, 100);

        let mut small = fragments(100);
        assert!(!compact_buffer(&mut small, 100, 50));
        assert_eq!(small.len(), 100);
    }

    #[test]
    fn test_summary_compaction() {
        let mut long = fragments(3);
        long[1].text = "x".repeat(6000);
        let summary = PreviousSegmentSummary::compact(long, 5000);
        let kept = summary.fragments();
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].timestamp, "0");
        assert_eq!(kept[1].timestamp, SUMMARY_TIMESTAMP);
        assert_eq!(kept[1].text.chars().count(), 5000);
        assert!(kept[1].text.starts_with("f0 x"));
        assert_eq!(kept[2].timestamp, "10");

        let short = PreviousSegmentSummary::compact(fragments(4), 5000);
        assert_eq!(short.fragments().len(), 4);
    }

    #[tokio::test]
    async fn test_commit_invariants_over_mixed_stream() {
        let mut h = Harness::new();
        h.oracle.push_initial("Topic 0");

        // Deterministic pseudo-random verdicts
        let mut state: u64 = 0x2545F4914F6CDD1D;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        let mut verdicts = HashMap::new();
        for i in 0..400u64 {
            let r = next();
            let is_change = r % 3 == 0;
            let confidence = (r % 100) as f64 / 100.0;
            let label = format!("Topic {}", i + 1);
            h.oracle.push_change(&label, is_change, confidence);
            verdicts.insert(label, (is_change, confidence));
        }

        let total = 300u64;
        for i in 0..total {
            h.feed(&(i * 5).to_string(), "text").await;
        }
        h.segmenter.flush().unwrap();

        let segments = majors(&h.drain());

        // Every segment after the first was opened by a commit; its label names the verdict
        for (_, label) in segments.iter().skip(1) {
            let (is_change, confidence) = verdicts[label];
            assert!(is_change, "{label} committed without a change flag");
            assert!(confidence >= 0.65, "{label} committed at confidence {confidence}");
        }

        let intervals: Vec<(u64, u64)> = segments
            .iter()
            .map(|(interval, _)| {
                let (a, b) = interval.split_once('-').unwrap();
                (a.parse().unwrap(), b.parse().unwrap())
            })
            .collect();
        assert!(intervals.len() > 1);

        for pair in intervals.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            assert!(next.0 > prev.0, "starts must strictly increase");
            assert!(next.0 >= prev.1, "intervals must not overlap");
            // At least min_dwell fragments (5s apart) between boundaries
            assert!(next.0 - prev.0 >= 2 * 5);
        }
    }

    #[tokio::test]
    async fn test_confidence_at_threshold_commits() {
        let mut h = Harness::new();
        h.open_intro().await;
        h.feed("10", "a").await;

        h.oracle.push_change("Q&A", true, 0.65);
        h.feed("15", "questions").await;

        assert_eq!(
            majors(&h.drain()),
            vec![("0-15".to_string(), "Intro".to_string())]
        );
        assert_eq!(h.segmenter.label(), Some("Q&A"));
    }

    #[tokio::test]
    async fn test_low_confidence_never_commits() {
        let mut h = Harness::new();
        h.open_intro().await;
        for i in 0..50u64 {
            h.oracle.push_change("Elsewhere", true, 0.64);
            h.feed(&format!("{}", 10 + i * 5), "text").await;
        }
        assert!(majors(&h.drain()).is_empty());
        assert_eq!(h.segmenter.label(), Some("Intro"));
    }
}
