// Topic Session
// Owns both detector workers for one transcription stream.
// start(sink) spawns a fine-grained worker and a major-topic worker, each behind its own
// ingestion queue; submit() fans a fragment out to both; stop() cancels, awaits both workers
// and thereby performs the segmenter's final flush.

use crate::models::{DetectorKind, Fragment};
use crate::services::config_store::DetectionConfig;
use crate::services::detection::{
    detector_loop, FineGrainedDetector, IngestionQueue, MajorTopicSegmenter, WorkerSettings,
};
use crate::services::emitter::{EventEmitter, EventSink};
use crate::services::oracle::TopicOracle;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

struct RunningSession {
    session_id: Uuid,
    cancel_token: CancellationToken,
    next_seq: AtomicU64,
    fine_queue: IngestionQueue,
    major_queue: IngestionQueue,
    fine_handle: JoinHandle<FineGrainedDetector>,
    major_handle: JoinHandle<MajorTopicSegmenter>,
}

pub struct TopicSession {
    config: DetectionConfig,
    oracle: Arc<dyn TopicOracle>,
    running: Option<RunningSession>,
}

impl TopicSession {
    pub fn new(config: DetectionConfig, oracle: Arc<dyn TopicOracle>) -> Self {
        Self {
            config,
            oracle,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.running.as_ref().map(|r| r.session_id)
    }

    /// Spawn both workers with fresh detector state. A running session is fully stopped first.
    pub async fn start(&mut self, sink: Arc<dyn EventSink>) -> Result<Uuid> {
        if self.running.is_some() {
            info!("[SESSION] start requested while running, stopping previous session");
            self.stop().await?;
        }

        let session_id = Uuid::new_v4();
        let span = tracing::info_span!("session", id = %session_id);
        let cancel_token = CancellationToken::new();
        let settings = WorkerSettings::from(&self.config);

        let (fine_queue, fine_rx) = IngestionQueue::new();
        let (major_queue, major_rx) = IngestionQueue::new();

        let fine = FineGrainedDetector::new(
            self.oracle.clone(),
            EventEmitter::new(sink.clone(), DetectorKind::FineGrained),
        );
        let major = MajorTopicSegmenter::new(
            self.oracle.clone(),
            EventEmitter::new(sink, DetectorKind::Major),
            self.config.clone(),
        );

        let fine_handle = tokio::spawn(
            detector_loop(fine, fine_rx, cancel_token.clone(), settings.clone())
                .instrument(span.clone()),
        );
        let major_handle = tokio::spawn(
            detector_loop(major, major_rx, cancel_token.clone(), settings)
                .instrument(span.clone()),
        );

        span.in_scope(|| info!("[SESSION] started"));
        self.running = Some(RunningSession {
            session_id,
            cancel_token,
            next_seq: AtomicU64::new(0),
            fine_queue,
            major_queue,
            fine_handle,
            major_handle,
        });
        Ok(session_id)
    }

    /// Fire-and-forget. Fragments submitted while no session is running are dropped.
    pub fn submit(&self, timestamp: impl Into<String>, text: impl Into<String>) {
        let Some(running) = &self.running else {
            debug!("[SESSION] no running session, dropping fragment");
            return;
        };
        let seq = running.next_seq.fetch_add(1, Ordering::SeqCst);
        let fragment = Fragment::new(seq, timestamp, text);
        running.fine_queue.push(fragment.clone());
        running.major_queue.push(fragment);
    }

    /// Fragments submitted but not yet picked up, summed over both workers.
    pub fn pending(&self) -> usize {
        self.running
            .as_ref()
            .map(|r| r.fine_queue.pending() + r.major_queue.pending())
            .unwrap_or(0)
    }

    /// Wait until both workers have picked up every submitted fragment.
    pub async fn wait_idle(&self, poll: Duration) {
        while self.pending() > 0 {
            tokio::time::sleep(poll).await;
        }
    }

    /// Cancel both workers and wait for them to exit; the segmenter flushes on the way out.
    /// Fragments still queued are dropped. Idempotent.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            debug!("[SESSION] stop with no running session");
            return Ok(());
        };

        let dropped = running.fine_queue.pending() + running.major_queue.pending();
        if dropped > 0 {
            warn!(
                "[SESSION] {} stopping with {} unprocessed fragment(s)",
                running.session_id, dropped
            );
        }
        running.cancel_token.cancel();

        let fine = running
            .fine_handle
            .await
            .context("fine-grained worker failed to join");
        let major = running
            .major_handle
            .await
            .context("major topic worker failed to join");

        let fine = fine?;
        let major = major?;
        info!(
            "[SESSION] {} stopped (topic={:?}, major state={:?})",
            running.session_id,
            fine.current_topic(),
            major.state()
        );
        Ok(())
    }
}
