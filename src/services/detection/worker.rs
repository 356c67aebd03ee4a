// Detector Worker Loop
// One long-lived task per detector: pop fragments in order, hand each to the detector,
// exit after the current item once cancelled, then run the detector's stop hook exactly once.

use crate::models::{DetectorKind, Fragment};
use crate::services::config_store::DetectionConfig;
use crate::services::emitter::EventEmitter;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ingestion_queue::{IngestionReceiver, Popped};

#[async_trait]
pub trait Detector: Send {
    fn kind(&self) -> DetectorKind;

    fn emitter(&self) -> &EventEmitter;

    /// Process one fragment. Classification failures are handled inside;
    /// an `Err` here is a loop fault (e.g. the sink rejected an event).
    async fn on_fragment(&mut self, fragment: Fragment) -> anyhow::Result<()>;

    /// Called once when the worker exits.
    async fn on_stop(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub fault_pause: Duration,
    pub backlog_warn_every: usize,
}

impl From<&DetectionConfig> for WorkerSettings {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            fault_pause: config.fault_pause(),
            backlog_warn_every: config.backlog_warn_every,
        }
    }
}

/// Tracks queue backlog and reports each time it crosses a new multiple of `every`.
#[derive(Debug, Clone)]
pub struct BacklogWatermark {
    every: usize,
    level: usize,
}

impl BacklogWatermark {
    /// `every == 0` disables reporting.
    pub fn new(every: usize) -> Self {
        Self { every, level: 0 }
    }

    /// Whether `pending` reached a higher multiple than last observed. Falling back
    /// below a multiple re-arms it.
    pub fn observe(&mut self, pending: usize) -> bool {
        if self.every == 0 {
            return false;
        }
        let level = pending / self.every;
        let crossed = level > self.level;
        self.level = level;
        crossed
    }
}

pub async fn detector_loop<D: Detector>(
    mut detector: D,
    mut queue: IngestionReceiver,
    cancel_token: CancellationToken,
    settings: WorkerSettings,
) -> D {
    let kind = detector.kind().as_str();
    let mut backlog = BacklogWatermark::new(settings.backlog_warn_every);
    info!("[WORKER] {} detector started", kind);

    loop {
        // Cancellation is only observed between items; an in-flight oracle call always completes.
        let popped = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("[WORKER] {} detector shutting down", kind);
                break;
            }
            popped = queue.pop(settings.poll_interval) => popped,
        };

        let fragment = match popped {
            Popped::Fragment(fragment) => fragment,
            Popped::Empty => continue,
            Popped::Closed => {
                info!("[WORKER] {} queue closed, exiting", kind);
                break;
            }
        };

        let pending = queue.pending();
        if backlog.observe(pending) {
            warn!(
                "[WORKER] {} backlog at {} fragments; detector is falling behind the producer",
                kind, pending
            );
        }

        debug!("[WORKER] {} processing seq={} at {}", kind, fragment.seq, fragment.timestamp);
        if let Err(err) = detector.on_fragment(fragment).await {
            error!("[WORKER] {} loop fault: {:#}", kind, err);
            detector
                .emitter()
                .error(format!("Error in {} topic detection worker: {}", kind, err));
            tokio::select! {
                _ = cancel_token.cancelled() => {}
                _ = tokio::time::sleep(settings.fault_pause) => {}
            }
        }
    }

    if let Err(err) = detector.on_stop().await {
        error!("[WORKER] {} stop hook failed: {:#}", kind, err);
    }
    info!("[WORKER] {} detector stopped", kind);
    detector
}
