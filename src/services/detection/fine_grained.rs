// Fine-Grained Topic Detector
// Classifies every fragment on its own against the current topic; no hysteresis.

use crate::models::{DetectorKind, Fragment};
use crate::services::emitter::EventEmitter;
use crate::services::oracle::TopicOracle;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::worker::Detector;

pub struct FineGrainedDetector {
    oracle: Arc<dyn TopicOracle>,
    emitter: EventEmitter,
    current_topic: Option<String>,
}

impl FineGrainedDetector {
    pub fn new(oracle: Arc<dyn TopicOracle>, emitter: EventEmitter) -> Self {
        Self {
            oracle,
            emitter,
            current_topic: None,
        }
    }

    pub fn current_topic(&self) -> Option<&str> {
        self.current_topic.as_deref()
    }
}

#[async_trait]
impl Detector for FineGrainedDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::FineGrained
    }

    fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    async fn on_fragment(&mut self, fragment: Fragment) -> anyhow::Result<()> {
        info!("[FINE_TOPIC] Analyzing transcription for topic change at {}", fragment.timestamp);

        let verdict = match self
            .oracle
            .classify(&fragment.text, self.current_topic.as_deref())
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                // Skip the fragment; state is untouched
                self.emitter.error(format!(
                    "Topic classification failed at {}: {}",
                    fragment.timestamp, e
                ));
                return Ok(());
            }
        };

        // The first classification always counts as a change
        let changed = self.current_topic.is_none() || verdict.changed;
        if !changed {
            info!("[FINE_TOPIC] No topic change detected at {}", fragment.timestamp);
            return Ok(());
        }

        self.emitter.success(format!(
            "Topic change detected: {} at {}",
            verdict.topic, fragment.timestamp
        ));
        self.current_topic = Some(verdict.topic.clone());
        self.emitter.topic_change(&fragment.timestamp, &verdict.topic)?;
        Ok(())
    }

    async fn on_stop(&mut self) -> anyhow::Result<()> {
        info!(
            "[FINE_TOPIC] stopped with topic {:?}",
            self.current_topic.as_deref().unwrap_or("<none>")
        );
        Ok(())
    }
}
