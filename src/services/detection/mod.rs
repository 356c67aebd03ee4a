// Detection Module
// Topic detection core organized into specialized submodules:
// - ingestion_queue: Unbounded per-detector FIFO between the producer and a worker
// - worker: Long-lived detector loop with cooperative cancellation
// - fine_grained: Per-fragment topic classification, no hysteresis
// - major_segmenter: Dwell- and confidence-gated chapter segmentation with bounded memory

pub mod ingestion_queue;
pub mod worker;
pub mod fine_grained;
pub mod major_segmenter;

pub use ingestion_queue::{IngestionQueue, IngestionReceiver, Popped};
pub use worker::{detector_loop, BacklogWatermark, Detector, WorkerSettings};
pub use fine_grained::FineGrainedDetector;
pub use major_segmenter::{
    compact_buffer,
    MajorTopicSegmenter,
    OpenSegment,
    PreviousSegmentSummary,
    SegmentState,
};
