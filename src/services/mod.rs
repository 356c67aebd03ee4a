// LiveTopics Core Services

pub mod config_store;
pub mod providers;
pub mod oracle;
pub mod emitter;
pub mod detection;
pub mod session;
pub mod transcript;

pub use config_store::*;
pub use providers::*;
pub use emitter::{ChannelSink, EmitError, EventEmitter, EventSink, JsonLinesSink};
pub use oracle::{LlmOracle, OracleError, RetryPolicy, RetryingOracle, TopicOracle};
pub use session::TopicSession;
pub use transcript::{format_timestamp, parse_transcript, TranscriptLine};

// Re-export detection types
pub use detection::{
    FineGrainedDetector,
    MajorTopicSegmenter,
    PreviousSegmentSummary,
    SegmentState,
};
