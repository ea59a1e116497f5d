pub mod batch;
pub mod queue;

pub use batch::{BatchProcessor, BatchResult, LearningSignals, ProcessingStats, ProcessorConfig};
pub use queue::{
    process_pending, spawn_worker, EnqueueOutcome, ProcessingJob, ProcessingQueue, QueueSnapshot,
};
