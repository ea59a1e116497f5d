pub mod ai;
pub mod api;
pub mod application;
pub mod config;
pub mod jobs;
pub mod learning;
pub mod mail;
pub mod monitoring;
pub mod notifications;
pub mod processing;
pub mod providers;
pub mod storage;
pub mod sync;

pub use config::Config;

// Re-export domain types for convenience
pub use mail::{
    Account, IncomingMessage, IndexedMessage, LearningRun, NotificationRecord, ProviderKind,
    Result, SyncCursor, SyncError,
};

// Re-export the service objects
pub use jobs::{JobKind, JobRunner};
pub use learning::{LearningReport, LearningScheduler};
pub use notifications::{MilestoneGate, NotificationSink};
pub use processing::{BatchProcessor, ProcessingQueue};
pub use providers::{ProviderAdapter, ProviderRegistry};
pub use storage::{InMemoryStore, MailStore, PgMailStore};
pub use sync::{DedupEngine, SyncOrchestrator, SyncReport};
