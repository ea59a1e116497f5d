pub mod error;
pub mod models;

pub use error::{Result, SyncError};
pub use models::{
    Account, ContentCache, IncomingMessage, IndexedMessage, LearningRun, LearningRunStatus,
    MessageType, NewIndexedMessage, NotificationKind, NotificationRecord, Pattern, ProviderKind,
    SyncCursor, UserSummary,
};
