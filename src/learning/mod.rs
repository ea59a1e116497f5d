pub mod scheduler;

pub use scheduler::{
    LearningConfig, LearningReport, LearningScheduler, UserLearningOutcome, UserLearningStatus,
    NEVER_LEARNED_DAYS,
};
