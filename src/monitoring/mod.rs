pub mod health;
pub mod metrics;

pub use health::{ComponentHealth, HealthChecker, HealthStatus, HealthThresholds, SystemHealth};
pub use metrics::SyncMetrics;
