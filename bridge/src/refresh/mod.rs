//! Background resync and on-demand refresh.

pub mod scheduler;
pub mod service;

pub use scheduler::{ResyncScheduler, SchedulerConfig};
pub use service::{RefreshService, RefreshStats};
