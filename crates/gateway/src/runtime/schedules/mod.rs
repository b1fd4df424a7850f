//! Scheduled tool runs: data model, persistent store, and cron evaluation.

pub mod cron;
pub mod model;
pub mod store;

pub use cron::{cron_next_tz, parse_tz, validate_cron};
pub use model::{JobStatus, ScheduleType, ScheduledJob};
pub use store::JobStore;
