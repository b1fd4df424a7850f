//! Gateway runtime: event fan-out, scope and credential defenses, the
//! execution pipeline, the agent driver, and the scheduler.

pub mod agent;
pub mod bus;
pub mod events;
pub mod pipeline;
pub mod redact;
pub mod schedule_runner;
pub mod schedules;
pub mod scope;
