//! Scheduled job model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::cron::{cron_next_tz, parse_tz};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    Cron,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledJob {
    pub id: String,
    pub session_id: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub schedule_type: ScheduleType,
    /// Absolute instant for `once` jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    /// 5-field expression for `cron` jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
    /// IANA timezone the cron expression is evaluated in (default UTC).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub label: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Advisory: when the job is expected to fire next.
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    pub status: JobStatus,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl ScheduledJob {
    pub fn new(
        session_id: String,
        tool: String,
        parameters: Map<String, Value>,
        schedule_type: ScheduleType,
        run_at: Option<DateTime<Utc>>,
        cron_expr: Option<String>,
        timezone: Option<String>,
        label: String,
        created_by: Option<String>,
    ) -> Self {
        let mut job = Self {
            id: tal_sessions::short_id(),
            session_id,
            tool,
            parameters,
            schedule_type,
            run_at,
            cron_expr,
            timezone,
            label,
            created_at: Utc::now(),
            last_run: None,
            next_run: None,
            status: JobStatus::Scheduled,
            run_count: 0,
            created_by,
        };
        job.next_run = job.compute_next_run(&Utc::now());
        job
    }

    /// The next fire instant: `run_at` for one-shots, the next cron window
    /// otherwise.
    pub fn compute_next_run(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.schedule_type {
            ScheduleType::Once => self.run_at,
            ScheduleType::Cron => {
                let tz = parse_tz(self.timezone.as_deref().unwrap_or("UTC"));
                self.cron_expr
                    .as_deref()
                    .and_then(|expr| cron_next_tz(expr, after, tz))
            }
        }
    }

    /// Whether the job should fire at `now`. One-shots fire as soon as
    /// `run_at` has passed, including past-due jobs seen at startup.
    /// Recurring jobs that failed stay armed and retry on the next window.
    pub fn is_due(&self, now: &DateTime<Utc>) -> bool {
        let armed = match self.status {
            JobStatus::Scheduled => true,
            JobStatus::Failed => self.schedule_type == ScheduleType::Cron,
            _ => false,
        };
        if !armed {
            return false;
        }
        match self.schedule_type {
            ScheduleType::Once => self.run_at.map_or(false, |at| at <= *now),
            ScheduleType::Cron => self.next_run.map_or(false, |at| at <= *now),
        }
    }
}
