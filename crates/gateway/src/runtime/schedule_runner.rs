//! Schedule runner — fires due jobs through the session pipeline.
//!
//! A fixed-interval tick evaluates due jobs. Firing a job is exactly an
//! operator-posted tool execution: same scope enforcement, same events,
//! same broadcasts. The job is marked `running` before its task spawns so
//! the next tick cannot double-fire it.

use chrono::Utc;
use serde_json::Value;

use tal_tools::{TaskStatus, BASH_TOOL};

use crate::runtime::pipeline::{self, RunRequest};
use crate::runtime::schedules::{JobStatus, ScheduleType, ScheduledJob};
use crate::state::AppState;

/// Evaluate due jobs and spawn a run for each.
pub async fn tick(state: &AppState) {
    for job in state.jobs.due_jobs() {
        let claimed = state
            .jobs
            .update(&job.id, |j| j.status = JobStatus::Running)
            .is_some();
        if claimed {
            tracing::info!(job_id = %job.id, tool = %job.tool, "firing scheduled job");
            tokio::spawn(fire(state.clone(), job));
        }
    }
}

/// Force an immediate run (the `run` action). Terminal and disabled jobs
/// are re-armed first.
pub fn run_now(state: &AppState, job: &ScheduledJob) {
    state.jobs.update(&job.id, |j| {
        j.status = JobStatus::Running;
    });
    tokio::spawn(fire(state.clone(), job.clone()));
}

/// Execute one job and record the outcome.
pub async fn fire(state: AppState, job: ScheduledJob) {
    let req = if job.tool == BASH_TOOL {
        let command = job
            .parameters
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        RunRequest::Bash { command }
    } else {
        RunRequest::Tool {
            name: job.tool.clone(),
            parameters: job.parameters.clone(),
        }
    };

    let timeout = std::time::Duration::from_secs(state.config.schedule.run_timeout_sec);
    let outcome = pipeline::execute_for_session(
        &state,
        &job.session_id,
        req,
        Some("scheduler".into()),
        job.created_by.clone(),
        timeout,
        None,
    )
    .await;

    let succeeded = matches!(
        &outcome,
        Ok(snapshot) if snapshot.status == TaskStatus::Completed
    );
    if let Err(e) = &outcome {
        tracing::warn!(job_id = %job.id, error = %e, "scheduled job run failed");
    }

    let now = Utc::now();
    state.jobs.update(&job.id, |j| {
        j.last_run = Some(now);
        j.run_count += 1;
        match j.schedule_type {
            ScheduleType::Once => {
                j.status = if succeeded {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                j.next_run = None;
            }
            ScheduleType::Cron => {
                // Recurring jobs stay registered either way and re-arm for
                // the next window; a failure is visible in the status.
                j.status = if succeeded {
                    JobStatus::Scheduled
                } else {
                    JobStatus::Failed
                };
                j.next_run = j.compute_next_run(&now);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::harness;
    use serde_json::{json, Map};

    fn make_session(h: &crate::testutil::Harness) -> String {
        let handle =
            h.state
                .sessions
                .create("sched-test".into(), vec![], String::new(), None);
        handle.read(|s| s.id.clone())
    }

    fn nmap_params() -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("target".into(), json!("10.0.0.5"));
        params
    }

    async fn wait_for_status(
        state: &AppState,
        job_id: &str,
        wanted: &[JobStatus],
    ) -> ScheduledJob {
        for _ in 0..250 {
            let job = state.jobs.get(job_id).unwrap();
            if wanted.contains(&job.status) {
                return job;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("job never reached {wanted:?}");
    }

    // ── S4: past-due one-shot fires immediately ─────────────────────

    #[tokio::test]
    async fn past_due_once_job_fires_and_completes() {
        let h = harness(vec![]);
        let session_id = make_session(&h);

        let job = h.state.jobs.insert(ScheduledJob::new(
            session_id.clone(),
            "nmap".into(),
            nmap_params(),
            ScheduleType::Once,
            Some(Utc::now() - chrono::Duration::hours(1)),
            None,
            None,
            "missed while down".into(),
            Some("alice".into()),
        ));

        tick(&h.state).await;
        let done = wait_for_status(&h.state, &job.id, &[JobStatus::Completed, JobStatus::Failed])
            .await;

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.run_count, 1);
        assert!(done.last_run.is_some());
        assert!(done.next_run.is_none());

        // The run appeared on the session exactly like an operator run.
        let handle = h.state.sessions.get(&session_id).unwrap();
        handle.read(|s| {
            let types: Vec<&str> = s.events.iter().map(|e| e.event_type.as_str()).collect();
            assert_eq!(types, vec!["tool_start", "tool_result"]);
            assert_eq!(s.events[0].data["source"], "scheduler");
        });
    }

    // ── S5: cron job returns to scheduled ───────────────────────────

    #[tokio::test]
    async fn cron_job_completes_and_rearms() {
        let h = harness(vec![]);
        let session_id = make_session(&h);

        let mut job = ScheduledJob::new(
            session_id,
            "subfinder".into(),
            {
                let mut p = Map::new();
                p.insert("domain".into(), json!("example.com"));
                p
            },
            ScheduleType::Cron,
            None,
            Some("*/5 * * * *".into()),
            None,
            "recurring enum".into(),
            None,
        );
        job.next_run = Some(Utc::now() - chrono::Duration::minutes(1));
        let job = h.state.jobs.insert(job);

        tick(&h.state).await;
        let done = wait_for_status(&h.state, &job.id, &[JobStatus::Scheduled, JobStatus::Failed])
            .await;

        assert_eq!(done.status, JobStatus::Scheduled);
        assert_eq!(done.run_count, 1);
        assert!(done.last_run.is_some());
        assert!(done.next_run.unwrap() > Utc::now() - chrono::Duration::seconds(5));
    }

    // ── Failure path ────────────────────────────────────────────────

    #[tokio::test]
    async fn job_for_deleted_session_fails() {
        let h = harness(vec![]);
        let session_id = make_session(&h);
        h.state.sessions.delete(&session_id);

        let job = h.state.jobs.insert(ScheduledJob::new(
            session_id,
            "nmap".into(),
            nmap_params(),
            ScheduleType::Once,
            Some(Utc::now() - chrono::Duration::minutes(5)),
            None,
            None,
            "orphaned".into(),
            None,
        ));

        tick(&h.state).await;
        let done =
            wait_for_status(&h.state, &job.id, &[JobStatus::Completed, JobStatus::Failed]).await;
        assert_eq!(done.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn future_job_is_untouched_by_tick() {
        let h = harness(vec![]);
        let session_id = make_session(&h);
        let job = h.state.jobs.insert(ScheduledJob::new(
            session_id,
            "nmap".into(),
            nmap_params(),
            ScheduleType::Once,
            Some(Utc::now() + chrono::Duration::hours(1)),
            None,
            None,
            "later".into(),
            None,
        ));

        tick(&h.state).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(h.state.jobs.get(&job.id).unwrap().status, JobStatus::Scheduled);
        assert_eq!(h.state.jobs.get(&job.id).unwrap().run_count, 0);
    }
}
