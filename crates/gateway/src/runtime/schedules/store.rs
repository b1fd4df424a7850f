//! Persistent schedule storage (`schedules.json`, atomic replace).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;

use tal_domain::{Error, Result};

use super::model::{JobStatus, ScheduleType, ScheduledJob};

pub struct JobStore {
    path: PathBuf,
    jobs: RwLock<HashMap<String, ScheduledJob>>,
}

impl JobStore {
    /// Load `schedules.json` from the data directory. At startup, jobs in a
    /// non-terminal status are re-armed by recomputing their next window;
    /// past-due one-shots become due immediately.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("schedules.json");
        let mut jobs: HashMap<String, ScheduledJob> = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let list: Vec<ScheduledJob> = serde_json::from_str(&raw)?;
            list.into_iter().map(|j| (j.id.clone(), j)).collect()
        } else {
            HashMap::new()
        };

        let now = Utc::now();
        for job in jobs.values_mut() {
            if job.status == JobStatus::Scheduled && job.schedule_type == ScheduleType::Cron {
                job.next_run = job.compute_next_run(&now).or(job.next_run);
            }
        }
        tracing::info!(count = jobs.len(), "scheduled jobs loaded");

        Ok(Self {
            path,
            jobs: RwLock::new(jobs),
        })
    }

    pub fn get(&self, id: &str) -> Option<ScheduledJob> {
        self.jobs.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<ScheduledJob> {
        let mut all: Vec<ScheduledJob> = self.jobs.read().values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub fn list_for_session(&self, session_id: &str) -> Vec<ScheduledJob> {
        self.list()
            .into_iter()
            .filter(|j| j.session_id == session_id)
            .collect()
    }

    pub fn insert(&self, job: ScheduledJob) -> ScheduledJob {
        self.jobs.write().insert(job.id.clone(), job.clone());
        self.persist();
        job
    }

    /// Apply a mutation and persist. Returns the updated job if found.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut ScheduledJob)) -> Option<ScheduledJob> {
        let updated = {
            let mut jobs = self.jobs.write();
            let job = jobs.get_mut(id)?;
            f(job);
            job.clone()
        };
        self.persist();
        Some(updated)
    }

    pub fn delete(&self, id: &str) -> bool {
        let removed = self.jobs.write().remove(id).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    /// Jobs whose fire instant has arrived.
    pub fn due_jobs(&self) -> Vec<ScheduledJob> {
        let now = Utc::now();
        self.jobs
            .read()
            .values()
            .filter(|j| j.is_due(&now))
            .cloned()
            .collect()
    }

    fn persist(&self) {
        let result: Result<()> = (|| {
            let mut list: Vec<ScheduledJob> = self.jobs.read().values().cloned().collect();
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            let json = serde_json::to_string_pretty(&list)?;
            let dir = self
                .path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            std::fs::create_dir_all(&dir)?;
            let tmp = tempfile::NamedTempFile::new_in(&dir)?;
            std::fs::write(tmp.path(), json)?;
            tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist schedules");
        }
    }
}
