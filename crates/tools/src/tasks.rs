//! Live task registry.
//!
//! Every execution is tracked under its task id for the process lifetime.
//! The record is shared between the executor's monitor task and readers: a
//! per-task lock guards incremental output writes so streamers can observe
//! position-based deltas. A terminal status is written exactly once,
//! together with the final buffer state, and never mutated afterward.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Error,
    Timeout,
    Killed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Error | Self::Timeout | Self::Killed
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared mutable state for a single execution.
pub struct TaskRecord {
    pub task_id: String,
    pub tool: String,
    pub command: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub output: String,
    pub error: String,
    pub return_code: Option<i32>,
    max_output_chars: usize,
    /// Signals the monitor to terminate the process group.
    pub(crate) kill_tx: Option<mpsc::Sender<()>>,
    /// Wakes synchronous waiters on the terminal transition.
    pub(crate) done: Arc<Notify>,
}

impl TaskRecord {
    pub fn new(
        task_id: impl Into<String>,
        tool: impl Into<String>,
        command: impl Into<String>,
        max_output_chars: usize,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            tool: tool.into(),
            command: command.into(),
            status: TaskStatus::Starting,
            started_at: Utc::now(),
            finished_at: None,
            pid: None,
            output: String::new(),
            error: String::new(),
            return_code: None,
            max_output_chars,
            kill_tx: None,
            done: Arc::new(Notify::new()),
        }
    }

    pub fn push_output(&mut self, text: &str) {
        push_capped(&mut self.output, text, self.max_output_chars);
    }

    pub fn push_error(&mut self, text: &str) {
        push_capped(&mut self.error, text, self.max_output_chars);
    }

    /// Write a terminal status (one-way). Later calls are ignored so a kill
    /// racing the natural exit cannot overwrite the first outcome.
    pub fn finish(&mut self, status: TaskStatus, return_code: Option<i32>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.return_code = return_code;
        self.finished_at = Some(Utc::now());
        self.kill_tx = None;
        self.done.notify_waiters();
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            tool: self.tool.clone(),
            command: self.command.clone(),
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            pid: self.pid,
            output: self.output.clone(),
            error: self.error.clone(),
            return_code: self.return_code,
        }
    }
}

/// Drop from the front when the buffer exceeds the cap, keeping 3/4 of it,
/// without splitting a multi-byte character.
fn push_capped(buf: &mut String, text: &str, max_chars: usize) {
    buf.push_str(text);
    if max_chars > 0 && buf.len() > max_chars {
        let keep = max_chars * 3 / 4;
        let mut boundary = buf.len() - keep;
        while boundary < buf.len() && !buf.is_char_boundary(boundary) {
            boundary += 1;
        }
        buf.drain(..boundary);
    }
}

/// Immutable view returned to API callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub tool: String,
    pub command: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub output: String,
    pub error: String,
    pub return_code: Option<i32>,
}

/// Incremental read since the caller's last offsets.
#[derive(Debug, Clone, Serialize)]
pub struct PollDelta {
    pub status: TaskStatus,
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub out_offset: usize,
    pub err_offset: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<RwLock<TaskRecord>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, record: TaskRecord) -> Arc<RwLock<TaskRecord>> {
        let id = record.task_id.clone();
        let arc = Arc::new(RwLock::new(record));
        self.tasks.write().insert(id, arc.clone());
        arc
    }

    pub fn entry(&self, task_id: &str) -> Option<Arc<RwLock<TaskRecord>>> {
        self.tasks.read().get(task_id).cloned()
    }

    pub fn get(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.entry(task_id).map(|t| t.read().snapshot())
    }

    pub fn list(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<TaskSnapshot> = self
            .tasks
            .read()
            .values()
            .map(|t| t.read().snapshot())
            .collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }

    /// Incremental output since the given byte offsets.
    pub fn poll(&self, task_id: &str, out_offset: usize, err_offset: usize) -> Option<PollDelta> {
        let entry = self.entry(task_id)?;
        let t = entry.read();
        Some(PollDelta {
            status: t.status,
            return_code: t.return_code,
            stdout: read_from(&t.output, out_offset),
            stderr: read_from(&t.error, err_offset),
            out_offset: t.output.len(),
            err_offset: t.error.len(),
        })
    }

    /// Signal the monitor to kill the process group. Returns false when the
    /// task is unknown or already terminal.
    pub fn kill(&self, task_id: &str) -> bool {
        if let Some(entry) = self.entry(task_id) {
            let t = entry.read();
            if !t.status.is_terminal() {
                if let Some(ref tx) = t.kill_tx {
                    let _ = tx.try_send(());
                    return true;
                }
            }
        }
        false
    }

    /// Block until the task reaches a terminal status.
    pub async fn wait_terminal(&self, task_id: &str) -> Option<TaskSnapshot> {
        let entry = self.entry(task_id)?;
        let done = entry.read().done.clone();
        loop {
            let notified = done.notified();
            {
                let t = entry.read();
                if t.status.is_terminal() {
                    return Some(t.snapshot());
                }
            }
            notified.await;
        }
    }

    /// Drop terminal records older than the cutoff.
    pub fn evict_terminal(&self, older_than: chrono::Duration) {
        let cutoff = Utc::now() - older_than;
        self.tasks.write().retain(|_, t| {
            let t = t.read();
            !t.status.is_terminal() || t.finished_at.map_or(true, |ts| ts > cutoff)
        });
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte-offset read clamped to char boundaries.
fn read_from(buf: &str, offset: usize) -> String {
    let mut start = offset.min(buf.len());
    while start < buf.len() && !buf.is_char_boundary(start) {
        start += 1;
    }
    buf[start..].to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> TaskRecord {
        TaskRecord::new(id, "nmap", "nmap -Pn 10.0.0.1", 1_000)
    }

    // ── TaskStatus ──────────────────────────────────────────────────

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Starting.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        for s in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Error,
            TaskStatus::Timeout,
            TaskStatus::Killed,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TaskStatus::Timeout).unwrap(), "\"timeout\"");
        assert_eq!(serde_json::to_string(&TaskStatus::Killed).unwrap(), "\"killed\"");
    }

    // ── TaskRecord ──────────────────────────────────────────────────

    #[test]
    fn finish_is_one_way() {
        let mut t = record("t1");
        t.finish(TaskStatus::Completed, Some(0));
        let finished_at = t.finished_at;
        t.finish(TaskStatus::Killed, None);
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.return_code, Some(0));
        assert_eq!(t.finished_at, finished_at);
    }

    #[test]
    fn output_cap_drops_oldest() {
        let mut t = TaskRecord::new("t", "bash", "yes", 100);
        for _ in 0..30 {
            t.push_output("0123456789");
        }
        assert!(t.output.len() <= 100);
        assert!(t.output.ends_with("0123456789"));
    }

    #[test]
    fn output_cap_respects_char_boundaries() {
        let mut t = TaskRecord::new("t", "bash", "yes", 20);
        for _ in 0..20 {
            t.push_output("héllö");
        }
        // Must not panic and must still hold valid UTF-8.
        assert!(t.output.is_char_boundary(0));
    }

    // ── TaskRegistry ────────────────────────────────────────────────

    #[test]
    fn insert_get_list() {
        let reg = TaskRegistry::new();
        reg.insert(record("a"));
        reg.insert(record("b"));
        assert!(reg.get("a").is_some());
        assert!(reg.get("missing").is_none());
        assert_eq!(reg.list().len(), 2);
    }

    #[test]
    fn poll_returns_incremental_deltas() {
        let reg = TaskRegistry::new();
        let entry = reg.insert(record("p"));

        entry.write().push_output("first ");
        let d1 = reg.poll("p", 0, 0).unwrap();
        assert_eq!(d1.stdout, "first ");

        entry.write().push_output("second");
        entry.write().push_error("oops");
        let d2 = reg.poll("p", d1.out_offset, d1.err_offset).unwrap();
        assert_eq!(d2.stdout, "second");
        assert_eq!(d2.stderr, "oops");

        let d3 = reg.poll("p", d2.out_offset, d2.err_offset).unwrap();
        assert!(d3.stdout.is_empty());
        assert!(d3.stderr.is_empty());
    }

    #[test]
    fn kill_requires_live_task_with_channel() {
        let reg = TaskRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        let mut r = record("k");
        r.status = TaskStatus::Running;
        r.kill_tx = Some(tx);
        reg.insert(r);

        assert!(reg.kill("k"));
        assert!(rx.try_recv().is_ok());
        assert!(!reg.kill("missing"));
    }

    #[test]
    fn kill_terminal_task_is_noop() {
        let reg = TaskRegistry::new();
        let entry = reg.insert(record("done"));
        entry.write().finish(TaskStatus::Completed, Some(0));
        assert!(!reg.kill("done"));
    }

    #[tokio::test]
    async fn wait_terminal_wakes_on_finish() {
        let reg = std::sync::Arc::new(TaskRegistry::new());
        let entry = reg.insert(record("w"));

        let reg2 = reg.clone();
        let waiter = tokio::spawn(async move { reg2.wait_terminal("w").await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        entry.write().finish(TaskStatus::Failed, Some(2));

        let snap = waiter.await.unwrap().unwrap();
        assert_eq!(snap.status, TaskStatus::Failed);
        assert_eq!(snap.return_code, Some(2));
    }

    #[tokio::test]
    async fn wait_terminal_returns_immediately_when_done() {
        let reg = TaskRegistry::new();
        let entry = reg.insert(record("d"));
        entry.write().finish(TaskStatus::Completed, Some(0));
        assert!(reg.wait_terminal("d").await.is_some());
    }

    #[test]
    fn evict_terminal_keeps_running() {
        let reg = TaskRegistry::new();
        let done = reg.insert(record("old"));
        done.write().finish(TaskStatus::Completed, Some(0));
        reg.insert(record("live"));

        reg.evict_terminal(chrono::Duration::zero());
        assert!(reg.get("old").is_none());
        assert!(reg.get("live").is_some());
    }
}
