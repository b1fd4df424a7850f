//! Subprocess executor.
//!
//! Turns a rendered command line into a tracked task: spawns the child in
//! its own process group, streams stdout/stderr into the task record,
//! enforces the per-call timeout, and supports cancellation. Failures are
//! recorded on the task; nothing here returns an error to the caller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use tal_domain::config::ExecConfig;

use crate::command::CommandLine;
use crate::process_group;
use crate::tasks::{TaskRecord, TaskRegistry, TaskSnapshot, TaskStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One execution request, fully rendered.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub tool: String,
    pub command_line: CommandLine,
    /// Recorded on the task; the raw shell string for `bash`, the joined
    /// argv otherwise.
    pub display_command: String,
    pub timeout: Duration,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Executor {
    registry: Arc<TaskRegistry>,
    config: ExecConfig,
    artifact_dir: PathBuf,
}

impl Executor {
    pub fn new(registry: Arc<TaskRegistry>, config: ExecConfig, artifact_dir: PathBuf) -> Self {
        Self {
            registry,
            config,
            artifact_dir,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn artifact_dir(&self) -> &PathBuf {
        &self.artifact_dir
    }

    /// Register the task and spawn the monitor; returns immediately.
    pub fn submit(&self, task_id: &str, spec: ExecSpec) {
        let (kill_tx, kill_rx) = mpsc::channel::<()>(1);

        let mut record = TaskRecord::new(
            task_id,
            &spec.tool,
            &spec.display_command,
            self.config.max_output_chars,
        );
        record.kill_tx = Some(kill_tx);
        let entry = self.registry.insert(record);

        // Per-task artifact area; tools write scan output here.
        let task_dir = self.artifact_dir.join(task_id);
        if let Err(e) = std::fs::create_dir_all(&task_dir) {
            tracing::warn!(task_id, error = %e, "failed to create task artifact dir");
        }

        let grace = Duration::from_millis(self.config.kill_grace_ms);
        tokio::spawn(monitor(entry, spec, kill_rx, grace));
    }

    /// Submit and block until the task reaches a terminal status.
    pub async fn run_sync(&self, task_id: &str, spec: ExecSpec) -> TaskSnapshot {
        self.submit(task_id, spec);
        self.registry
            .wait_terminal(task_id)
            .await
            .expect("task registered by submit")
    }

    /// Signal cancellation for a running task.
    pub fn kill(&self, task_id: &str) -> bool {
        self.registry.kill(task_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Monitor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn monitor(
    entry: Arc<RwLock<TaskRecord>>,
    spec: ExecSpec,
    mut kill_rx: mpsc::Receiver<()>,
    grace: Duration,
) {
    let CommandLine { argv, stdin } = spec.command_line;
    let Some((program, args)) = argv.split_first() else {
        entry.write().push_error("empty command");
        entry.write().finish(TaskStatus::Error, None);
        return;
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .stdin(if stdin.is_some() {
            std::process::Stdio::piped()
        } else {
            std::process::Stdio::null()
        });

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| process_group::set_process_group());
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            let mut t = entry.write();
            t.push_error(&format!("failed to spawn: {e}"));
            t.finish(TaskStatus::Error, None);
            return;
        }
    };

    let pid = child.id();
    {
        let mut t = entry.write();
        t.pid = pid;
        t.status = TaskStatus::Running;
    }

    // Stdout reader.
    let stdout = child.stdout.take();
    let entry_out = entry.clone();
    let stdout_task = tokio::spawn(async move {
        if let Some(stdout) = stdout {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let mut t = entry_out.write();
                t.push_output(&line);
                t.push_output("\n");
            }
        }
    });

    // Stderr reader.
    let stderr = child.stderr.take();
    let entry_err = entry.clone();
    let stderr_task = tokio::spawn(async move {
        if let Some(stderr) = stderr {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let mut t = entry_err.write();
                t.push_error(&line);
                t.push_error("\n");
            }
        }
    });

    // Feed the stdin payload, then close the pipe so the tool sees EOF.
    if let Some(payload) = stdin {
        if let Some(mut handle) = child.stdin.take() {
            let _ = handle.write_all(payload.as_bytes()).await;
            let _ = handle.shutdown().await;
        }
    }

    tokio::select! {
        result = child.wait() => {
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            match result {
                Ok(exit) => {
                    let code = exit.code();
                    let status = if code == Some(0) {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    };
                    entry.write().finish(status, code);
                }
                Err(e) => {
                    let mut t = entry.write();
                    t.push_error(&format!("\n[process error: {e}]"));
                    t.finish(TaskStatus::Error, None);
                }
            }
        }
        _ = kill_rx.recv() => {
            if let Some(pid) = pid {
                process_group::terminate_process_group(pid, grace).await;
            }
            let _ = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            entry.write().finish(TaskStatus::Killed, None);
        }
        _ = tokio::time::sleep(spec.timeout) => {
            if let Some(pid) = pid {
                process_group::terminate_process_group(pid, grace).await;
            }
            let _ = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let mut t = entry.write();
            let secs = spec.timeout.as_secs();
            t.push_error(&format!("Task timed out after {secs}s"));
            t.finish(TaskStatus::Timeout, None);
        }
    }

    tracing::debug!(
        task_id = %entry.read().task_id,
        status = ?entry.read().status,
        "task monitor finished"
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
