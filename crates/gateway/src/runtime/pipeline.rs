//! Session-scoped tool execution.
//!
//! One path for every trigger (operator endpoint, agent tool call,
//! scheduled job): scope check, tool_start event, detokenized launch through
//! the executor, tool_result event, broadcasts. Events are logged to the
//! session before they are broadcast, and the logged parameters are the
//! tokenized ones so credentials never land in persisted JSON.

use std::time::Duration;

use serde_json::{json, Map, Value};

use tal_tools::command::{build_bash_command, build_command};
use tal_tools::{ExecSpec, TaskSnapshot, BASH_TOOL};

use crate::runtime::events::EventKind;
use crate::runtime::scope;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub enum RunRequest {
    Tool {
        name: String,
        parameters: Map<String, Value>,
    },
    Bash {
        command: String,
    },
}

impl RunRequest {
    pub fn tool_name(&self) -> &str {
        match self {
            RunRequest::Tool { name, .. } => name,
            RunRequest::Bash { .. } => BASH_TOOL,
        }
    }

    /// The parameter payload recorded on events (tokenized form).
    fn event_parameters(&self) -> Value {
        match self {
            RunRequest::Tool { parameters, .. } => Value::Object(parameters.clone()),
            RunRequest::Bash { command } => json!({ "command": command }),
        }
    }
}

#[derive(Debug)]
pub enum ExecError {
    OutOfScope { target: String },
    Domain(tal_domain::Error),
}

impl From<tal_domain::Error> for ExecError {
    fn from(e: tal_domain::Error) -> Self {
        ExecError::Domain(e)
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::OutOfScope { target } => write!(f, "{}", scope_violation_message(target)),
            ExecError::Domain(e) => write!(f, "{e}"),
        }
    }
}

/// The exact message surfaced to the LLM and the event log on a block.
pub fn scope_violation_message(target: &str) -> String {
    format!("[SCOPE VIOLATION] Target '{target}' is outside the defined engagement scope.")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Synchronous path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run a tool for a session and wait for the terminal state.
pub async fn execute_for_session(
    state: &AppState,
    session_id: &str,
    req: RunRequest,
    source: Option<String>,
    user: Option<String>,
    timeout: Duration,
    task_id: Option<String>,
) -> Result<TaskSnapshot, ExecError> {
    let (task_id, spec) = prepare(state, session_id, &req, timeout, task_id, &source, &user)?;
    let snapshot = state.executor.run_sync(&task_id, spec).await;
    record_result(state, session_id, &req, &task_id, &snapshot, &source);
    Ok(snapshot)
}

/// Fire-and-forget: start the tool, report completion through the session
/// event stream when the task finishes.
pub fn execute_for_session_async(
    state: &AppState,
    session_id: &str,
    req: RunRequest,
    source: Option<String>,
    user: Option<String>,
    timeout: Duration,
) -> Result<String, ExecError> {
    let (task_id, spec) = prepare(state, session_id, &req, timeout, None, &source, &user)?;
    state.executor.submit(&task_id, spec);

    let state = state.clone();
    let session_id = session_id.to_string();
    let returned_id = task_id.clone();
    tokio::spawn(async move {
        if let Some(snapshot) = state.tasks.wait_terminal(&task_id).await {
            record_result(&state, &session_id, &req, &task_id, &snapshot, &source);
        }
    });
    Ok(returned_id)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scope check, command rendering (with vault detokenization), and the
/// tool_start event. Returns the task id and the ready-to-launch spec.
fn prepare(
    state: &AppState,
    session_id: &str,
    req: &RunRequest,
    timeout: Duration,
    task_id: Option<String>,
    source: &Option<String>,
    user: &Option<String>,
) -> Result<(String, ExecSpec), ExecError> {
    let handle = state.sessions.require(session_id)?;

    // Scope enforcement on the tokenized request.
    let target = match req {
        RunRequest::Tool { parameters, .. } => {
            scope::extract_from_parameters(&Value::Object(parameters.clone()))
        }
        RunRequest::Bash { command } => scope::extract_from_command(command),
    };
    if let Some(target) = target {
        let allowed = handle.read(|s| scope::in_scope(&target, &s.target_scope));
        if !allowed {
            let message = scope_violation_message(&target);
            handle.mutate(|s| {
                s.add_event(
                    "tool_result",
                    json!({
                        "tool": req.tool_name(),
                        "status": "blocked",
                        "output": message,
                        "scope_violation": true,
                        "source": source,
                    }),
                    user.clone(),
                );
            });
            state.bus.broadcast(
                session_id,
                EventKind::ToolResult {
                    tool: req.tool_name().to_string(),
                    task_id: String::new(),
                    result: json!({
                        "status": "blocked",
                        "output": message,
                        "scope_violation": true,
                    }),
                    source: source.clone(),
                },
            );
            return Err(ExecError::OutOfScope { target });
        }
    }

    // Detokenize just before launch; the real values exist only in the spec.
    let command_line = match req {
        RunRequest::Tool { name, parameters } => {
            let def = state
                .tools
                .get(name)
                .ok_or_else(|| tal_domain::Error::ToolNotFound(name.clone()))?;
            let mut detok = Value::Object(parameters.clone());
            handle.read(|s| s.vault.detokenize_value(&mut detok));
            let detok = detok.as_object().cloned().unwrap_or_default();
            build_command(&def, &detok)
        }
        RunRequest::Bash { command } => {
            let detok = handle.read(|s| s.vault.detokenize_str(command));
            build_bash_command(&detok)
        }
    };
    let display_command = match req {
        // The recorded command keeps the tokenized shell string so the
        // persisted event log stays credential-free.
        RunRequest::Bash { command } => command.clone(),
        RunRequest::Tool { .. } => command_line.display(),
    };

    let task_id = task_id.unwrap_or_else(tal_sessions::tiny_id);

    handle.mutate(|s| {
        s.add_event(
            "tool_start",
            json!({
                "tool": req.tool_name(),
                "task_id": task_id,
                "parameters": req.event_parameters(),
                "source": source,
            }),
            user.clone(),
        );
    });
    state.bus.broadcast(
        session_id,
        EventKind::ToolStart {
            tool: req.tool_name().to_string(),
            task_id: task_id.clone(),
            parameters: req.event_parameters(),
            user: user.clone(),
            source: source.clone(),
        },
    );

    let spec = ExecSpec {
        tool: req.tool_name().to_string(),
        command_line,
        display_command,
        timeout,
    };
    Ok((task_id, spec))
}

/// Log the tool_result event, then broadcast it (log-then-broadcast, both
/// paths). The stored output is capped; the task registry keeps it all.
fn record_result(
    state: &AppState,
    session_id: &str,
    req: &RunRequest,
    task_id: &str,
    snapshot: &TaskSnapshot,
    source: &Option<String>,
) {
    let cap = state.config.agent.tool_output_cap;
    let output = truncate(&snapshot.output, cap);
    let error = truncate(&snapshot.error, cap);

    if let Some(handle) = state.sessions.get(session_id) {
        handle.mutate(|s| {
            s.add_event(
                "tool_result",
                json!({
                    "task_id": task_id,
                    "tool": req.tool_name(),
                    "status": snapshot.status,
                    "output": output,
                    "return_code": snapshot.return_code,
                    "source": source,
                }),
                None,
            );
        });
    }
    state.bus.broadcast(
        session_id,
        EventKind::ToolResult {
            tool: req.tool_name().to_string(),
            task_id: task_id.to_string(),
            result: json!({
                "status": snapshot.status,
                "output": output,
                "error": error,
                "return_code": snapshot.return_code,
                "parameters": req.event_parameters(),
            }),
            source: source.clone(),
        },
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::harness;
    use tal_tools::TaskStatus;

    fn make_session(h: &crate::testutil::Harness, scope: &[&str]) -> String {
        let handle = h.state.sessions.create(
            "pipe-test".into(),
            scope.iter().map(|s| s.to_string()).collect(),
            String::new(),
            None,
        );
        handle.read(|s| s.id.clone())
    }

    #[tokio::test]
    async fn tool_run_logs_start_then_result_and_broadcasts_in_order() {
        let h = harness(vec![]);
        let session_id = make_session(&h, &["example.com"]);
        let (_sub, mut rx) = h.state.bus.subscribe(&session_id, "alice".into());

        let mut parameters = Map::new();
        parameters.insert("target".into(), json!("example.com"));
        let snapshot = execute_for_session(
            &h.state,
            &session_id,
            RunRequest::Tool {
                name: "nmap".into(),
                parameters,
            },
            Some("operator".into()),
            Some("alice".into()),
            Duration::from_secs(10),
            Some("t-pipe".into()),
        )
        .await
        .unwrap();

        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert!(snapshot.output.contains("nmap-run"));

        // Event log: tool_start strictly before tool_result.
        let handle = h.state.sessions.get(&session_id).unwrap();
        handle.read(|s| {
            let types: Vec<&str> = s.events.iter().map(|e| e.event_type.as_str()).collect();
            assert_eq!(types, vec!["tool_start", "tool_result"]);
            assert_eq!(s.events[1].data["status"], "completed");
        });

        // Broadcast order matches the log order.
        let mut seen = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            seen.push(evt["type"].as_str().unwrap().to_string());
        }
        let start_pos = seen.iter().position(|t| t == "tool_start").unwrap();
        let result_pos = seen.iter().position(|t| t == "tool_result").unwrap();
        assert!(start_pos < result_pos);
    }

    #[tokio::test]
    async fn out_of_scope_run_is_blocked_before_spawn() {
        let h = harness(vec![]);
        let session_id = make_session(&h, &["example.com"]);

        let mut parameters = Map::new();
        parameters.insert("target".into(), json!("evil.com"));
        let outcome = execute_for_session(
            &h.state,
            &session_id,
            RunRequest::Tool {
                name: "nmap".into(),
                parameters,
            },
            None,
            None,
            Duration::from_secs(10),
            None,
        )
        .await;

        assert!(matches!(
            outcome,
            Err(ExecError::OutOfScope { ref target }) if target == "evil.com"
        ));
        assert!(h.state.tasks.list().is_empty());

        let handle = h.state.sessions.get(&session_id).unwrap();
        handle.read(|s| {
            assert_eq!(s.events.len(), 1);
            assert_eq!(s.events[0].data["scope_violation"], true);
        });
    }

    #[tokio::test]
    async fn bash_launch_substitutes_vault_tokens() {
        let h = harness(vec![]);
        let session_id = make_session(&h, &[]);
        let handle = h.state.sessions.get(&session_id).unwrap();
        let token = handle.mutate_volatile(|s| s.vault.mint("swordfish"));

        let snapshot = execute_for_session(
            &h.state,
            &session_id,
            RunRequest::Bash {
                command: format!("echo cred={token}"),
            },
            None,
            None,
            Duration::from_secs(10),
            None,
        )
        .await
        .unwrap();

        // The subprocess received the real value.
        assert!(snapshot.output.contains("cred=swordfish"));
        // The recorded command and the persisted events keep the token.
        assert!(snapshot.command.contains(&token));
        handle.read(|s| {
            let logged = serde_json::to_string(&s.events[0].data).unwrap();
            assert!(!logged.contains("swordfish"));
        });
    }

    #[tokio::test]
    async fn unknown_tool_is_a_domain_error() {
        let h = harness(vec![]);
        let session_id = make_session(&h, &[]);
        let outcome = execute_for_session(
            &h.state,
            &session_id,
            RunRequest::Tool {
                name: "no-such-tool".into(),
                parameters: Map::new(),
            },
            None,
            None,
            Duration::from_secs(10),
            None,
        )
        .await;
        assert!(matches!(
            outcome,
            Err(ExecError::Domain(tal_domain::Error::ToolNotFound(_)))
        ));
    }
}
