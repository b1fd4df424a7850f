//! Agent driver: the chat loop and the two-phase autonomous loops.
//!
//! The driver owns one session's conversation with the model. Chat mode is
//! a plain tool loop. Autonomous mode splits each step into a propose phase
//! (no tools), a human-approval gate, and an execute phase (tools enabled).
//! Every await point in autonomous mode checks the session's stop flag and
//! exits cleanly when the operator has turned autonomous mode off.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use tal_domain::chat::{joined_text, tool_uses, ChatMessage, ContentBlock, ToolSchema};
use tal_domain::{Error, Result};
use tal_providers::ChatRequest;
use tal_sessions::{PendingApproval, Playbook, ScopeApproval, SessionHandle, Severity};

use crate::runtime::events::EventKind;
use crate::runtime::pipeline::{self, ExecError, RunRequest};
use crate::state::AppState;

const SYSTEM_PROMPT: &str = "You are an expert penetration tester assistant operating within a \
sanctioned, ethical security assessment engagement. You have access to a suite of security \
testing tools.\n\n\
## Your Role\n\
- You assist the tester by analyzing results, suggesting next steps, and executing tools when asked\n\
- You ONLY operate within the defined target scope for this engagement\n\
- You provide clear explanations of what each tool does and what results mean\n\
- You flag potential vulnerabilities with severity ratings\n\n\
## Rules\n\
1. NEVER test targets outside the defined scope; use add_to_scope to request additions\n\
2. Always explain what you're about to do before doing it\n\
3. Categorize findings by severity: Critical, High, Medium, Low, Informational\n\
4. When in autonomous mode, propose each step and wait for approval\n\
5. Provide actionable remediation advice for findings\n\
6. Chain tools effectively: recon -> enumeration -> scanning -> analysis";

/// Marker the model emits when a playbook phase has met its goal.
pub const PHASE_COMPLETE_MARKER: &str = "PHASE COMPLETE";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn tool_schemas(tool_names: &[String]) -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: "execute_tool".into(),
            description: format!(
                "Execute a security testing tool. Available tools: {}.",
                tool_names.join(", ")
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tool": {"type": "string", "description": "Name of the tool to execute"},
                    "parameters": {
                        "type": "object",
                        "description": "Tool-specific parameters as key-value pairs"
                    },
                },
                "required": ["tool", "parameters"],
            }),
        },
        ToolSchema {
            name: "execute_bash".into(),
            description: "Execute a bash command for tool chaining, piping, or custom \
                          operations."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "The bash command to execute"},
                },
                "required": ["command"],
            }),
        },
        ToolSchema {
            name: "record_finding".into(),
            description: "Record a security finding discovered during testing.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "severity": {
                        "type": "string",
                        "enum": ["critical", "high", "medium", "low", "info"],
                    },
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "evidence": {"type": "string"},
                },
                "required": ["severity", "title", "description"],
            }),
        },
        ToolSchema {
            name: "read_file".into(),
            description: "Read a file from the scan data directory.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the data directory"},
                },
                "required": ["path"],
            }),
        },
        ToolSchema {
            name: "add_to_scope".into(),
            description: "Request operator approval to add newly discovered hosts to the \
                          engagement scope."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "hosts": {"type": "array", "items": {"type": "string"}},
                    "reason": {"type": "string"},
                },
                "required": ["hosts"],
            }),
        },
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ChatOutcome {
    pub content: String,
    pub tool_calls: Vec<Value>,
}

enum StepOutcome {
    Continue,
    PhaseComplete,
    Aborted,
}

pub struct AgentDriver {
    state: AppState,
    session_id: String,
    handle: Arc<SessionHandle>,
    user: Option<String>,
    /// Set for the autonomous loops; enables stop-flag checkpoints.
    autonomous: bool,
}

impl AgentDriver {
    pub fn new(state: AppState, session_id: &str, user: Option<String>) -> Result<Self> {
        let handle = state.sessions.require(session_id)?;
        Ok(Self {
            state,
            session_id: session_id.to_string(),
            handle,
            user,
            autonomous: false,
        })
    }

    fn system_prompt(&self) -> String {
        let context = self.handle.read(|s| s.context_summary());
        format!("{SYSTEM_PROMPT}\n\n## Current Engagement Context\n{context}")
    }

    fn stopped(&self) -> bool {
        self.autonomous && self.handle.read(|s| !s.auto.auto_mode)
    }

    fn broadcast(&self, kind: EventKind) {
        self.state.bus.broadcast(&self.session_id, kind);
    }

    async fn llm(&self, messages: &[ChatMessage], with_tools: bool) -> Result<Vec<ContentBlock>> {
        let tools = with_tools.then(|| tool_schemas(&self.state.tools.names()));
        let req = ChatRequest {
            system: self.system_prompt(),
            messages: messages.to_vec(),
            tools,
            max_tokens: self.state.config.llm.max_tokens,
        };
        Ok(self.state.llm.complete(&req).await?.content)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Chat mode
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// One chat turn: tokenize, run the tool loop to a text-only response.
    pub async fn chat(&self, message: &str) -> Result<ChatOutcome> {
        // Credentials are vaulted before the text goes anywhere.
        let tokenized = self
            .handle
            .mutate_volatile(|s| self.state.tokenizer.tokenize(message, &mut s.vault));

        self.handle
            .mutate(|s| s.add_message("user", &tokenized, self.user.clone()));
        self.broadcast(EventKind::ChatMessage {
            role: "user".into(),
            content: tokenized.clone(),
            tool_calls: vec![],
        });

        let window = self.state.config.agent.history_window;
        let mut messages: Vec<ChatMessage> = self.handle.read(|s| {
            s.chat_history(window)
                .iter()
                .filter(|m| m.role == "user" || m.role == "assistant")
                .map(|m| ChatMessage {
                    role: if m.role == "user" {
                        tal_domain::chat::Role::User
                    } else {
                        tal_domain::chat::Role::Assistant
                    },
                    content: tal_domain::chat::MessageContent::Text(m.content.clone()),
                })
                .collect()
        });
        if messages.is_empty() {
            messages.push(ChatMessage::user(&tokenized));
        }

        let mut tool_calls: Vec<Value> = Vec::new();
        for _ in 0..self.state.config.agent.max_tool_loops {
            let content = self.llm(&messages, true).await?;
            let uses: Vec<(String, String, Value)> = tool_uses(&content)
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();

            if uses.is_empty() {
                let text = joined_text(&content);
                self.handle
                    .mutate(|s| s.add_message("assistant", &text, None));
                self.broadcast(EventKind::ChatMessage {
                    role: "assistant".into(),
                    content: text.clone(),
                    tool_calls: tool_calls.clone(),
                });
                return Ok(ChatOutcome {
                    content: text,
                    tool_calls,
                });
            }

            messages.push(ChatMessage::assistant_blocks(content));
            let mut results = Vec::new();
            for (id, name, input) in uses {
                let result = self.execute_tool_call(&name, &input).await;
                tool_calls.push(json!({
                    "tool": name,
                    "input": input,
                    "result_preview": preview(&result, 500),
                }));
                results.push((id, result));
            }
            messages.push(ChatMessage::tool_results(results));
        }

        Err(Error::Other(format!(
            "tool loop limit reached ({} iterations)",
            self.state.config.agent.max_tool_loops
        )))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Tool dispatch
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Execute one tool-use block and render the result string returned to
    /// the model. Failures come back as text, never as errors.
    async fn execute_tool_call(&self, name: &str, input: &Value) -> String {
        match name {
            "execute_tool" => {
                let tool = input.get("tool").and_then(Value::as_str).unwrap_or_default();
                if tool.is_empty() {
                    return "Error: 'tool' is required".into();
                }
                let parameters = input
                    .get("parameters")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                self.run_pipeline(RunRequest::Tool {
                    name: tool.to_string(),
                    parameters,
                })
                .await
            }
            "execute_bash" => {
                let command = input
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if command.is_empty() {
                    return "Error: 'command' is required".into();
                }
                self.run_pipeline(RunRequest::Bash {
                    command: command.to_string(),
                })
                .await
            }
            "record_finding" => self.record_finding(input),
            "read_file" => self.read_file(input),
            "add_to_scope" => self.add_to_scope(input).await,
            other => format!("Unknown tool: {other}"),
        }
    }

    async fn run_pipeline(&self, req: RunRequest) -> String {
        let timeout = Duration::from_secs(self.state.config.exec.default_timeout_sec);
        match pipeline::execute_for_session(
            &self.state,
            &self.session_id,
            req,
            Some("ai_agent".into()),
            self.user.clone(),
            timeout,
            None,
        )
        .await
        {
            Ok(snapshot) => {
                let cap = self.state.config.agent.tool_output_cap;
                let output = self.state.redactor.redact(&preview(&snapshot.output, cap));
                let error = self.state.redactor.redact(&preview(&snapshot.error, cap));
                let status = serde_json::to_value(snapshot.status)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();
                if error.is_empty() {
                    format!("Status: {status}\nOutput:\n{output}")
                } else {
                    format!("Status: {status}\nOutput:\n{output}\nErrors: {error}")
                }
            }
            Err(ExecError::OutOfScope { target }) => pipeline::scope_violation_message(&target),
            Err(ExecError::Domain(Error::ToolNotFound(name))) => format!("Unknown tool: {name}"),
            Err(ExecError::Domain(e)) => format!("Error: {e}"),
        }
    }

    fn record_finding(&self, input: &Value) -> String {
        let severity = input
            .get("severity")
            .and_then(Value::as_str)
            .and_then(Severity::parse);
        let Some(severity) = severity else {
            return "Error: severity must be one of critical, high, medium, low, info".into();
        };
        let title = input.get("title").and_then(Value::as_str).unwrap_or_default();
        let description = input
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let evidence = input
            .get("evidence")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if title.is_empty() {
            return "Error: 'title' is required".into();
        }

        let finding = self
            .handle
            .mutate(|s| s.add_finding(severity, title, description, evidence));
        self.broadcast(EventKind::NewFinding {
            finding: finding.clone(),
        });
        format!(
            "Finding recorded: [{}] {}",
            finding.severity.as_str().to_uppercase(),
            finding.title
        )
    }

    fn read_file(&self, input: &Value) -> String {
        let path = input.get("path").and_then(Value::as_str).unwrap_or_default();
        if path.is_empty() {
            return "Error: 'path' is required".into();
        }
        let rel = std::path::Path::new(path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return format!("Error reading file: invalid path '{path}'");
        }
        let full = self.state.executor.artifact_dir().join(rel);
        match std::fs::read_to_string(&full) {
            Ok(content) => {
                let cap = self.state.config.agent.tool_output_cap;
                self.state.redactor.redact(&preview(&content, cap))
            }
            Err(e) => format!("Error reading file: {e}"),
        }
    }

    /// Open a scope-addition gate and wait for the operator's decision.
    async fn add_to_scope(&self, input: &Value) -> String {
        let hosts: Vec<String> = match input.get("hosts") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => {
                s.split(',').map(|h| h.trim().to_string()).collect()
            }
            _ => Vec::new(),
        };
        let hosts: Vec<String> = hosts.into_iter().filter(|h| !h.is_empty()).collect();
        if hosts.is_empty() {
            return "Error: 'hosts' is required".into();
        }
        let reason = input
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let approval_id = tal_sessions::tiny_id();
        self.handle.mutate_volatile(|s| {
            s.add_scope_approval(ScopeApproval {
                approval_id: approval_id.clone(),
                hosts: hosts.clone(),
                reason: reason.clone(),
                approved: None,
                resolved: false,
            });
        });
        self.broadcast(EventKind::ScopeAdditionPending {
            approval_id: approval_id.clone(),
            hosts: hosts.clone(),
            reason: reason.clone(),
        });

        let deadline = std::time::Instant::now()
            + Duration::from_secs(self.state.config.agent.scope_approval_timeout_sec);
        loop {
            if self.stopped() {
                return "Scope addition cancelled: autonomous mode was stopped.".into();
            }
            let decision = self.handle.read(|s| {
                s.auto
                    .scope_approvals
                    .iter()
                    .find(|a| a.approval_id == approval_id)
                    .and_then(|a| a.resolved.then_some(a.approved.unwrap_or(false)))
            });
            match decision {
                Some(true) => {
                    let (added, target_scope) = self.handle.mutate(|s| {
                        let added: Vec<String> = hosts
                            .iter()
                            .filter(|h| !s.target_scope.contains(h))
                            .cloned()
                            .collect();
                        s.target_scope.extend(added.iter().cloned());
                        (added, s.target_scope.clone())
                    });
                    self.broadcast(EventKind::ScopeUpdated {
                        added: added.clone(),
                        target_scope,
                        reason: (!reason.is_empty()).then_some(reason.clone()),
                    });
                    return format!("Scope updated: added {}", added.join(", "));
                }
                Some(false) => return "Scope addition rejected by operator.".into(),
                None => {}
            }
            if std::time::Instant::now() >= deadline {
                return "Scope addition request timed out waiting for operator approval.".into();
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Autonomous mode
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Freeform autonomous loop. Runs until the step budget is spent, the
    /// operator stops it, approval is rejected, or approval times out.
    pub async fn run_autonomous(mut self) {
        self.autonomous = true;
        let (objective, max_steps) = self
            .handle
            .read(|s| (s.auto.objective.clone(), s.auto.max_steps));

        self.broadcast(EventKind::AutoStatus {
            message: format!("Starting autonomous testing: {objective}"),
            step: Some(0),
            max_steps: Some(max_steps),
        });

        let seed = format!(
            "You are now in AUTONOMOUS MODE for this penetration testing engagement.\n\n\
             OBJECTIVE: {objective}\nMAX STEPS: {max_steps}\n\n\
             Each step has two phases. First, PROPOSE: describe exactly what you will do next \
             and why — do not call any tools yet. After the tester approves, you will be asked \
             to EXECUTE exactly what you proposed. If the objective is fully met before the \
             step budget is spent, reply with the single line {PHASE_COMPLETE_MARKER}.\n\n\
             Propose step 1 now. Focus on methodical, thorough testing within scope."
        );
        let mut conversation = vec![ChatMessage::user(seed)];

        loop {
            let (running, step, max) = self
                .handle
                .read(|s| (s.auto.auto_mode, s.auto.current_step, s.auto.max_steps));
            if !running || step >= max {
                break;
            }
            let step = self.handle.mutate_volatile(|s| {
                s.auto.current_step += 1;
                s.auto.current_step
            });

            match self.run_step(&mut conversation, step).await {
                StepOutcome::Continue => {
                    conversation.push(ChatMessage::user(format!(
                        "Propose step {} of the autonomous testing plan. Review what you've \
                         found so far and describe the next logical action. Steps completed: \
                         {step}/{max}",
                        step + 1
                    )));
                }
                StepOutcome::PhaseComplete => break,
                StepOutcome::Aborted => {
                    self.finish_autonomous();
                    return;
                }
            }
        }

        let (step, max) = self
            .handle
            .read(|s| (s.auto.current_step, s.auto.max_steps));
        self.broadcast(EventKind::AutoStatus {
            message: "Autonomous testing completed".into(),
            step: Some(step),
            max_steps: Some(max),
        });
        self.finish_autonomous();
    }

    /// Playbook loop: one seeded conversation per phase, each phase bounded
    /// by its own step budget or the phase-complete marker.
    pub async fn run_playbook(mut self, playbook: Playbook) {
        self.autonomous = true;
        let phase_count = playbook.phases.len() as u32;

        self.broadcast(EventKind::AutoStatus {
            message: format!("Starting playbook: {}", playbook.name),
            step: Some(0),
            max_steps: Some(self.handle.read(|s| s.auto.max_steps)),
        });

        for (idx, phase) in playbook.phases.iter().enumerate() {
            if self.stopped() {
                self.finish_autonomous();
                return;
            }
            self.broadcast(EventKind::AutoPhaseChanged {
                phase_number: idx as u32 + 1,
                phase_count,
                phase_name: phase.name.clone(),
                phase_goal: phase.goal.clone(),
            });

            let tools_hint = if phase.tools_hint.is_empty() {
                String::new()
            } else {
                format!("\nSUGGESTED TOOLS: {}", phase.tools_hint.join(", "))
            };
            let seed = format!(
                "You are executing phase {}/{} of the \"{}\" playbook.\n\n\
                 PHASE: {}\nGOAL: {}{tools_hint}\nSTEP BUDGET: {}\n\n\
                 Each step has two phases: first PROPOSE the next action without calling \
                 tools; after approval you will EXECUTE it. When the phase goal is met, \
                 reply with the single line {PHASE_COMPLETE_MARKER}.\n\n\
                 Propose the first step now.",
                idx + 1,
                phase_count,
                playbook.name,
                phase.name,
                phase.goal,
                phase.max_steps,
            );
            let mut conversation = vec![ChatMessage::user(seed)];

            for _ in 0..phase.max_steps {
                if self.stopped() {
                    self.finish_autonomous();
                    return;
                }
                let step = self.handle.mutate_volatile(|s| {
                    s.auto.current_step += 1;
                    s.auto.current_step
                });
                match self.run_step(&mut conversation, step).await {
                    StepOutcome::Continue => {
                        conversation.push(ChatMessage::user(
                            "Propose the next step of this phase, building on the results so \
                             far."
                                .to_string(),
                        ));
                    }
                    StepOutcome::PhaseComplete => break,
                    StepOutcome::Aborted => {
                        self.finish_autonomous();
                        return;
                    }
                }
            }
        }

        self.broadcast(EventKind::AutoStatus {
            message: "Playbook completed".into(),
            step: Some(self.handle.read(|s| s.auto.current_step)),
            max_steps: Some(self.handle.read(|s| s.auto.max_steps)),
        });
        self.finish_autonomous();
    }

    fn finish_autonomous(&self) {
        let was_running = self.handle.mutate_volatile(|s| {
            let was_running = s.auto.auto_mode;
            s.stop_autonomous();
            was_running
        });
        // The stop endpoint already announced the change when it cleared
        // the flag; only self-terminating runs announce it here.
        if was_running {
            self.broadcast(EventKind::AutoModeChanged {
                enabled: false,
                objective: None,
                max_steps: None,
            });
        }
    }

    /// One autonomous step: propose (no tools), approval gate, execute
    /// (tools). Returns how the outer loop should proceed.
    async fn run_step(&self, conversation: &mut Vec<ChatMessage>, step: u32) -> StepOutcome {
        let max_steps = self.handle.read(|s| s.auto.max_steps);

        // ── Propose phase (model cannot call tools) ────────────────
        if self.stopped() {
            return StepOutcome::Aborted;
        }
        let proposal = match self.llm(conversation, false).await {
            Ok(content) => joined_text(&content),
            Err(e) => {
                self.broadcast(EventKind::AutoStatus {
                    message: format!("LLM call failed: {e}"),
                    step: Some(step),
                    max_steps: Some(max_steps),
                });
                return StepOutcome::Aborted;
            }
        };
        if self.stopped() {
            return StepOutcome::Aborted;
        }
        conversation.push(ChatMessage::assistant(&proposal));

        if proposal.contains(PHASE_COMPLETE_MARKER) {
            self.broadcast(EventKind::AutoStatus {
                message: proposal,
                step: Some(step),
                max_steps: Some(max_steps),
            });
            return StepOutcome::PhaseComplete;
        }

        // ── Approval gate ──────────────────────────────────────────
        let step_id = tal_sessions::tiny_id();
        let auto_approve = self.handle.read(|s| s.auto.auto_approve);

        self.handle.mutate_volatile(|s| {
            s.set_pending_approval(PendingApproval {
                step_id: step_id.clone(),
                step_number: step,
                description: preview(&proposal, 500).to_string(),
                tool_calls: vec![],
                approved: auto_approve.then_some(true),
                resolved: auto_approve,
            });
        });
        self.broadcast(EventKind::AutoStepPending {
            step_id: step_id.clone(),
            step_number: step,
            description: proposal.clone(),
            tool_calls: vec![],
            auto_approved: auto_approve.then_some(true),
        });

        if auto_approve {
            self.broadcast(EventKind::AutoStepDecision {
                step_id: step_id.clone(),
                approved: true,
            });
        } else if let Some(outcome) = self.wait_step_approval(conversation, &step_id, step).await
        {
            return outcome;
        }

        // ── Execute phase (tools enabled) ──────────────────────────
        conversation.push(ChatMessage::user(
            "Approved. Now execute exactly the step you proposed, using the available tools. \
             When its actions are complete, summarize the results.",
        ));

        let mut step_tool_calls: Vec<Value> = Vec::new();
        let mut summary = String::new();

        for _ in 0..self.state.config.agent.max_tool_loops {
            if self.stopped() {
                return StepOutcome::Aborted;
            }
            let content = match self.llm(conversation, true).await {
                Ok(content) => content,
                Err(e) => {
                    self.broadcast(EventKind::AutoStatus {
                        message: format!("LLM call failed: {e}"),
                        step: Some(step),
                        max_steps: Some(max_steps),
                    });
                    return StepOutcome::Aborted;
                }
            };
            if self.stopped() {
                return StepOutcome::Aborted;
            }

            for block in &content {
                if let ContentBlock::Text { text } = block {
                    if !text.trim().is_empty() {
                        summary = text.clone();
                        self.broadcast(EventKind::AutoStatus {
                            message: text.clone(),
                            step: Some(step),
                            max_steps: Some(max_steps),
                        });
                    }
                }
            }

            let uses: Vec<(String, String, Value)> = tool_uses(&content)
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();
            if uses.is_empty() {
                conversation.push(ChatMessage::assistant_blocks(content));
                break;
            }

            conversation.push(ChatMessage::assistant_blocks(content));
            let mut results = Vec::new();
            for (id, name, input) in uses {
                if self.stopped() {
                    return StepOutcome::Aborted;
                }
                let result = self.execute_tool_call(&name, &input).await;
                step_tool_calls.push(json!({
                    "tool": name,
                    "input": input,
                    "result_preview": preview(&result, 500),
                }));
                results.push((id, result));
                // The subprocess was allowed to finish and its result is
                // delivered; a stop request takes effect from here on.
                if self.stopped() {
                    conversation.push(ChatMessage::tool_results(results));
                    return StepOutcome::Aborted;
                }
            }
            conversation.push(ChatMessage::tool_results(results));
        }

        self.broadcast(EventKind::AutoStepComplete {
            step_id,
            step_number: step,
            summary: preview(&summary, 500).to_string(),
            tool_calls: step_tool_calls,
        });
        StepOutcome::Continue
    }

    /// Poll the step gate until it resolves or times out, draining queued
    /// operator messages into conversational replies while waiting.
    /// Returns `Some(outcome)` when the step must not execute.
    async fn wait_step_approval(
        &self,
        conversation: &mut Vec<ChatMessage>,
        step_id: &str,
        step: u32,
    ) -> Option<StepOutcome> {
        let deadline = std::time::Instant::now()
            + Duration::from_secs(self.state.config.agent.step_approval_timeout_sec);

        loop {
            if self.stopped() {
                return Some(StepOutcome::Aborted);
            }

            // Operator messages queued mid-gate get conversational replies.
            while let Some(msg) = self
                .handle
                .mutate_volatile(|s| s.auto.operator_queue.pop_front())
            {
                conversation.push(ChatMessage::user(&msg));
                match self.llm(conversation, false).await {
                    Ok(content) => {
                        let reply = joined_text(&content);
                        conversation.push(ChatMessage::assistant(&reply));
                        self.broadcast(EventKind::AutoAiReply { message: reply });
                    }
                    Err(e) => {
                        self.broadcast(EventKind::AutoStatus {
                            message: format!("LLM call failed: {e}"),
                            step: Some(step),
                            max_steps: None,
                        });
                        return Some(StepOutcome::Aborted);
                    }
                }
            }

            let decision = self.handle.read(|s| {
                s.auto
                    .pending_approval
                    .as_ref()
                    .filter(|p| p.step_id == step_id && p.resolved)
                    .map(|p| p.approved.unwrap_or(false))
            });
            match decision {
                Some(true) => return None,
                Some(false) => {
                    self.broadcast(EventKind::AutoStatus {
                        message: format!(
                            "Step {step} rejected by tester - stopping autonomous mode"
                        ),
                        step: Some(step),
                        max_steps: None,
                    });
                    return Some(StepOutcome::Aborted);
                }
                None => {}
            }

            if std::time::Instant::now() >= deadline {
                self.broadcast(EventKind::AutoStatus {
                    message: "Approval timeout - stopping autonomous mode".into(),
                    step: Some(step),
                    max_steps: None,
                });
                return Some(StepOutcome::Aborted);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

fn preview(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{harness, text_response, tool_use_response, Harness};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn make_session(h: &Harness, scope: &[&str]) -> String {
        let handle = h.state.sessions.create(
            "test-engagement".into(),
            scope.iter().map(|s| s.to_string()).collect(),
            String::new(),
            None,
        );
        handle.read(|s| s.id.clone())
    }

    fn drain(rx: &mut UnboundedReceiver<Value>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            events.push(evt);
        }
        events
    }

    fn event_types(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .map(|e| e["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    async fn wait_until<F: Fn() -> bool>(cond: F, timeout_ms: u64) -> bool {
        let deadline =
            std::time::Instant::now() + Duration::from_millis(timeout_ms);
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    // ── S1: chat scope block ────────────────────────────────────────

    #[tokio::test]
    async fn chat_blocks_out_of_scope_target() {
        let h = harness(vec![
            tool_use_response(
                "Scanning evil.com.",
                "tu_1",
                "execute_tool",
                json!({"tool": "nmap", "parameters": {"target": "evil.com"}}),
            ),
            text_response("That target is out of scope."),
        ]);
        let session_id = make_session(&h, &["example.com"]);

        let driver = AgentDriver::new(h.state.clone(), &session_id, None).unwrap();
        let outcome = driver.chat("run nmap on evil.com").await.unwrap();
        assert_eq!(outcome.content, "That target is out of scope.");

        // No subprocess was spawned.
        assert!(h.state.tasks.list().is_empty());

        // The tool result fed back to the model is the violation message.
        let requests = h.llm.requests.lock();
        let second = serde_json::to_string(&requests[1].messages).unwrap();
        assert!(second.contains(
            "[SCOPE VIOLATION] Target 'evil.com' is outside the defined engagement scope."
        ));

        // The violation is also logged on the session event log.
        let handle = h.state.sessions.get(&session_id).unwrap();
        handle.read(|s| {
            let blocked = s
                .events
                .iter()
                .find(|e| e.event_type == "tool_result")
                .unwrap();
            assert_eq!(blocked.data["scope_violation"], true);
        });
    }

    // ── S2: chat credential confinement ─────────────────────────────

    #[tokio::test]
    async fn chat_credentials_never_reach_the_model() {
        let h = harness(vec![text_response("Understood, credentials stored.")]);
        let session_id = make_session(&h, &["10.0.0.0/24"]);
        let driver = AgentDriver::new(h.state.clone(), &session_id, None).unwrap();

        driver
            .chat("login to 10.0.0.5 with password=[[hunter2]]")
            .await
            .unwrap();

        // The persisted transcript holds the token, never the credential.
        let handle = h.state.sessions.get(&session_id).unwrap();
        let token = handle.read(|s| {
            assert!(!s.messages[0].content.contains("hunter2"));
            let start = s.messages[0].content.find("[[__CRED_").unwrap();
            let end = s.messages[0].content[start..].find("__]]").unwrap() + start + 4;
            s.messages[0].content[start..end].to_string()
        });

        // Second turn: the model echoes the token into a command.
        h.llm.push(tool_use_response(
            "Logging in.",
            "tu_1",
            "execute_bash",
            json!({"command": format!("echo secret={token}")}),
        ));
        h.llm.push(text_response("Done."));
        driver.chat("go ahead").await.unwrap();

        // The subprocess saw the real value (echo printed it).
        let task = &h.state.tasks.list()[0];
        assert!(task.output.contains("secret=hunter2"));
        // The recorded command stays tokenized.
        assert!(task.command.contains(&token));
        assert!(!task.command.contains("hunter2"));

        // No outbound LLM request ever carried the raw credential.
        for req in h.llm.requests.lock().iter() {
            let serialized = serde_json::to_string(&req.messages).unwrap();
            assert!(!serialized.contains("hunter2"), "leaked: {serialized}");
        }
    }

    // ── S3: autonomous single step ──────────────────────────────────

    #[tokio::test]
    async fn autonomous_single_step_event_sequence() {
        let h = harness(vec![
            text_response("I will enumerate subdomains of example.com with subfinder."),
            tool_use_response(
                "Running subfinder.",
                "tu_1",
                "execute_tool",
                json!({"tool": "subfinder", "parameters": {"raw_args": "-d example.com -silent"}}),
            ),
            text_response("Enumeration finished; two subdomains found."),
        ]);
        let session_id = make_session(&h, &["example.com"]);
        let (_sub, mut rx) = h.state.bus.subscribe(&session_id, "alice".into());

        let handle = h.state.sessions.get(&session_id).unwrap();
        handle.mutate_volatile(|s| {
            s.begin_autonomous("list subdomains of example.com".into(), 1, false)
        });

        let driver = AgentDriver::new(h.state.clone(), &session_id, None).unwrap();
        let state = h.state.clone();
        let sid = session_id.clone();
        let join = tokio::spawn(driver.run_autonomous());

        // Operator approves once the gate appears (as the endpoint would).
        let approved = wait_until(
            || {
                let handle = state.sessions.get(&sid).unwrap();
                let step_id = handle.read(|s| {
                    s.auto
                        .pending_approval
                        .as_ref()
                        .filter(|p| !p.resolved)
                        .map(|p| p.step_id.clone())
                });
                if let Some(step_id) = step_id {
                    handle.mutate_volatile(|s| s.resolve_approval(&step_id, true));
                    state.bus.broadcast(
                        &sid,
                        EventKind::AutoStepDecision {
                            step_id,
                            approved: true,
                        },
                    );
                    true
                } else {
                    false
                }
            },
            5_000,
        )
        .await;
        assert!(approved, "approval gate never appeared");

        join.await.unwrap();

        let kinds = drain(&mut rx);
        let types = event_types(&kinds);
        let order = [
            "auto_status",        // starting
            "auto_step_pending",
            "auto_step_decision",
            "tool_start",
            "tool_result",
            "auto_step_complete",
            "auto_mode_changed",  // disabled at loop end
        ];
        let mut cursor = 0;
        for expected in order {
            let found = types[cursor..].iter().position(|t| t == expected);
            assert!(found.is_some(), "missing {expected} in {types:?}");
            cursor += found.unwrap() + 1;
        }

        handle.read(|s| {
            assert!(!s.auto.auto_mode);
            assert_eq!(s.auto.current_step, 1);
        });
    }

    // ── S6: cooperative cancellation mid-run ────────────────────────

    #[tokio::test]
    async fn stop_during_tool_lets_subprocess_finish_then_exits() {
        let h = harness(vec![
            text_response("I will probe the host."),
            tool_use_response(
                "Probing.",
                "tu_1",
                "execute_bash",
                json!({"command": "sleep 0.5; echo probe-done"}),
            ),
        ]);
        let session_id = make_session(&h, &[]);
        let handle = h.state.sessions.get(&session_id).unwrap();
        handle.mutate_volatile(|s| s.begin_autonomous("probe".into(), 3, true));

        let driver = AgentDriver::new(h.state.clone(), &session_id, None).unwrap();
        let join = tokio::spawn(driver.run_autonomous());

        // Stop autonomous mode while the subprocess is still running.
        let started = wait_until(|| !h.state.tasks.list().is_empty(), 5_000).await;
        assert!(started, "tool never started");
        handle.mutate_volatile(|s| s.auto.auto_mode = false);

        join.await.unwrap();

        // The subprocess ran to completion; it was not killed.
        let task = &h.state.tasks.list()[0];
        assert_eq!(task.status, tal_tools::TaskStatus::Completed);
        assert!(task.output.contains("probe-done"));

        // No further LLM call was made after the stop.
        assert_eq!(h.llm.requests.lock().len(), 2);
    }

    // ── Operator-message drain during approval ──────────────────────

    #[tokio::test]
    async fn queued_operator_messages_get_replies_during_gate() {
        let h = harness(vec![
            text_response("I propose scanning the main host."),
            text_response("Good question — I chose nmap for service detection."),
            text_response("Executed nothing further."),
        ]);
        let session_id = make_session(&h, &[]);
        let (_sub, mut rx) = h.state.bus.subscribe(&session_id, "alice".into());
        let handle = h.state.sessions.get(&session_id).unwrap();
        handle.mutate_volatile(|s| s.begin_autonomous("scan".into(), 1, false));

        let driver = AgentDriver::new(h.state.clone(), &session_id, None).unwrap();
        let join = tokio::spawn(driver.run_autonomous());

        let gated = wait_until(
            || handle.read(|s| s.auto.pending_approval.is_some()),
            5_000,
        )
        .await;
        assert!(gated);

        // Operator asks a question mid-gate, then approves.
        handle.mutate_volatile(|s| s.auto.operator_queue.push_back("why nmap?".into()));
        let replied = wait_until(|| h.llm.requests.lock().len() >= 2, 5_000).await;
        assert!(replied, "queued message was never drained");

        handle.mutate_volatile(|s| {
            let step_id = s.auto.pending_approval.as_ref().unwrap().step_id.clone();
            s.resolve_approval(&step_id, true)
        });
        join.await.unwrap();

        let types = event_types(&drain(&mut rx));
        assert!(types.iter().any(|t| t == "auto_ai_reply"));
    }

    // ── Playbook loop ───────────────────────────────────────────────

    #[tokio::test]
    async fn playbook_phase_completes_on_marker() {
        let h = harness(vec![
            text_response("I will enumerate subdomains first."),
            text_response("Subdomains enumerated."),
            text_response("PHASE COMPLETE"),
        ]);
        let session_id = make_session(&h, &[]);
        let (_sub, mut rx) = h.state.bus.subscribe(&session_id, "alice".into());
        let handle = h.state.sessions.get(&session_id).unwrap();
        handle.mutate_volatile(|s| s.begin_autonomous("recon".into(), 5, true));

        let playbook = tal_sessions::Playbook {
            id: "web-recon".into(),
            name: "Web Recon".into(),
            description: String::new(),
            category: "recon".into(),
            phases: vec![tal_sessions::PlaybookPhase {
                name: "Subdomain Discovery".into(),
                goal: "Enumerate subdomains".into(),
                tools_hint: vec!["subfinder".into()],
                max_steps: 5,
            }],
        };

        let driver = AgentDriver::new(h.state.clone(), &session_id, None).unwrap();
        driver.run_playbook(playbook).await;

        let types = event_types(&drain(&mut rx));
        assert!(types.iter().any(|t| t == "auto_phase_changed"));
        // The marker ended the phase before the step budget was spent.
        handle.read(|s| assert_eq!(s.auto.current_step, 2));
    }

    // ── Approval rejection ──────────────────────────────────────────

    #[tokio::test]
    async fn rejected_step_stops_autonomous_mode() {
        let h = harness(vec![text_response("I propose something invasive.")]);
        let session_id = make_session(&h, &[]);
        let (_sub, mut rx) = h.state.bus.subscribe(&session_id, "alice".into());
        let handle = h.state.sessions.get(&session_id).unwrap();
        handle.mutate_volatile(|s| s.begin_autonomous("test".into(), 3, false));

        let driver = AgentDriver::new(h.state.clone(), &session_id, None).unwrap();
        let join = tokio::spawn(driver.run_autonomous());

        let gated = wait_until(
            || handle.read(|s| s.auto.pending_approval.is_some()),
            5_000,
        )
        .await;
        assert!(gated);
        handle.mutate_volatile(|s| {
            let step_id = s.auto.pending_approval.as_ref().unwrap().step_id.clone();
            s.resolve_approval(&step_id, false)
        });
        join.await.unwrap();

        handle.read(|s| assert!(!s.auto.auto_mode));
        let types = event_types(&drain(&mut rx));
        assert!(types.iter().any(|t| t == "auto_mode_changed"));
        // No execute phase ran.
        assert_eq!(h.llm.requests.lock().len(), 1);
    }

    // ── record_finding dispatch ─────────────────────────────────────

    #[tokio::test]
    async fn record_finding_appends_and_broadcasts() {
        let h = harness(vec![
            tool_use_response(
                "Recording.",
                "tu_1",
                "record_finding",
                json!({
                    "severity": "high",
                    "title": "Exposed admin panel",
                    "description": "No auth on /admin",
                    "evidence": "HTTP 200",
                }),
            ),
            text_response("Recorded."),
        ]);
        let session_id = make_session(&h, &[]);
        let (_sub, mut rx) = h.state.bus.subscribe(&session_id, "alice".into());

        let driver = AgentDriver::new(h.state.clone(), &session_id, None).unwrap();
        let outcome = driver.chat("note the admin panel").await.unwrap();
        assert!(outcome.tool_calls[0]["result_preview"]
            .as_str()
            .unwrap()
            .contains("[HIGH] Exposed admin panel"));

        let handle = h.state.sessions.get(&session_id).unwrap();
        handle.read(|s| assert_eq!(s.findings.len(), 1));
        let types = event_types(&drain(&mut rx));
        assert!(types.iter().any(|t| t == "new_finding"));
    }

    // ── add_to_scope gate ───────────────────────────────────────────

    #[tokio::test]
    async fn add_to_scope_merges_on_approval() {
        let h = harness(vec![
            tool_use_response(
                "Requesting scope addition.",
                "tu_1",
                "add_to_scope",
                json!({"hosts": ["api.example.com"], "reason": "found in cert SAN"}),
            ),
            text_response("Scope extended."),
        ]);
        let session_id = make_session(&h, &["example.com"]);
        let handle = h.state.sessions.get(&session_id).unwrap();

        let driver = AgentDriver::new(h.state.clone(), &session_id, None).unwrap();
        let chat = tokio::spawn(async move { driver.chat("add the api host").await });

        let pending = wait_until(
            || handle.read(|s| !s.auto.scope_approvals.is_empty()),
            5_000,
        )
        .await;
        assert!(pending);
        handle.mutate_volatile(|s| {
            let id = s.auto.scope_approvals[0].approval_id.clone();
            s.resolve_scope_approval(&id, true)
        });

        chat.await.unwrap().unwrap();
        handle.read(|s| {
            assert!(s.target_scope.contains(&"api.example.com".to_string()));
        });
    }
}
