//! Session data model.
//!
//! The persisted projection covers identity, scope, the message/event logs,
//! and findings. Autonomous runtime state and the credential vault are
//! volatile: they are rebuilt empty on every load and must never reach disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

use crate::vault::CredentialVault;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Log entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Findings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "info" | "informational" => Some(Self::Info),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub evidence: String,
    pub timestamp: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Autonomous runtime (volatile)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A serialized human-in-the-loop gate for one autonomous step.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub step_id: String,
    pub step_number: u32,
    pub description: String,
    pub tool_calls: Vec<Value>,
    pub approved: Option<bool>,
    pub resolved: bool,
}

/// A pending scope-addition request raised by the agent.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeApproval {
    pub approval_id: String,
    pub hosts: Vec<String>,
    pub reason: String,
    pub approved: Option<bool>,
    pub resolved: bool,
}

#[derive(Debug, Default)]
pub struct AutoState {
    pub auto_mode: bool,
    pub objective: String,
    pub max_steps: u32,
    pub current_step: u32,
    pub auto_approve: bool,
    pub pending_approval: Option<PendingApproval>,
    pub scope_approvals: Vec<ScopeApproval>,
    /// Operator chat received while a step approval is pending.
    pub operator_queue: VecDeque<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub target_scope: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<LogMessage>,
    #[serde(default)]
    pub events: Vec<LogEvent>,
    #[serde(default)]
    pub findings: Vec<Finding>,

    #[serde(skip)]
    pub auto: AutoState,
    #[serde(skip)]
    pub vault: CredentialVault,
}

impl Session {
    pub fn new(name: String, target_scope: Vec<String>, notes: String, client_id: Option<String>) -> Self {
        Self {
            id: crate::short_id(),
            name,
            target_scope,
            notes,
            client_id,
            created_at: Utc::now(),
            messages: Vec::new(),
            events: Vec::new(),
            findings: Vec::new(),
            auto: AutoState::default(),
            vault: CredentialVault::default(),
        }
    }

    pub fn add_message(&mut self, role: &str, content: &str, user: Option<String>) {
        self.messages.push(LogMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            user,
        });
    }

    pub fn add_event(&mut self, event_type: &str, data: Value, user: Option<String>) {
        self.events.push(LogEvent {
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
            user,
        });
    }

    pub fn add_finding(
        &mut self,
        severity: Severity,
        title: &str,
        description: &str,
        evidence: &str,
    ) -> Finding {
        let finding = Finding {
            id: crate::tiny_id(),
            severity,
            title: title.to_string(),
            description: description.to_string(),
            evidence: evidence.to_string(),
            timestamp: Utc::now(),
        };
        self.findings.push(finding.clone());
        finding
    }

    /// The trailing window of chat messages sent to the LLM.
    pub fn chat_history(&self, window: usize) -> &[LogMessage] {
        let start = self.messages.len().saturating_sub(window);
        &self.messages[start..]
    }

    /// Engagement context injected into the system prompt: scope, notes,
    /// recent tool results, and the findings recorded so far.
    pub fn context_summary(&self) -> String {
        let scope = if self.target_scope.is_empty() {
            "Not defined".to_string()
        } else {
            self.target_scope.join(", ")
        };

        let recent: Vec<String> = self
            .events
            .iter()
            .rev()
            .take(20)
            .filter(|e| e.event_type == "tool_result")
            .map(|e| {
                let tool = e.data.get("tool").and_then(|v| v.as_str()).unwrap_or("tool");
                let output = e.data.get("output").and_then(|v| v.as_str()).unwrap_or("");
                format!("[{tool}] {}", truncate(output, 500))
            })
            .collect();
        let results = if recent.is_empty() {
            "No tools executed yet.".to_string()
        } else {
            recent.into_iter().rev().collect::<Vec<_>>().join("\n")
        };

        let findings = if self.findings.is_empty() {
            "No findings recorded yet.".to_string()
        } else {
            self.findings
                .iter()
                .map(|f| {
                    format!(
                        "- [{}] {}: {}",
                        f.severity.as_str().to_uppercase(),
                        f.title,
                        f.description
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "ENGAGEMENT: {}\nTARGET SCOPE: {}\nNOTES: {}\n\nRECENT TOOL RESULTS:\n{}\n\nCURRENT FINDINGS:\n{}",
            self.name, scope, self.notes, results, findings
        )
    }

    /// Task ids referenced by the event log (used for artifact cleanup).
    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .events
            .iter()
            .filter_map(|e| e.data.get("task_id").and_then(|v| v.as_str()))
            .map(String::from)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    // ── Autonomous-state transitions ───────────────────────────────

    pub fn begin_autonomous(&mut self, objective: String, max_steps: u32, auto_approve: bool) {
        self.auto = AutoState {
            auto_mode: true,
            objective,
            max_steps,
            current_step: 0,
            auto_approve,
            pending_approval: None,
            scope_approvals: Vec::new(),
            operator_queue: VecDeque::new(),
        };
    }

    pub fn stop_autonomous(&mut self) {
        self.auto.auto_mode = false;
        self.auto.pending_approval = None;
        self.auto.operator_queue.clear();
    }

    /// Install the step gate. At most one approval is pending at a time;
    /// a new one replaces any resolved leftover.
    pub fn set_pending_approval(&mut self, approval: PendingApproval) {
        self.auto.pending_approval = Some(approval);
    }

    /// Resolve the pending step gate. Only the first decision for a given
    /// step id wins; later calls and mismatched ids are rejected.
    pub fn resolve_approval(&mut self, step_id: &str, approved: bool) -> bool {
        match self.auto.pending_approval.as_mut() {
            Some(p) if p.step_id == step_id && !p.resolved => {
                p.approved = Some(approved);
                p.resolved = true;
                true
            }
            _ => false,
        }
    }

    pub fn add_scope_approval(&mut self, approval: ScopeApproval) {
        self.auto.scope_approvals.push(approval);
    }

    pub fn resolve_scope_approval(&mut self, approval_id: &str, approved: bool) -> bool {
        match self
            .auto
            .scope_approvals
            .iter_mut()
            .find(|a| a.approval_id == approval_id && !a.resolved)
        {
            Some(a) => {
                a.approved = Some(approved);
                a.resolved = true;
                true
            }
            None => false,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            target_scope: self.target_scope.clone(),
            notes: self.notes.clone(),
            client_id: self.client_id.clone(),
            created_at: self.created_at,
            message_count: self.messages.len(),
            event_count: self.events.len(),
            finding_count: self.findings.len(),
            findings: self.findings.clone(),
            auto_mode: self.auto.auto_mode,
            auto_objective: self.auto.objective.clone(),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Listing view: counts instead of the full logs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub target_scope: Vec<String>,
    pub notes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    pub event_count: usize,
    pub finding_count: usize,
    pub findings: Vec<Finding>,
    pub auto_mode: bool,
    pub auto_objective: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> Session {
        Session::new("acme-q3".into(), vec!["example.com".into()], "".into(), None)
    }

    #[test]
    fn serde_round_trip_preserves_projection() {
        let mut s = session();
        s.add_message("user", "hello", Some("alice".into()));
        s.add_event("tool_result", json!({"tool": "nmap", "task_id": "abc"}), None);
        s.add_finding(Severity::High, "Open admin panel", "exposed", "curl output");

        let json = serde_json::to_string(&s).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, s.id);
        assert_eq!(back.name, s.name);
        assert_eq!(back.target_scope, s.target_scope);
        assert_eq!(back.messages, s.messages);
        assert_eq!(back.events, s.events);
        assert_eq!(back.findings, s.findings);
    }

    #[test]
    fn volatile_state_never_serialized() {
        let mut s = session();
        s.begin_autonomous("enumerate".into(), 5, false);
        s.vault.mint("hunter2");

        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("auto_mode"));
        assert!(!json.contains("vault"));

        let back: Session = serde_json::from_str(&json).unwrap();
        assert!(!back.auto.auto_mode);
        assert!(back.vault.is_empty());
    }

    #[test]
    fn approval_single_writer() {
        let mut s = session();
        s.set_pending_approval(PendingApproval {
            step_id: "s1".into(),
            step_number: 1,
            description: "scan".into(),
            tool_calls: vec![],
            approved: None,
            resolved: false,
        });

        assert!(!s.resolve_approval("other", true));
        assert!(s.resolve_approval("s1", true));
        // Second decision for the same step is a no-op.
        assert!(!s.resolve_approval("s1", false));
        let p = s.auto.pending_approval.as_ref().unwrap();
        assert_eq!(p.approved, Some(true));
    }

    #[test]
    fn scope_approval_resolution() {
        let mut s = session();
        s.add_scope_approval(ScopeApproval {
            approval_id: "a1".into(),
            hosts: vec!["new.example.com".into()],
            reason: "discovered".into(),
            approved: None,
            resolved: false,
        });
        assert!(s.resolve_scope_approval("a1", false));
        assert!(!s.resolve_scope_approval("a1", true));
    }

    #[test]
    fn context_summary_includes_recent_results_and_findings() {
        let mut s = session();
        s.add_event(
            "tool_result",
            json!({"tool": "subfinder", "output": "a.example.com"}),
            None,
        );
        s.add_finding(Severity::Low, "Banner disclosure", "nginx version", "");
        let ctx = s.context_summary();
        assert!(ctx.contains("TARGET SCOPE: example.com"));
        assert!(ctx.contains("[subfinder] a.example.com"));
        assert!(ctx.contains("[LOW] Banner disclosure"));
    }

    #[test]
    fn task_ids_deduplicated() {
        let mut s = session();
        s.add_event("tool_start", json!({"task_id": "t1"}), None);
        s.add_event("tool_result", json!({"task_id": "t1"}), None);
        s.add_event("tool_result", json!({"task_id": "t2"}), None);
        assert_eq!(s.task_ids(), vec!["t1", "t2"]);
    }

    #[test]
    fn chat_history_windows_tail() {
        let mut s = session();
        for i in 0..60 {
            s.add_message("user", &format!("m{i}"), None);
        }
        let hist = s.chat_history(50);
        assert_eq!(hist.len(), 50);
        assert_eq!(hist[0].content, "m10");
    }

    #[test]
    fn severity_parse_accepts_informational() {
        assert_eq!(Severity::parse("Informational"), Some(Severity::Info));
        assert_eq!(Severity::parse("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::parse("bogus"), None);
    }

    #[test]
    fn stop_autonomous_clears_gate_and_queue() {
        let mut s = session();
        s.begin_autonomous("obj".into(), 3, false);
        s.auto.operator_queue.push_back("status?".into());
        s.set_pending_approval(PendingApproval {
            step_id: "x".into(),
            step_number: 1,
            description: "".into(),
            tool_calls: vec![],
            approved: None,
            resolved: false,
        });
        s.stop_autonomous();
        assert!(!s.auto.auto_mode);
        assert!(s.auto.pending_approval.is_none());
        assert!(s.auto.operator_queue.is_empty());
    }
}
