//! Session event vocabulary.
//!
//! Everything a websocket subscriber can receive. The `type` tag and the
//! payload fields are the wire contract with the UI; the timestamp is
//! stamped at broadcast time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use tal_sessions::Finding;

#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    pub fn now(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PresenceUpdate {
        users: Vec<String>,
    },
    ToolStart {
        tool: String,
        task_id: String,
        parameters: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    ToolResult {
        tool: String,
        task_id: String,
        result: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    NewFinding {
        finding: Finding,
    },
    AutoModeChanged {
        enabled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        objective: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_steps: Option<u32>,
    },
    AutoStatus {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_steps: Option<u32>,
    },
    AutoStepPending {
        step_id: String,
        step_number: u32,
        description: String,
        tool_calls: Vec<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        auto_approved: Option<bool>,
    },
    AutoStepDecision {
        step_id: String,
        approved: bool,
    },
    AutoStepComplete {
        step_id: String,
        step_number: u32,
        summary: String,
        tool_calls: Vec<Value>,
    },
    AutoPhaseChanged {
        phase_number: u32,
        phase_count: u32,
        phase_name: String,
        phase_goal: String,
    },
    AutoAiReply {
        message: String,
    },
    ScopeAdditionPending {
        approval_id: String,
        hosts: Vec<String>,
        reason: String,
    },
    ScopeUpdated {
        added: Vec<String>,
        target_scope: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ChatMessage {
        role: String,
        content: String,
        tool_calls: Vec<Value>,
    },
}
