use std::sync::Arc;

use tal_domain::config::Config;
use tal_providers::LlmClient;
use tal_sessions::{ClientStore, PlaybookStore, SessionStore, UserStore};
use tal_tools::{Executor, TaskRegistry, ToolRegistry};

use crate::runtime::bus::EventBus;
use crate::runtime::redact::{Redactor, Tokenizer};
use crate::runtime::schedules::JobStore;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core** — config, LLM client
/// - **Engagements** — sessions, clients, users, playbooks
/// - **Execution** — tool catalog, executor, task registry
/// - **Runtime** — schedules, event bus, credential filters
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub llm: Arc<dyn LlmClient>,

    // ── Engagements ───────────────────────────────────────────────────
    pub sessions: Arc<SessionStore>,
    pub clients: Arc<ClientStore>,
    pub users: Arc<UserStore>,
    pub playbooks: Arc<PlaybookStore>,

    // ── Execution ─────────────────────────────────────────────────────
    pub tools: Arc<ToolRegistry>,
    pub executor: Arc<Executor>,
    pub tasks: Arc<TaskRegistry>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub jobs: Arc<JobStore>,
    pub bus: Arc<EventBus>,
    /// Ingress credential tokenizer (compiled once at startup).
    pub tokenizer: Arc<Tokenizer>,
    /// Egress output redactor (compiled once at startup).
    pub redactor: Arc<Redactor>,
}
