//! Engagement session state: the per-session event log, findings, scope,
//! volatile autonomous runtime, the credential vault, and the singleton
//! collections loaded beside the sessions (clients, users, playbooks).

pub mod clients;
pub mod model;
pub mod playbooks;
pub mod store;
pub mod users;
pub mod vault;

pub use clients::{Client, ClientStore};
pub use model::{
    Finding, LogEvent, LogMessage, PendingApproval, ScopeApproval, Session, SessionSummary,
    Severity,
};
pub use playbooks::{Playbook, PlaybookPhase, PlaybookStore};
pub use store::{SessionHandle, SessionStore};
pub use users::{User, UserStore};
pub use vault::CredentialVault;

/// Short random identifier: the first segment of a v4 uuid.
pub fn short_id() -> String {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(12)
        .collect()
}

/// Even shorter id used for findings, tasks, and approval steps.
pub fn tiny_id() -> String {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect()
}
