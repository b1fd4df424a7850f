//! Operator accounts, loaded from `users.json`.
//!
//! Authentication happens in the fronting auth layer; the gateway only needs
//! the table to resolve operator display names for presence and event
//! attribution, and to refuse disabled accounts on the websocket.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tal_domain::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub username: String,
    /// admin | operator | viewer
    #[serde(default = "d_operator")]
    pub role: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub email: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "d_true")]
    pub enabled: bool,
}

fn d_operator() -> String {
    "operator".into()
}

fn d_true() -> bool {
    true
}

pub struct UserStore {
    #[allow(dead_code)]
    path: PathBuf,
    users: RwLock<Vec<User>>,
}

impl UserStore {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("users.json");
        let users: Vec<User> = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Vec::new()
        };
        tracing::info!(count = users.len(), "users loaded");
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    pub fn get(&self, username: &str) -> Option<User> {
        self.users
            .read()
            .iter()
            .find(|u| u.username == username)
            .cloned()
    }

    /// Display name for an enabled account; falls back to the username for
    /// unknown accounts (the auth layer already vouched for the token).
    pub fn display_name(&self, username: &str) -> Option<String> {
        match self.get(username) {
            Some(u) if !u.enabled => None,
            Some(u) if !u.display_name.is_empty() => Some(u.display_name),
            Some(u) => Some(u.username),
            None => Some(username.to_string()),
        }
    }
}
