//! Client records: who the engagement is for, contacts, and asset inventory.
//!
//! Loaded from `clients.json` at startup so sessions can reference a
//! `client_id`. Management endpoints live outside the core.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tal_domain::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    pub id: String,
    pub value: String,
    /// domain | ip | cidr | url | wildcard | other
    #[serde(default = "d_other")]
    pub asset_type: String,
    #[serde(default)]
    pub label: String,
    pub added_at: DateTime<Utc>,
}

fn d_other() -> String {
    "other".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Client {
    pub id: String,
    pub name: String,
    /// Free-form contact records: `{name, email, phone, role}`.
    #[serde(default)]
    pub contacts: Vec<serde_json::Value>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
    pub created_at: DateTime<Utc>,
}

pub struct ClientStore {
    path: PathBuf,
    clients: RwLock<Vec<Client>>,
}

impl ClientStore {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("clients.json");
        let clients = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Vec::new()
        };
        tracing::info!(count = clients.len(), "clients loaded");
        Ok(Self {
            path,
            clients: RwLock::new(clients),
        })
    }

    pub fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().iter().find(|c| c.id == id).cloned()
    }

    pub fn list(&self) -> Vec<Client> {
        self.clients.read().clone()
    }

    pub fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.clients.read())?;
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
    }
}
