//! Playbooks: ordered phase lists guiding autonomous execution.
//!
//! Each playbook is a YAML file in the playbooks directory. Editing happens
//! outside the core; the loader validates and fills defaults.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tal_domain::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybookPhase {
    #[serde(default = "d_phase_name")]
    pub name: String,
    #[serde(default)]
    pub goal: String,
    /// Tools the phase prompt suggests to the model.
    #[serde(default)]
    pub tools_hint: Vec<String>,
    #[serde(default = "d_phase_steps")]
    pub max_steps: u32,
}

fn d_phase_name() -> String {
    "Unnamed Phase".into()
}

fn d_phase_steps() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Playbook {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "d_category")]
    pub category: String,
    pub phases: Vec<PlaybookPhase>,
}

fn d_category() -> String {
    "general".into()
}

pub struct PlaybookStore {
    #[allow(dead_code)]
    dir: PathBuf,
    playbooks: RwLock<Vec<Playbook>>,
}

impl PlaybookStore {
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut playbooks = Vec::new();
        if dir.is_dir() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    )
                })
                .collect();
            paths.sort();
            for path in paths {
                match load_one(&path) {
                    Some(pb) => {
                        if !playbooks.iter().any(|p: &Playbook| p.id == pb.id) {
                            playbooks.push(pb);
                        }
                    }
                    None => {
                        tracing::warn!(path = %path.display(), "skipping invalid playbook");
                    }
                }
            }
        }
        playbooks.sort_by(|a, b| (a.category.clone(), a.name.clone()).cmp(&(b.category.clone(), b.name.clone())));
        tracing::info!(count = playbooks.len(), "playbooks loaded");
        Ok(Self {
            dir,
            playbooks: RwLock::new(playbooks),
        })
    }

    pub fn get(&self, id: &str) -> Option<Playbook> {
        self.playbooks.read().iter().find(|p| p.id == id).cloned()
    }

    pub fn list(&self) -> Vec<Playbook> {
        self.playbooks.read().clone()
    }
}

fn load_one(path: &Path) -> Option<Playbook> {
    let raw = std::fs::read_to_string(path).ok()?;
    let mut pb: Playbook = serde_yaml::from_str(&raw).ok()?;
    if pb.phases.is_empty() {
        return None;
    }
    if pb.name.is_empty() {
        pb.name = pb.id.clone();
    }
    Some(pb)
}
