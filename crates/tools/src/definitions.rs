//! Tool definition registry.
//!
//! Definitions live in a single YAML file with a `tools:` root mapping and
//! are loaded into an ordered in-memory map at startup. Every mutation is
//! written back through write-temp + rename so a crash never corrupts the
//! catalog. The synthetic `bash` entry is reserved and cannot be mutated.

use std::path::PathBuf;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tal_domain::{Error, Result};

/// Reserved name for the verbatim shell passthrough.
pub const BASH_TOOL: &str = "bash";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definition model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a single parameter is rendered onto the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParamDef {
    /// Flag emitted before the value (empty for positional/raw parameters).
    #[serde(default)]
    pub flag: String,
    /// "string" | "integer" | "boolean".
    #[serde(default = "d_string", rename = "type")]
    pub param_type: String,
    /// Value is piped to the child's stdin instead of the argv.
    #[serde(default, skip_serializing_if = "is_false")]
    pub stdin: bool,
    /// Value is appended after all flagged arguments.
    #[serde(default, skip_serializing_if = "is_false")]
    pub positional: bool,
    /// Free-form passthrough: boolean true emits `flag`, anything else is
    /// emitted verbatim with no flag.
    #[serde(default, skip_serializing_if = "is_false")]
    pub raw_flag: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn d_string() -> String {
    "string".into()
}

fn is_false(v: &bool) -> bool {
    !v
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub risk_level: String,
    pub binary: String,
    #[serde(default)]
    pub default_args: Vec<String>,
    #[serde(default)]
    pub parameters: IndexMap<String, ParamDef>,
}

/// On-disk shape: `tools:` root mapping, name → definition.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    tools: IndexMap<String, ToolDefinition>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolRegistry {
    path: PathBuf,
    tools: RwLock<IndexMap<String, ToolDefinition>>,
}

impl ToolRegistry {
    /// Load the catalog from `path`. A missing file yields an empty catalog.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tools = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let catalog: CatalogFile =
                serde_yaml::from_str(&raw).map_err(|e| Error::Yaml(e.to_string()))?;
            catalog.tools
        } else {
            IndexMap::new()
        };
        tracing::info!(count = tools.len(), path = %path.display(), "tool definitions loaded");
        Ok(Self {
            path,
            tools: RwLock::new(tools),
        })
    }

    pub fn get(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        name == BASH_TOOL || self.tools.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<ToolDefinition> {
        self.tools.read().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.read().keys().cloned().collect()
    }

    /// Add a new definition. Rejects the reserved name, duplicates, and
    /// definitions without a binary.
    pub fn insert(&self, def: ToolDefinition) -> Result<()> {
        validate_definition(&def)?;
        {
            let mut tools = self.tools.write();
            if tools.contains_key(&def.name) {
                return Err(Error::InvalidInput(format!(
                    "tool '{}' already exists",
                    def.name
                )));
            }
            tools.insert(def.name.clone(), def);
        }
        self.persist()
    }

    /// Replace an existing definition.
    pub fn update(&self, name: &str, def: ToolDefinition) -> Result<()> {
        if name == BASH_TOOL {
            return Err(Error::InvalidInput("the bash tool is reserved".into()));
        }
        validate_definition(&def)?;
        {
            let mut tools = self.tools.write();
            if !tools.contains_key(name) {
                return Err(Error::ToolNotFound(name.to_string()));
            }
            if def.name != name {
                tools.shift_remove(name);
            }
            tools.insert(def.name.clone(), def);
        }
        self.persist()
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        if name == BASH_TOOL {
            return Err(Error::InvalidInput("the bash tool is reserved".into()));
        }
        let removed = self.tools.write().shift_remove(name).is_some();
        if !removed {
            return Err(Error::ToolNotFound(name.to_string()));
        }
        self.persist()
    }

    /// Serialize the catalog and atomically replace the YAML file.
    fn persist(&self) -> Result<()> {
        let catalog = CatalogFile {
            tools: self.tools.read().clone(),
        };
        let yaml =
            serde_yaml::to_string(&catalog).map_err(|e| Error::Yaml(e.to_string()))?;
        let dir = self
            .path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;
        let tmp = tempfile::NamedTempFile::new_in(&dir)?;
        std::fs::write(tmp.path(), yaml)?;
        tmp.persist(&self.path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

fn validate_definition(def: &ToolDefinition) -> Result<()> {
    if def.name == BASH_TOOL {
        return Err(Error::InvalidInput("the bash tool is reserved".into()));
    }
    if def.name.trim().is_empty() {
        return Err(Error::InvalidInput("tool name must not be empty".into()));
    }
    if def.binary.trim().is_empty() {
        return Err(Error::InvalidInput(format!(
            "tool '{}' has no binary",
            def.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
tools:
  nmap:
    name: nmap
    description: Network scanning and service detection
    category: scanning
    risk_level: medium
    binary: nmap
    default_args: ["-Pn"]
    parameters:
      target:
        type: string
        positional: true
      ports:
        flag: "-p"
        type: string
      service_scan:
        flag: "-sV"
        type: boolean
  subfinder:
    name: subfinder
    description: Passive subdomain enumeration
    category: recon
    risk_level: low
    binary: subfinder
    parameters:
      domain:
        flag: "-d"
        type: string
      raw_args:
        raw_flag: true
        flag: ""
        type: string
"#;

    fn registry_with_sample() -> (tempfile::TempDir, ToolRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool_definitions.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let reg = ToolRegistry::load(&path).unwrap();
        (dir, reg)
    }

    #[test]
    fn load_preserves_file_order() {
        let (_dir, reg) = registry_with_sample();
        assert_eq!(reg.names(), vec!["nmap", "subfinder"]);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ToolRegistry::load(dir.path().join("none.yaml")).unwrap();
        assert!(reg.list().is_empty());
    }

    #[test]
    fn get_parses_parameter_kinds() {
        let (_dir, reg) = registry_with_sample();
        let nmap = reg.get("nmap").unwrap();
        assert!(nmap.parameters["target"].positional);
        assert_eq!(nmap.parameters["service_scan"].param_type, "boolean");
        let sub = reg.get("subfinder").unwrap();
        assert!(sub.parameters["raw_args"].raw_flag);
    }

    #[test]
    fn insert_rejects_duplicate_and_missing_binary() {
        let (_dir, reg) = registry_with_sample();
        let dup = reg.get("nmap").unwrap();
        assert!(reg.insert(dup).is_err());

        let bad = ToolDefinition {
            name: "broken".into(),
            description: String::new(),
            category: String::new(),
            risk_level: String::new(),
            binary: "".into(),
            default_args: vec![],
            parameters: IndexMap::new(),
        };
        assert!(reg.insert(bad).is_err());
    }

    #[test]
    fn bash_is_reserved() {
        let (_dir, reg) = registry_with_sample();
        assert!(reg.contains(BASH_TOOL));
        assert!(reg.remove(BASH_TOOL).is_err());
        let bash_def = ToolDefinition {
            name: BASH_TOOL.into(),
            description: String::new(),
            category: String::new(),
            risk_level: String::new(),
            binary: "/bin/bash".into(),
            default_args: vec![],
            parameters: IndexMap::new(),
        };
        assert!(reg.insert(bash_def.clone()).is_err());
        assert!(reg.update(BASH_TOOL, bash_def).is_err());
    }

    #[test]
    fn crud_round_trips_through_disk() {
        let (dir, reg) = registry_with_sample();
        let def = ToolDefinition {
            name: "httpx".into(),
            description: "HTTP probing".into(),
            category: "recon".into(),
            risk_level: "low".into(),
            binary: "httpx".into(),
            default_args: vec!["-silent".into()],
            parameters: IndexMap::new(),
        };
        reg.insert(def.clone()).unwrap();

        // Reload from disk and verify the write survived the rename.
        let reloaded =
            ToolRegistry::load(dir.path().join("tool_definitions.yaml")).unwrap();
        assert_eq!(reloaded.get("httpx").unwrap(), def);

        reg.remove("httpx").unwrap();
        let reloaded =
            ToolRegistry::load(dir.path().join("tool_definitions.yaml")).unwrap();
        assert!(reloaded.get("httpx").is_none());
    }

    #[test]
    fn update_unknown_tool_errors() {
        let (_dir, reg) = registry_with_sample();
        let def = reg.get("nmap").unwrap();
        assert!(matches!(
            reg.update("nope", def),
            Err(Error::ToolNotFound(_))
        ));
    }
}
