//! Command construction from a tool definition and a parameter map.
//!
//! Pure: the same definition and parameters always produce the same argv
//! and stdin payload. Parameter-map order is preserved, so positional
//! values land in the order the caller supplied them.

use serde_json::{Map, Value};

use crate::definitions::ToolDefinition;

/// Shell used for the synthetic `bash` tool.
pub const SHELL: &str = "/bin/bash";

#[derive(Debug, Clone, PartialEq)]
pub struct CommandLine {
    pub argv: Vec<String>,
    pub stdin: Option<String>,
}

impl CommandLine {
    /// Human-readable rendering for task records and logs.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Render a verbatim shell command.
pub fn build_bash_command(command: &str) -> CommandLine {
    CommandLine {
        argv: vec![SHELL.into(), "-c".into(), command.into()],
        stdin: None,
    }
}

/// Render argv + stdin from a definition and a parameter map.
///
/// Unknown keys and empty values are skipped. Stdin-marked values are
/// reserved as the stdin payload. Raw passthrough emits the flag for a
/// boolean `true` and the bare value otherwise. Positional values are
/// appended last, in parameter-map order.
pub fn build_command(def: &ToolDefinition, params: &Map<String, Value>) -> CommandLine {
    let mut argv: Vec<String> = Vec::with_capacity(2 + def.default_args.len());
    argv.push(def.binary.clone());
    argv.extend(def.default_args.iter().cloned());

    let mut stdin: Option<String> = None;

    for (name, value) in params {
        let Some(param) = def.parameters.get(name) else {
            continue;
        };
        if is_empty(value) {
            continue;
        }

        if param.stdin {
            stdin = Some(stringify(value));
            continue;
        }

        if param.raw_flag {
            if value == &Value::Bool(true) {
                argv.push(param.flag.clone());
            } else {
                argv.push(stringify(value));
            }
            continue;
        }

        if param.positional {
            continue; // appended after the flagged arguments
        }

        if param.param_type == "boolean" {
            if is_truthy(value) {
                argv.push(param.flag.clone());
            }
            continue;
        }

        if !param.flag.is_empty() {
            argv.push(param.flag.clone());
            argv.push(stringify(value));
        }
    }

    for (name, value) in params {
        if let Some(param) = def.parameters.get(name) {
            if param.positional && !param.stdin && !is_empty(value) {
                argv.push(stringify(value));
            }
        }
    }

    CommandLine { argv, stdin }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        _ => true,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
