//! Per-session credential vault.
//!
//! Maps opaque tokens to the real values the operator supplied. Tokens are
//! what the LLM sees; the real value is substituted back only at the moment
//! a subprocess is launched. The vault is append-only for the session's
//! lifetime, lives only in memory, and is never readable across sessions.

use serde_json::Value;

#[derive(Debug, Default)]
pub struct CredentialVault {
    entries: Vec<(String, String)>,
}

impl CredentialVault {
    /// Vault a value and return the freshly minted token for it.
    pub fn mint(&mut self, value: &str) -> String {
        let seq = self.entries.len() + 1;
        let nonce: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect();
        let token = format!("[[__CRED_{seq}_{nonce}__]]");
        self.entries.push((token.clone(), value.to_string()));
        token
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The vaulted raw values (for confinement checks).
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, v)| v.as_str())
    }

    /// Substitute every known token occurring in `text` with its value.
    pub fn detokenize_str(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (token, value) in &self.entries {
            if out.contains(token.as_str()) {
                out = out.replace(token.as_str(), value);
            }
        }
        out
    }

    /// Recursively substitute tokens in every string field of a JSON value.
    pub fn detokenize_value(&self, value: &mut Value) {
        if self.entries.is_empty() {
            return;
        }
        match value {
            Value::String(s) => {
                let replaced = self.detokenize_str(s);
                if replaced != *s {
                    *s = replaced;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.detokenize_value(item);
                }
            }
            Value::Object(map) => {
                for (_, v) in map.iter_mut() {
                    self.detokenize_value(v);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mint_produces_unique_tokens() {
        let mut vault = CredentialVault::default();
        let t1 = vault.mint("hunter2");
        let t2 = vault.mint("hunter2");
        assert_ne!(t1, t2);
        assert!(t1.starts_with("[[__CRED_1_"));
        assert!(t2.starts_with("[[__CRED_2_"));
        assert_eq!(vault.len(), 2);
    }

    #[test]
    fn detokenize_str_replaces_all_occurrences() {
        let mut vault = CredentialVault::default();
        let token = vault.mint("s3cret");
        let text = format!("use {token} then {token} again");
        assert_eq!(vault.detokenize_str(&text), "use s3cret then s3cret again");
    }

    #[test]
    fn detokenize_value_walks_nested_structures() {
        let mut vault = CredentialVault::default();
        let token = vault.mint("hunter2");
        let mut value = json!({
            "command": format!("sshpass -p {token} ssh user@10.0.0.5"),
            "nested": {"list": [format!("-p {token}")]},
            "count": 3,
        });
        vault.detokenize_value(&mut value);
        assert_eq!(
            value["command"],
            "sshpass -p hunter2 ssh user@10.0.0.5"
        );
        assert_eq!(value["nested"]["list"][0], "-p hunter2");
    }

    #[test]
    fn unknown_text_is_untouched() {
        let mut vault = CredentialVault::default();
        vault.mint("x");
        assert_eq!(vault.detokenize_str("no tokens here"), "no tokens here");
    }
}
