//! Engagement scope enforcement.
//!
//! `in_scope` is the single predicate deciding whether a target may be
//! touched. Entries can be exact hostnames, `*.` wildcards, parent domains
//! (subdomain suffix match), or IP networks in CIDR form. An empty scope
//! disables the check. `extract_target` pulls the probable target out of a
//! tool-call parameter map or a raw shell command.

use std::net::IpAddr;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Parameter names probed, in order, when extracting a target from an
/// `execute_tool` call.
const TARGET_KEYS: &[&str] = &[
    "target", "host", "domain", "url", "ip", "cidr", "hosts", "ip_range", "stdin_target",
];

/// Output-file suffixes that look domain-like but never name a target.
const FILE_SUFFIXES: &[&str] = &[
    ".txt", ".json", ".xml", ".csv", ".log", ".html", ".yaml", ".yml", ".md",
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Canonicalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lowercase, strip an http(s) scheme, and drop everything from the first
/// slash on. `HTTPS://Example.com/login/` and `example.com` compare equal.
pub fn canonicalize(target: &str) -> String {
    let mut t = target.trim().to_ascii_lowercase();
    for scheme in ["http://", "https://"] {
        if let Some(rest) = t.strip_prefix(scheme) {
            t = rest.to_string();
            break;
        }
    }
    if let Some(idx) = t.find('/') {
        // Keep a CIDR suffix: "10.0.0.0/8" is a network, not a path.
        let is_cidr =
            t[..idx].parse::<IpAddr>().is_ok() && t[idx + 1..].parse::<u8>().is_ok();
        if !is_cidr {
            t.truncate(idx);
        }
    }
    t
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The predicate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// True when `target` is inside the engagement scope. An empty scope list
/// means the check is disabled. Unparseable entries are skipped.
pub fn in_scope(target: &str, scope: &[String]) -> bool {
    if scope.is_empty() {
        return true;
    }
    let target = canonicalize(target);
    if target.is_empty() {
        return false;
    }

    for raw in scope {
        let entry = canonicalize(raw);
        if entry.is_empty() {
            continue;
        }

        // Exact match.
        if target == entry {
            return true;
        }

        // Wildcard: "*.example.com" covers the base and every subdomain.
        if let Some(base) = entry.strip_prefix("*.") {
            if target == base || target.ends_with(&format!(".{base}")) {
                return true;
            }
            continue;
        }

        // Parent-domain suffix: entry "example.com" covers "a.example.com".
        if target.ends_with(&format!(".{entry}")) {
            return true;
        }

        // CIDR / single IP containment.
        if let (Some((net, prefix)), Ok(ip)) = (parse_network(&entry), target.parse::<IpAddr>())
        {
            if network_contains(net, prefix, ip) {
                return true;
            }
        }
    }
    false
}

/// Parse "10.0.0.0/8" or a bare IP (treated as a /32 or /128).
fn parse_network(entry: &str) -> Option<(IpAddr, u8)> {
    match entry.split_once('/') {
        Some((addr, prefix)) => {
            let addr: IpAddr = addr.parse().ok()?;
            let prefix: u8 = prefix.parse().ok()?;
            let max = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            (prefix <= max).then_some((addr, prefix))
        }
        None => {
            let addr: IpAddr = entry.parse().ok()?;
            let prefix = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            Some((addr, prefix))
        }
    }
}

fn network_contains(net: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix as u32)
            };
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix as u32)
            };
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Target extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Probe a tool-call parameter map for the first known target key.
pub fn extract_from_parameters(parameters: &Value) -> Option<String> {
    let map = parameters.as_object()?;
    for key in TARGET_KEYS {
        if let Some(value) = map.get(*key) {
            let s = match value {
                Value::String(s) => s.clone(),
                Value::Array(items) => items.first()?.as_str()?.to_string(),
                _ => continue,
            };
            if !s.is_empty() {
                // A multi-line stdin payload: judge by the first line.
                return Some(s.lines().next().unwrap_or("").trim().to_string());
            }
        }
    }
    None
}

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:\d{1,3}\.){3}\d{1,3}(?:/\d{1,2})?$").expect("static regex")
    })
}

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9-]*(?:\.[a-z0-9][a-z0-9-]*)+$").expect("static regex")
    })
}

/// Scan a shell command for the first IPv4 literal (optionally with a CIDR
/// suffix) or domain-like token. Option words and output files are skipped.
pub fn extract_from_command(command: &str) -> Option<String> {
    for raw in command.split_whitespace() {
        let token = canonicalize(raw.trim_matches(|c: char| "\"'`;|&()".contains(c)));
        if token.is_empty() || token.starts_with('-') {
            continue;
        }
        if ipv4_re().is_match(&token) {
            return Some(token);
        }
        if raw.contains('/') && !raw.contains("://") {
            continue; // filesystem path
        }
        if FILE_SUFFIXES.iter().any(|ext| token.ends_with(ext)) {
            continue;
        }
        if domain_re().is_match(&token) {
            return Some(token);
        }
    }
    None
}
