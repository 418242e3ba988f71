// crates/manifold-server/src/config/profile.rs
// Profile model: downstream definitions, validation, content hashing

use crate::error::{ManifoldError, Result};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

/// Default per-call deadline for `tools/call` forwarding.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;

/// Transport used to reach a remote downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTransport {
    Http,
    Sse,
}

impl RemoteTransport {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Self::Http),
            "sse" => Some(Self::Sse),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Sse => "sse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthKind {
    #[default]
    None,
    Bearer,
    Custom,
}

impl AuthKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "bearer" => Some(Self::Bearer),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bearer => "bearer",
            Self::Custom => "custom",
        }
    }
}

/// Authentication applied to remote transports.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub kind: AuthKind,
    pub token: Option<String>,
}

impl AuthConfig {
    /// Value for the `Authorization` header, when any.
    pub fn header_value(&self) -> Option<String> {
        match self.kind {
            AuthKind::None => None,
            AuthKind::Bearer => self.token.as_ref().map(|t| format!("Bearer {t}")),
            AuthKind::Custom => self.token.clone(),
        }
    }
}

/// How to reach one downstream: a local child process over stdio, or a
/// remote HTTP/SSE endpoint. Validation guarantees exactly one shape.
#[derive(Debug, Clone)]
pub enum DownstreamDefinition {
    Process {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Remote {
        url: String,
        transport: RemoteTransport,
        auth: AuthConfig,
    },
}

/// One named downstream in the profile.
#[derive(Debug, Clone)]
pub struct DownstreamEntry {
    pub name: String,
    pub definition: DownstreamDefinition,
    /// Per-downstream override of the call deadline.
    pub timeout_secs: Option<u64>,
}

impl DownstreamEntry {
    pub fn call_timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_CALL_TIMEOUT_SECS)
    }

    /// Stable 128-bit hash of the validated form. Drives incremental
    /// re-indexing: a changed hash re-probes only this downstream.
    pub fn content_hash(&self) -> String {
        content_hash(&self.canonical_value())
    }

    fn canonical_value(&self) -> Value {
        match &self.definition {
            DownstreamDefinition::Process { command, args, env } => {
                let mut env_sorted: Vec<(&String, &String)> = env.iter().collect();
                env_sorted.sort();
                let env_map: Map<String, Value> = env_sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                json!({
                    "args": args,
                    "command": command,
                    "env": env_map,
                    "name": self.name,
                    "timeout_secs": self.timeout_secs,
                })
            }
            DownstreamDefinition::Remote {
                url,
                transport,
                auth,
            } => json!({
                "auth": { "kind": auth.kind.as_str(), "token": auth.token },
                "name": self.name,
                "timeout_secs": self.timeout_secs,
                "transport": transport.as_str(),
                "url": url,
            }),
        }
    }
}

/// The user's declared set of downstreams. Declaration order is
/// preserved; names are unique and case-sensitive. Read-only after
/// load — changes require a restart or an explicit reindex.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub downstreams: Vec<DownstreamEntry>,
    /// Confirmation gate toggle (`"gate": {"enabled": false}`).
    pub gate_enabled: bool,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ManifoldError::Fatal(format!("cannot read profile {}: {e}", path.display()))
        })?;
        let value: Value = serde_json::from_str(&content).map_err(|e| {
            ManifoldError::Fatal(format!("profile {} is not valid JSON: {e}", path.display()))
        })?;
        Self::from_value(&value)
    }

    /// Parse and validate a profile from its JSON object form:
    /// `{"mcpServers": {"<name>": {...}, ...}, "gate": {"enabled": bool}}`
    pub fn from_value(value: &Value) -> Result<Self> {
        let servers = value
            .get("mcpServers")
            .and_then(|v| v.as_object())
            .ok_or_else(|| ManifoldError::Fatal("profile has no mcpServers object".into()))?;

        let mut downstreams = Vec::with_capacity(servers.len());
        let mut seen = std::collections::HashSet::new();
        for (name, def) in servers {
            if !is_valid_name(name) {
                return Err(ManifoldError::Fatal(format!(
                    "invalid downstream name '{name}': must match [A-Za-z0-9_-]+"
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(ManifoldError::Fatal(format!(
                    "duplicate downstream name '{name}'"
                )));
            }
            downstreams.push(parse_entry(name, def)?);
        }

        let gate_enabled = value
            .get("gate")
            .and_then(|g| g.get("enabled"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        Ok(Self {
            downstreams,
            gate_enabled,
        })
    }

    pub fn get(&self, name: &str) -> Option<&DownstreamEntry> {
        self.downstreams.iter().find(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Stable hash over the whole validated profile, keys sorted.
    pub fn content_hash(&self) -> String {
        let entries: Vec<Value> = self.downstreams.iter().map(|d| d.canonical_value()).collect();
        content_hash(&json!({
            "downstreams": entries,
            "gate_enabled": self.gate_enabled,
        }))
    }

    /// Per-downstream hashes, for the reconcile work plan.
    pub fn downstream_hashes(&self) -> HashMap<String, String> {
        self.downstreams
            .iter()
            .map(|d| (d.name.clone(), d.content_hash()))
            .collect()
    }
}

fn parse_entry(name: &str, def: &Value) -> Result<DownstreamEntry> {
    let obj = def.as_object().ok_or_else(|| {
        ManifoldError::Fatal(format!("downstream '{name}' is not an object"))
    })?;

    let has_command = obj.contains_key("command");
    let has_url = obj.contains_key("url");
    if has_command && has_url {
        return Err(ManifoldError::Fatal(format!(
            "downstream '{name}' declares both command and url; pick one"
        )));
    }

    let timeout_secs = obj.get("timeout_secs").and_then(|v| v.as_u64());

    let definition = if has_command {
        let command = obj
            .get("command")
            .and_then(|v| v.as_str())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                ManifoldError::Fatal(format!("downstream '{name}' has an empty command"))
            })?
            .to_string();
        let args: Vec<String> = obj
            .get("args")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let env: HashMap<String, String> = obj
            .get("env")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        DownstreamDefinition::Process { command, args, env }
    } else if has_url {
        let url = obj
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ManifoldError::Fatal(format!("downstream '{name}' has a non-string url")))?
            .to_string();
        url::Url::parse(&url).map_err(|e| {
            ManifoldError::Fatal(format!("downstream '{name}' has an invalid url: {e}"))
        })?;
        let transport = match obj.get("transport").and_then(|v| v.as_str()) {
            None => RemoteTransport::Http,
            Some(s) => RemoteTransport::parse(s).ok_or_else(|| {
                ManifoldError::Fatal(format!(
                    "downstream '{name}' has unknown transport '{s}' (expected http or sse)"
                ))
            })?,
        };
        let auth = parse_auth(name, obj.get("auth"))?;
        DownstreamDefinition::Remote {
            url,
            transport,
            auth,
        }
    } else {
        return Err(ManifoldError::Fatal(format!(
            "downstream '{name}' declares neither command nor url"
        )));
    };

    Ok(DownstreamEntry {
        name: name.to_string(),
        definition,
        timeout_secs,
    })
}

fn parse_auth(name: &str, value: Option<&Value>) -> Result<AuthConfig> {
    let Some(obj) = value.and_then(|v| v.as_object()) else {
        return Ok(AuthConfig::default());
    };
    let kind = match obj.get("kind").and_then(|v| v.as_str()) {
        None => AuthKind::None,
        Some(s) => AuthKind::parse(s).ok_or_else(|| {
            ManifoldError::Fatal(format!("downstream '{name}' has unknown auth kind '{s}'"))
        })?,
    };
    let token = obj
        .get("token")
        .and_then(|v| v.as_str())
        .map(String::from);
    if kind != AuthKind::None && token.as_deref().unwrap_or("").trim().is_empty() {
        return Err(ManifoldError::Fatal(format!(
            "downstream '{name}' requires a non-empty auth token for kind '{}'",
            kind.as_str()
        )));
    }
    Ok(AuthConfig { kind, token })
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Canonical 128-bit content hash: keys recursively sorted, compact
/// serialization, SHA-256 truncated to 16 bytes hex. Same bytes, same
/// hash, on every host.
pub fn content_hash(value: &Value) -> String {
    let canonical = canonicalize(value);
    let serialized = canonical.to_string();
    let digest = Sha256::digest(serialized.as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> Value {
        serde_json::json!({
            "mcpServers": {
                "files": {
                    "command": "npx",
                    "args": ["-y", "@files/mcp"],
                    "env": {"ROOT": "/tmp"}
                },
                "search": {
                    "url": "https://search.example/mcp",
                    "transport": "sse",
                    "auth": {"kind": "bearer", "token": "tok-123"}
                }
            }
        })
    }

    #[test]
    fn test_parse_basic() {
        let profile = Profile::from_value(&sample_profile()).unwrap();
        assert_eq!(profile.downstreams.len(), 2);
        assert!(profile.gate_enabled);

        let files = profile.get("files").unwrap();
        match &files.definition {
            DownstreamDefinition::Process { command, args, env } => {
                assert_eq!(command, "npx");
                assert_eq!(args, &["-y", "@files/mcp"]);
                assert_eq!(env.get("ROOT").unwrap(), "/tmp");
            }
            _ => panic!("files should be a process downstream"),
        }

        let search = profile.get("search").unwrap();
        match &search.definition {
            DownstreamDefinition::Remote {
                url,
                transport,
                auth,
            } => {
                assert_eq!(url, "https://search.example/mcp");
                assert_eq!(*transport, RemoteTransport::Sse);
                assert_eq!(auth.header_value().unwrap(), "Bearer tok-123");
            }
            _ => panic!("search should be a remote downstream"),
        }
    }

    #[test]
    fn test_reject_both_shapes() {
        let value = serde_json::json!({
            "mcpServers": {
                "bad": {"command": "x", "url": "https://example.com"}
            }
        });
        assert!(Profile::from_value(&value).is_err());
    }

    #[test]
    fn test_reject_neither_shape() {
        let value = serde_json::json!({
            "mcpServers": { "bad": {"args": ["only"]} }
        });
        assert!(Profile::from_value(&value).is_err());
    }

    #[test]
    fn test_reject_invalid_name() {
        let value = serde_json::json!({
            "mcpServers": { "bad name": {"command": "x"} }
        });
        assert!(Profile::from_value(&value).is_err());
    }

    #[test]
    fn test_reject_empty_bearer_token() {
        let value = serde_json::json!({
            "mcpServers": {
                "remote": {"url": "https://example.com", "auth": {"kind": "bearer", "token": ""}}
            }
        });
        assert!(Profile::from_value(&value).is_err());
    }

    #[test]
    fn test_hash_stable_across_key_order() {
        let a = serde_json::json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = serde_json::json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a).len(), 32);
    }

    #[test]
    fn test_hash_changes_with_args() {
        let profile_a = Profile::from_value(&sample_profile()).unwrap();
        let mut modified = sample_profile();
        modified["mcpServers"]["files"]["args"] = serde_json::json!(["-y", "@files/mcp", "--ro"]);
        let profile_b = Profile::from_value(&modified).unwrap();

        let hashes_a = profile_a.downstream_hashes();
        let hashes_b = profile_b.downstream_hashes();
        assert_ne!(hashes_a["files"], hashes_b["files"]);
        assert_eq!(hashes_a["search"], hashes_b["search"]);
        assert_ne!(profile_a.content_hash(), profile_b.content_hash());
    }

    #[test]
    fn test_gate_toggle() {
        let mut value = sample_profile();
        value["gate"] = serde_json::json!({"enabled": false});
        let profile = Profile::from_value(&value).unwrap();
        assert!(!profile.gate_enabled);
    }

    #[test]
    fn test_custom_auth_header_verbatim() {
        let auth = AuthConfig {
            kind: AuthKind::Custom,
            token: Some("Basic abc".into()),
        };
        assert_eq!(auth.header_value().unwrap(), "Basic abc");
    }
}
