//! Server configuration records and the validating parser for the
//! user-editable configuration file.
//!
//! The file maps server names to either a process descriptor
//! (`command`/`args`/`env`) or a URL descriptor (`url`/`transport`/`headers`).
//! Parsing never stops at the first bad entry: every entry is checked and every
//! problem is reported, while valid siblings still load.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Key under which servers are usually nested in the configuration file.
pub const SERVERS_KEY: &str = "mcpServers";

/// What to do with a child process' stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Capture stderr and forward each line as a server log event.
    #[default]
    Pipe,
    /// Let the child write straight to our stderr.
    Inherit,
    /// Discard stderr.
    Ignore,
}

/// Explicit remote transport selection, overriding URL-suffix detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportHint {
    Sse,
    Http,
}

/// A server launched as a local subprocess speaking MCP over stdio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub stderr: StderrMode,
}

/// A server reached over the network (SSE or streamable HTTP).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportHint>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// One validated entry of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerConfig {
    Process(ProcessConfig),
    Remote(RemoteConfig),
}

impl ServerConfig {
    pub fn is_remote(&self) -> bool {
        matches!(self, ServerConfig::Remote(_))
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            ServerConfig::Remote(remote) => Some(&remote.url),
            ServerConfig::Process(_) => None,
        }
    }
}

/// Every problem found with a single configuration entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    pub server: String,
    pub problems: Vec<String>,
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server '{}': {}", self.server, self.problems.join("; "))
    }
}

/// Result of parsing a configuration file: the entries that loaded plus a
/// report for each entry that did not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedConfig {
    pub servers: BTreeMap<String, ServerConfig>,
    pub violations: Vec<ConfigViolation>,
}

impl ParsedConfig {
    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(content)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(root) = value else {
            return Err(ConfigError::NotAnObject);
        };

        let entries = match root.get(SERVERS_KEY) {
            Some(Value::Object(servers)) => servers.clone(),
            Some(_) => {
                return Err(ConfigError::Invalid(vec![ConfigViolation {
                    server: SERVERS_KEY.to_string(),
                    problems: vec![format!("`{}` must be an object", SERVERS_KEY)],
                }]))
            }
            None => root,
        };

        let mut parsed = ParsedConfig::default();
        for (name, entry) in entries {
            match validate_entry(&entry) {
                Ok(config) => {
                    parsed.servers.insert(name, config);
                }
                Err(problems) => parsed.violations.push(ConfigViolation {
                    server: name,
                    problems,
                }),
            }
        }

        Ok(parsed)
    }

    /// Whether the server is listed in the file at all, valid or not.
    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name) || self.violation(name).is_some()
    }

    pub fn violation(&self, name: &str) -> Option<&ConfigViolation> {
        self.violations.iter().find(|v| v.server == name)
    }

    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// All-or-nothing view: any violation rejects the whole configuration,
    /// with every violation listed in the error.
    pub fn into_strict(self) -> Result<BTreeMap<String, ServerConfig>> {
        if self.violations.is_empty() {
            Ok(self.servers)
        } else {
            Err(ConfigError::Invalid(self.violations))
        }
    }
}

fn validate_entry(entry: &Value) -> std::result::Result<ServerConfig, Vec<String>> {
    let Value::Object(fields) = entry else {
        return Err(vec!["entry must be a JSON object".to_string()]);
    };

    let mut problems = Vec::new();

    let command = optional_string(fields, "command", &mut problems);
    let url = optional_string(fields, "url", &mut problems);
    let args = string_list(fields, "args", &mut problems);
    let env = string_map(fields, "env", &mut problems);
    let headers = string_map(fields, "headers", &mut problems);
    let stderr = optional_string(fields, "stderr", &mut problems)
        .or_else(|| optional_string(fields, "stderrMode", &mut problems));
    let transport = optional_string(fields, "transport", &mut problems);

    let config = match (command, url) {
        (None, None) => {
            problems.push("exactly one of `command` or `url` is required, found neither".to_string());
            None
        }
        (Some(_), Some(_)) => {
            problems.push("exactly one of `command` or `url` is required, found both".to_string());
            None
        }
        (Some(command), None) => {
            if command.trim().is_empty() {
                problems.push("`command` must not be empty".to_string());
            }
            if transport.is_some() {
                problems.push("`transport` only applies to `url` entries".to_string());
            }
            let stderr = match stderr.as_deref() {
                None | Some("pipe") => StderrMode::Pipe,
                Some("inherit") => StderrMode::Inherit,
                Some("ignore") => StderrMode::Ignore,
                Some(other) => {
                    problems.push(format!(
                        "unknown stderr mode '{}' (expected pipe, inherit or ignore)",
                        other
                    ));
                    StderrMode::Pipe
                }
            };
            Some(ServerConfig::Process(ProcessConfig {
                command,
                args,
                env,
                stderr,
            }))
        }
        (None, Some(url)) => {
            match url::Url::parse(&url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                Ok(parsed) => problems.push(format!(
                    "unsupported URL scheme '{}' (expected http or https)",
                    parsed.scheme()
                )),
                Err(e) => problems.push(format!("invalid `url` '{}': {}", url, e)),
            }
            let transport = match transport.as_deref() {
                None => None,
                Some("sse") => Some(TransportHint::Sse),
                Some("http") | Some("streamable-http") | Some("streamableHttp") => {
                    Some(TransportHint::Http)
                }
                Some(other) => {
                    problems.push(format!(
                        "unknown transport '{}' (expected sse or http)",
                        other
                    ));
                    None
                }
            };
            Some(ServerConfig::Remote(RemoteConfig {
                url,
                transport,
                headers,
            }))
        }
    };

    match config {
        Some(config) if problems.is_empty() => Ok(config),
        _ => Err(problems),
    }
}

fn optional_string(
    fields: &Map<String, Value>,
    key: &str,
    problems: &mut Vec<String>,
) -> Option<String> {
    match fields.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            problems.push(format!("`{}` must be a string", key));
            None
        }
    }
}

fn string_list(fields: &Map<String, Value>, key: &str, problems: &mut Vec<String>) -> Vec<String> {
    match fields.get(key) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    _ => problems.push(format!("`{}[{}]` must be a string", key, i)),
                }
            }
            out
        }
        Some(_) => {
            problems.push(format!("`{}` must be an array of strings", key));
            Vec::new()
        }
    }
}

fn string_map(
    fields: &Map<String, Value>,
    key: &str,
    problems: &mut Vec<String>,
) -> BTreeMap<String, String> {
    match fields.get(key) {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(map)) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                match v {
                    Value::String(s) => {
                        out.insert(k.clone(), s.clone());
                    }
                    _ => problems.push(format!("`{}.{}` must be a string", key, k)),
                }
            }
            out
        }
        Some(_) => {
            problems.push(format!("`{}` must be an object of strings", key));
            BTreeMap::new()
        }
    }
}
