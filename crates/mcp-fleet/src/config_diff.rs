use mcp_types::{ConfigViolation, ParsedConfig, ServerConfig};
use std::collections::BTreeSet;

/// How a reloaded configuration differs from the one in effect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Present in both, with a different entry.
    pub changed: Vec<String>,
}

#[derive(PartialEq)]
enum EntryRef<'a> {
    Valid(&'a ServerConfig),
    Invalid(&'a ConfigViolation),
}

fn entry<'a>(config: &'a ParsedConfig, name: &str) -> Option<EntryRef<'a>> {
    if let Some(server) = config.servers.get(name) {
        return Some(EntryRef::Valid(server));
    }
    config.violation(name).map(EntryRef::Invalid)
}

/// Every server name listed in `config`, valid or not, in name order.
pub fn server_names(config: &ParsedConfig) -> Vec<String> {
    config
        .servers
        .keys()
        .cloned()
        .chain(config.violations.iter().map(|v| v.server.clone()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

impl ConfigDiff {
    pub fn between(old: &ParsedConfig, new: &ParsedConfig) -> Self {
        let mut diff = ConfigDiff::default();

        for name in server_names(old) {
            if !new.contains(&name) {
                diff.removed.push(name);
            }
        }

        for name in server_names(new) {
            match entry(old, &name) {
                None => diff.added.push(name),
                Some(previous) => {
                    if entry(new, &name) != Some(previous) {
                        diff.changed.push(name);
                    }
                }
            }
        }

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> ParsedConfig {
        ParsedConfig::from_value(value).unwrap()
    }

    #[test]
    fn test_diff_classifies_servers() {
        let old = parse(json!({
            "keep": { "command": "echo" },
            "edit": { "url": "https://host/mcp" },
            "drop": { "command": "cat" }
        }));
        let new = parse(json!({
            "keep": { "command": "echo" },
            "edit": { "url": "https://host/sse" },
            "fresh": { "command": "true" }
        }));

        let diff = ConfigDiff::between(&old, &new);
        assert_eq!(diff.added, vec!["fresh"]);
        assert_eq!(diff.removed, vec!["drop"]);
        assert_eq!(diff.changed, vec!["edit"]);
        assert!(ConfigDiff::between(&new, &new).is_empty());
    }

    #[test]
    fn test_invalid_entries_take_part_in_diff() {
        let old = parse(json!({ "svc": {} }));
        let fixed = parse(json!({ "svc": { "command": "echo" } }));

        assert_eq!(server_names(&old), vec!["svc"]);
        let diff = ConfigDiff::between(&old, &fixed);
        assert_eq!(diff.changed, vec!["svc"]);
        assert!(diff.added.is_empty() && diff.removed.is_empty());

        let diff = ConfigDiff::between(&ParsedConfig::default(), &old);
        assert_eq!(diff.added, vec!["svc"]);
    }
}
