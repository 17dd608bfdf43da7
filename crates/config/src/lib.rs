//! Hierarchical connector configuration. Options live in a YAML document
//! under the `keyspaces-cdc-streams` root namespace; every option can be
//! overridden by an environment variable whose name is the option path with
//! the root prefix removed, separators replaced by underscores, and
//! upper-cased (`connector.max-retries` → `CONNECTOR_MAX_RETRIES`).

mod settings;

pub use settings::{
    CoordinatorSettings, LeaseSettings, ProcessorSettings, Settings, StreamSettings,
};

use std::collections::BTreeMap;
use std::time::Duration;
use streams::{Error, Result};

pub const ROOT_NAMESPACE: &str = "keyspaces-cdc-streams";

#[derive(Debug, Clone)]
pub struct ConfigDocument {
    root: serde_yaml::Value,
    env: BTreeMap<String, String>,
}

impl ConfigDocument {
    /// Load from a YAML file, snapshotting the process environment for
    /// overrides.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("failed to read {}: {err}", path.display())))?;
        Self::from_yaml(&raw, std::env::vars().collect())
    }

    pub fn from_yaml(raw: &str, env: BTreeMap<String, String>) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(raw)
            .map_err(|err| Error::Config(format!("invalid configuration document: {err}")))?;
        let root = document
            .get(ROOT_NAMESPACE)
            .cloned()
            .unwrap_or(serde_yaml::Value::Null);
        Ok(Self { root, env })
    }

    /// An empty document: every option resolves through the environment only.
    pub fn from_env(env: BTreeMap<String, String>) -> Self {
        Self {
            root: serde_yaml::Value::Null,
            env,
        }
    }

    /// The environment variable overriding `option`.
    pub fn env_key(option: &str) -> String {
        option
            .chars()
            .map(|c| match c {
                '.' | '-' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect()
    }

    fn file_value(&self, option: &str) -> Option<&serde_yaml::Value> {
        let mut cursor = &self.root;
        for segment in option.split('.') {
            cursor = cursor.get(segment)?;
        }
        Some(cursor)
    }

    /// Resolve an option to its textual form, environment first.
    fn lookup(&self, option: &str) -> Option<String> {
        if let Some(value) = self.env.get(&Self::env_key(option)) {
            return Some(value.clone());
        }
        match self.file_value(option)? {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_string(&self, option: &str) -> Option<String> {
        self.lookup(option)
    }

    pub fn require_string(&self, option: &str) -> Result<String> {
        self.lookup(option)
            .ok_or_else(|| missing(option))
    }

    pub fn get_bool(&self, option: &str) -> Result<Option<bool>> {
        self.lookup(option)
            .map(|raw| {
                raw.trim()
                    .parse()
                    .map_err(|_| invalid(option, &raw, "a boolean"))
            })
            .transpose()
    }

    pub fn get_i32(&self, option: &str) -> Result<Option<i32>> {
        self.lookup(option)
            .map(|raw| {
                raw.trim()
                    .parse()
                    .map_err(|_| invalid(option, &raw, "an integer"))
            })
            .transpose()
    }

    pub fn get_i64(&self, option: &str) -> Result<Option<i64>> {
        self.lookup(option)
            .map(|raw| {
                raw.trim()
                    .parse()
                    .map_err(|_| invalid(option, &raw, "an integer"))
            })
            .transpose()
    }

    /// Durations accept humantime forms (`30s`, `1m`, `250ms`).
    pub fn get_duration(&self, option: &str) -> Result<Option<Duration>> {
        self.lookup(option)
            .map(|raw| {
                humantime::parse_duration(raw.trim())
                    .map_err(|_| invalid(option, &raw, "a duration such as '30s'"))
            })
            .transpose()
    }

    /// A list of strings: a YAML sequence in the file, comma-separated in
    /// the environment.
    pub fn get_string_list(&self, option: &str) -> Result<Option<Vec<String>>> {
        if let Some(raw) = self.env.get(&Self::env_key(option)) {
            return Ok(Some(split_list(raw)));
        }
        match self.file_value(option) {
            None | Some(serde_yaml::Value::Null) => Ok(None),
            Some(serde_yaml::Value::Sequence(items)) => items
                .iter()
                .map(|item| match item {
                    serde_yaml::Value::String(s) => Ok(s.clone()),
                    serde_yaml::Value::Number(n) => Ok(n.to_string()),
                    other => Err(invalid(option, &format!("{other:?}"), "a string list")),
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(serde_yaml::Value::String(s)) => Ok(Some(split_list(s))),
            Some(other) => Err(invalid(option, &format!("{other:?}"), "a string list")),
        }
    }

    pub fn require_string_list(&self, option: &str) -> Result<Vec<String>> {
        self.get_string_list(option)?.ok_or_else(|| missing(option))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

fn missing(option: &str) -> Error {
    Error::Config(format!(
        "required option '{ROOT_NAMESPACE}.{option}' is not set (environment variable {})",
        ConfigDocument::env_key(option)
    ))
}

fn invalid(option: &str, raw: &str, expected: &str) -> Error {
    Error::Config(format!(
        "option '{ROOT_NAMESPACE}.{option}' value '{raw}' is not {expected}"
    ))
}
