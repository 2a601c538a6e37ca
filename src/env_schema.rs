//! Target Environment Contracts
//!
//! Every target declares the variables its scripts and identifier templates
//! consume. A variable is either mandatory (declared with a `null` default)
//! or optional (declared with a default value). This module turns that
//! declaration plus caller overrides into a fully resolved environment, or
//! refuses with an error naming every variable that is still missing.
//!
//! # Definition Format
//!
//! ```yaml
//! env:
//!   command: rsync        # optional, defaults to "rsync"
//!   rsync_port: 873       # scalars are stringified
//!   site_root: null       # mandatory, must be supplied by the caller
//! ```
//!
//! Resolution happens before any template is rendered or process spawned.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while loading or resolving target configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// One or more mandatory variables have neither a default nor an override
    #[error("target '{target}' is missing mandatory variables: {}", .names.join(", "))]
    MissingVariables { target: String, names: Vec<String> },

    /// The target definition itself is malformed
    #[error("invalid definition for target '{target}': {reason}")]
    InvalidDefinition { target: String, reason: String },

    /// The requested target is not in the registry
    #[error("unknown target '{target}'")]
    UnknownTarget { target: String },

    /// The same target id appears twice in one definitions source
    #[error("target '{target}' is defined more than once")]
    DuplicateTarget { target: String },

    /// A script referenced by path could not be read
    #[error("failed to read script '{path}' for target '{target}': {reason}")]
    ScriptUnreadable {
        target: String,
        path: String,
        reason: String,
    },

    /// A transfer request was run against a target other than its own
    #[error("transfer request for target '{requested}' cannot run on target '{target}'")]
    TargetMismatch { requested: String, target: String },

    /// A caller override was not of the form KEY=VALUE
    #[error("invalid environment override '{raw}': expected KEY=VALUE")]
    InvalidOverride { raw: String },
}

/// Default of a single declared variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvDefault {
    /// No default; the caller must supply a value.
    Required,
    /// Used unless the caller overrides it.
    Default(String),
}

impl EnvDefault {
    pub fn is_required(&self) -> bool {
        matches!(self, EnvDefault::Required)
    }
}

impl<'de> Deserialize<'de> for EnvDefault {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde_yaml::Value;

        match Value::deserialize(deserializer)? {
            Value::Null => Ok(EnvDefault::Required),
            Value::String(s) => Ok(EnvDefault::Default(s)),
            Value::Number(n) => Ok(EnvDefault::Default(n.to_string())),
            Value::Bool(b) => Ok(EnvDefault::Default(b.to_string())),
            Value::Tagged(tagged) => Err(de::Error::custom(format!(
                "tagged value {} is not a valid variable default",
                tagged.tag
            ))),
            Value::Sequence(_) | Value::Mapping(_) => Err(de::Error::custom(
                "variable defaults must be scalars or null",
            )),
        }
    }
}

impl Serialize for EnvDefault {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EnvDefault::Required => serializer.serialize_none(),
            EnvDefault::Default(value) => serializer.serialize_str(value),
        }
    }
}

/// Declared variables of one target, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvSchema {
    vars: BTreeMap<String, EnvDefault>,
}

impl EnvSchema {
    /// Create an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a mandatory variable
    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.vars.insert(name.into(), EnvDefault::Required);
        self
    }

    /// Declare an optional variable with its default
    pub fn with_default(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars
            .insert(name.into(), EnvDefault::Default(value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&EnvDefault> {
        self.vars.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EnvDefault)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Names of the mandatory variables, sorted
    pub fn required_names(&self) -> Vec<&str> {
        self.vars
            .iter()
            .filter(|(_, d)| d.is_required())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Resolve the schema against caller overrides.
    ///
    /// Overrides take precedence over defaults. Override keys the schema does
    /// not declare are passed through. Fails with every missing mandatory
    /// name at once rather than stopping at the first.
    pub fn resolve(
        &self,
        target: &str,
        overrides: &EnvOverrides,
    ) -> Result<ResolvedEnv, ConfigError> {
        let mut resolved = BTreeMap::new();
        let mut missing = Vec::new();

        for (name, default) in &self.vars {
            match (overrides.get(name), default) {
                (Some(value), _) => {
                    resolved.insert(name.clone(), value.to_string());
                }
                (None, EnvDefault::Default(value)) => {
                    resolved.insert(name.clone(), value.clone());
                }
                (None, EnvDefault::Required) => missing.push(name.clone()),
            }
        }

        if !missing.is_empty() {
            return Err(ConfigError::MissingVariables {
                target: target.to_string(),
                names: missing,
            });
        }

        for (name, value) in overrides.iter() {
            if !self.vars.contains_key(name) {
                tracing::debug!(target_id = target, name, "passing through undeclared override");
                resolved.insert(name.to_string(), value.to_string());
            }
        }

        Ok(ResolvedEnv { vars: resolved })
    }

    /// Human-readable description of the contract, one line per variable
    pub fn describe(&self) -> Vec<String> {
        self.vars
            .iter()
            .map(|(name, default)| match default {
                EnvDefault::Required => format!("{name} (required)"),
                EnvDefault::Default(value) => format!("{name} = {value:?}"),
            })
            .collect()
    }
}

/// Caller-supplied variable values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EnvOverrides {
    vars: BTreeMap<String, String>,
}

// Scalars are stringified the same way as declared defaults; null is
// rejected because an override must supply a value.
impl<'de> Deserialize<'de> for EnvOverrides {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, EnvDefault>::deserialize(deserializer)?;
        let mut vars = BTreeMap::new();
        for (name, value) in raw {
            match value {
                EnvDefault::Default(value) => {
                    vars.insert(name, value);
                }
                EnvDefault::Required => {
                    return Err(de::Error::custom(format!(
                        "override for '{name}' must have a value"
                    )));
                }
            }
        }
        Ok(Self { vars })
    }
}

impl EnvOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an override
    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Layer `other` on top of `self`; `other` wins on conflicts
    pub fn merged_with(&self, other: &EnvOverrides) -> EnvOverrides {
        let mut vars = self.vars.clone();
        vars.extend(other.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        EnvOverrides { vars }
    }

    /// Parse `KEY=VALUE` pairs as given on a command line
    pub fn parse_pairs<I, S>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = Self::new();
        for raw in pairs {
            let raw = raw.as_ref();
            match raw.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    overrides.insert(key.trim(), value);
                }
                _ => {
                    return Err(ConfigError::InvalidOverride {
                        raw: raw.to_string(),
                    });
                }
            }
        }
        Ok(overrides)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvOverrides {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Fully resolved environment, ready for rendering and process export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ResolvedEnv {
    vars: BTreeMap<String, String>,
}

impl ResolvedEnv {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Copy of this environment with one extra binding
    pub fn with(&self, name: impl Into<String>, value: impl Into<String>) -> ResolvedEnv {
        let mut vars = self.vars.clone();
        vars.insert(name.into(), value.into());
        ResolvedEnv { vars }
    }
}
