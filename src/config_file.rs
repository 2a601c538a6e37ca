//! Operator configuration: which target to archive to and with what values.
//!
//! ```yaml
//! archiving:
//!   target: rsyncd
//!   env:
//!     site_root: /farm
//!     user: alice
//!     host: nas
//!     site: plots
//! target_definitions: targets.yaml   # optional, merged over the built-ins
//! shell: bash                        # optional
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::env_schema::EnvOverrides;
use crate::script_runner::DEFAULT_SHELL;
use crate::target::TargetRegistry;

/// Selected target and its variable values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchivingConfig {
    pub target: String,
    #[serde(default)]
    pub env: EnvOverrides,
}

/// Top-level operator configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveConfig {
    pub archiving: Option<ArchivingConfig>,
    /// Extra target definitions, relative to the config file's directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_definitions: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

impl ArchiveConfig {
    /// Load configuration from a YAML file
    ///
    /// A relative `target_definitions` path is resolved against the
    /// directory holding the config file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;

        let mut config = Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse configuration {:?}", path))?;

        if let (Some(defs), Some(dir)) = (config.target_definitions.as_mut(), path.parent()) {
            if defs.is_relative() {
                *defs = dir.join(&*defs);
            }
        }
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse configuration YAML")
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml =
            serde_yaml::to_string(self).context("Failed to serialize configuration to YAML")?;

        fs::write(&path, yaml)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Interpreter for script bodies
    pub fn shell(&self) -> &str {
        self.shell.as_deref().unwrap_or(DEFAULT_SHELL)
    }

    /// Built-in definitions, overridden by the configured definitions file
    pub fn registry(&self) -> Result<TargetRegistry> {
        let builtin = TargetRegistry::builtin().context("Built-in target definitions are invalid")?;
        match &self.target_definitions {
            Some(path) => {
                let user = TargetRegistry::from_file(path)
                    .with_context(|| format!("Failed to load target definitions {:?}", path))?;
                Ok(builtin.merged_with(user))
            }
            None => Ok(builtin),
        }
    }

    /// Check that the selected target exists and its environment resolves.
    pub fn validate(&self, registry: &TargetRegistry) -> Result<()> {
        self.validate_with(registry, &EnvOverrides::new())
    }

    /// Like [`validate`](Self::validate), with `extra` layered over
    /// `archiving.env` (e.g. values given on the command line).
    pub fn validate_with(&self, registry: &TargetRegistry, extra: &EnvOverrides) -> Result<()> {
        if let Some(shell) = &self.shell {
            if shell.trim().is_empty() {
                anyhow::bail!("Shell must not be empty");
            }
        }

        let Some(archiving) = &self.archiving else {
            return Ok(());
        };
        if archiving.target.trim().is_empty() {
            anyhow::bail!("archiving.target must be specified");
        }

        let target = registry.get(&archiving.target)?;
        target
            .resolve_env(&archiving.env.merged_with(extra))
            .with_context(|| format!("Invalid archiving.env for target '{}'", archiving.target))?;
        Ok(())
    }
}
