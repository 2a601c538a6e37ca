//! Target definitions and the read-only target registry.
//!
//! A target is one concrete record: its environment contract, how to probe
//! free space, how to transfer a file, and how to recognise a running
//! transfer in the process table. Differences between targets live entirely
//! in that data.
//!
//! Definitions are loaded from YAML:
//!
//! ```yaml
//! target_definitions:
//!   local_rsync:
//!     env:
//!       command: rsync
//!       site_root: null
//!     disk_space_script: |
//!       df -aBK | grep " ${site_root}/" | ...
//!     transfer_script: |
//!       "${command}" "${source}" "${destination}"
//!     transfer_process_name: "{command}"
//!     transfer_process_argument_prefix: "{site_root}"
//! ```
//!
//! Each target gives exactly one disk space form (`disk_space_script`,
//! `disk_space_path`, `disk_space_executable` or `disk_space_statvfs`) and
//! exactly one transfer form (`transfer_script`, `transfer_path` or
//! `transfer_executable`). Script paths are read at load time.

use serde::Deserialize;
use serde::de::{Deserializer, MapAccess, Visitor};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::env_schema::{ConfigError, EnvOverrides, EnvSchema, ResolvedEnv};
use crate::error::Result;
use crate::script_runner::Invocation;
use crate::template::{Template, TemplateError};

/// Binding added to the environment for the file being transferred.
pub const SOURCE_VAR: &str = "source";
/// Binding added to the environment for the transfer destination.
pub const DESTINATION_VAR: &str = "destination";

const BUILTIN_DEFINITIONS: &str = include_str!("../resources/target_definitions.yaml");

/// A program run directly, each element an identifier template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableSpec {
    pub program: Template,
    pub args: Vec<Template>,
}

impl ExecutableSpec {
    fn render(&self, env: &ResolvedEnv) -> std::result::Result<Invocation, TemplateError> {
        Ok(Invocation::Executable {
            program: self.program.render(env)?,
            args: self
                .args
                .iter()
                .map(|a| a.render(env))
                .collect::<std::result::Result<_, _>>()?,
        })
    }

    fn templates(&self) -> impl Iterator<Item = &Template> {
        std::iter::once(&self.program).chain(self.args.iter())
    }

    /// Unrendered `program arg ...` line
    pub fn source_line(&self) -> String {
        self.templates()
            .map(Template::source)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a target reports free space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeBackend {
    /// Shell program printing `path:bytes` lines.
    Script(Template),
    /// Program printing `path:bytes` lines, run without a shell.
    Executable(ExecutableSpec),
    /// Paths queried natively with statvfs.
    Statvfs(Vec<Template>),
}

/// A rendered probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedProbe {
    Command(Invocation),
    Statvfs(Vec<PathBuf>),
}

/// How a target moves one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferBackend {
    Script(Template),
    Executable(ExecutableSpec),
}

/// Rendered identity of a running transfer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ProcessIdentity {
    pub name: String,
    pub argument_prefix: String,
}

/// A named archive destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDefinition {
    id: String,
    env: EnvSchema,
    disk_space: ProbeBackend,
    transfer: TransferBackend,
    transfer_process_name: Template,
    transfer_process_argument_prefix: Template,
}

impl TargetDefinition {
    /// Build a definition and check that every template only references
    /// declared variables.
    pub fn new(
        id: impl Into<String>,
        env: EnvSchema,
        disk_space: ProbeBackend,
        transfer: TransferBackend,
        transfer_process_name: Template,
        transfer_process_argument_prefix: Template,
    ) -> std::result::Result<Self, ConfigError> {
        let definition = Self {
            id: id.into(),
            env,
            disk_space,
            transfer,
            transfer_process_name,
            transfer_process_argument_prefix,
        };
        definition.validate_structure()?;
        Ok(definition)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn env(&self) -> &EnvSchema {
        &self.env
    }

    pub fn disk_space(&self) -> &ProbeBackend {
        &self.disk_space
    }

    pub fn transfer(&self) -> &TransferBackend {
        &self.transfer
    }

    pub fn transfer_process_name(&self) -> &Template {
        &self.transfer_process_name
    }

    pub fn transfer_process_argument_prefix(&self) -> &Template {
        &self.transfer_process_argument_prefix
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidDefinition {
            target: self.id.clone(),
            reason: reason.into(),
        }
    }

    fn validate_structure(&self) -> std::result::Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(self.invalid("target id must not be empty"));
        }

        for reserved in [SOURCE_VAR, DESTINATION_VAR] {
            if self.env.get(reserved).is_some() {
                return Err(self.invalid(format!(
                    "'{reserved}' is bound per transfer and cannot be declared in env"
                )));
            }
        }

        let declared: BTreeSet<&str> = self.env.iter().map(|(name, _)| name).collect();

        let mut probe_templates: Vec<&Template> = Vec::new();
        match &self.disk_space {
            ProbeBackend::Script(t) => probe_templates.push(t),
            ProbeBackend::Executable(spec) => probe_templates.extend(spec.templates()),
            ProbeBackend::Statvfs(paths) => {
                if paths.is_empty() {
                    return Err(self.invalid("disk_space_statvfs needs at least one path"));
                }
                probe_templates.extend(paths.iter());
            }
        }
        probe_templates.push(&self.transfer_process_name);
        probe_templates.push(&self.transfer_process_argument_prefix);

        let transfer_templates: Vec<&Template> = match &self.transfer {
            TransferBackend::Script(t) => vec![t],
            TransferBackend::Executable(spec) => spec.templates().collect(),
        };

        let mut undeclared = BTreeSet::new();
        for (templates, per_transfer) in [(probe_templates, false), (transfer_templates, true)] {
            for template in templates {
                let names = template
                    .placeholders()
                    .map_err(|e| self.invalid(e.to_string()))?;
                for name in names {
                    let bound = declared.contains(name.as_str())
                        || (per_transfer && (name == SOURCE_VAR || name == DESTINATION_VAR));
                    if !bound {
                        undeclared.insert(name);
                    }
                }
            }
        }

        if !undeclared.is_empty() {
            let names: Vec<String> = undeclared.into_iter().collect();
            return Err(self.invalid(format!(
                "templates reference undeclared variables: {}",
                names.join(", ")
            )));
        }

        Ok(())
    }

    /// Resolve this target's environment against caller overrides
    pub fn resolve_env(
        &self,
        overrides: &EnvOverrides,
    ) -> std::result::Result<ResolvedEnv, ConfigError> {
        self.env.resolve(&self.id, overrides)
    }

    /// Render the disk space probe
    pub fn render_disk_space(
        &self,
        env: &ResolvedEnv,
    ) -> std::result::Result<RenderedProbe, TemplateError> {
        match &self.disk_space {
            ProbeBackend::Script(t) => Ok(RenderedProbe::Command(Invocation::Shell {
                body: t.render(env)?,
            })),
            ProbeBackend::Executable(spec) => Ok(RenderedProbe::Command(spec.render(env)?)),
            ProbeBackend::Statvfs(paths) => Ok(RenderedProbe::Statvfs(
                paths
                    .iter()
                    .map(|p| p.render(env).map(PathBuf::from))
                    .collect::<std::result::Result<_, _>>()?,
            )),
        }
    }

    /// Environment for one transfer: `env` plus `source` and `destination`
    pub fn transfer_env(
        &self,
        env: &ResolvedEnv,
        source: &Path,
        destination: &Path,
    ) -> ResolvedEnv {
        env.with(SOURCE_VAR, source.to_string_lossy())
            .with(DESTINATION_VAR, destination.to_string_lossy())
    }

    /// Render the transfer program against a transfer environment
    pub fn render_transfer(
        &self,
        transfer_env: &ResolvedEnv,
    ) -> std::result::Result<Invocation, TemplateError> {
        match &self.transfer {
            TransferBackend::Script(t) => Ok(Invocation::Shell {
                body: t.render(transfer_env)?,
            }),
            TransferBackend::Executable(spec) => spec.render(transfer_env),
        }
    }

    /// Render the process name and argument prefix of a running transfer
    pub fn process_identity(
        &self,
        env: &ResolvedEnv,
    ) -> std::result::Result<ProcessIdentity, TemplateError> {
        Ok(ProcessIdentity {
            name: self.transfer_process_name.render(env)?,
            argument_prefix: self.transfer_process_argument_prefix.render(env)?,
        })
    }
}

// -- YAML loading ------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawExecutable {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

impl From<RawExecutable> for ExecutableSpec {
    fn from(raw: RawExecutable) -> Self {
        Self {
            program: Template::identifier(raw.program),
            args: raw.args.into_iter().map(Template::identifier).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTarget {
    #[serde(default)]
    env: EnvSchema,
    disk_space_script: Option<String>,
    disk_space_path: Option<PathBuf>,
    disk_space_executable: Option<RawExecutable>,
    disk_space_statvfs: Option<Vec<String>>,
    transfer_script: Option<String>,
    transfer_path: Option<PathBuf>,
    transfer_executable: Option<RawExecutable>,
    transfer_process_name: String,
    transfer_process_argument_prefix: String,
}

#[derive(Debug, Deserialize)]
struct RawDefinitions {
    #[serde(deserialize_with = "ordered_targets")]
    target_definitions: Vec<(String, RawTarget)>,
}

/// Keep file order and let duplicates through so they can be reported by id.
fn ordered_targets<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<(String, RawTarget)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedVisitor;

    impl<'de> Visitor<'de> for OrderedVisitor {
        type Value = Vec<(String, RawTarget)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of target id to target definition")
        }

        fn visit_map<A: MapAccess<'de>>(
            self,
            mut map: A,
        ) -> std::result::Result<Self::Value, A::Error> {
            let mut out = Vec::new();
            while let Some((id, target)) = map.next_entry::<String, RawTarget>()? {
                out.push((id, target));
            }
            Ok(out)
        }
    }

    deserializer.deserialize_map(OrderedVisitor)
}

fn read_script(
    id: &str,
    path: &Path,
    base_dir: Option<&Path>,
) -> std::result::Result<String, ConfigError> {
    let full = match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    };
    std::fs::read_to_string(&full).map_err(|e| ConfigError::ScriptUnreadable {
        target: id.to_string(),
        path: full.display().to_string(),
        reason: e.to_string(),
    })
}

impl RawTarget {
    fn into_definition(
        self,
        id: String,
        base_dir: Option<&Path>,
    ) -> std::result::Result<TargetDefinition, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidDefinition {
            target: id.clone(),
            reason: reason.to_string(),
        };

        let disk_space = match (
            self.disk_space_script,
            self.disk_space_path,
            self.disk_space_executable,
            self.disk_space_statvfs,
        ) {
            (Some(script), None, None, None) => ProbeBackend::Script(Template::shell(script)),
            (None, Some(path), None, None) => {
                ProbeBackend::Script(Template::shell(read_script(&id, &path, base_dir)?))
            }
            (None, None, Some(exe), None) => ProbeBackend::Executable(exe.into()),
            (None, None, None, Some(paths)) => {
                ProbeBackend::Statvfs(paths.into_iter().map(Template::identifier).collect())
            }
            (None, None, None, None) => return Err(invalid("no disk space probe given")),
            _ => return Err(invalid("more than one disk space probe given")),
        };

        let transfer = match (self.transfer_script, self.transfer_path, self.transfer_executable) {
            (Some(script), None, None) => TransferBackend::Script(Template::shell(script)),
            (None, Some(path), None) => {
                TransferBackend::Script(Template::shell(read_script(&id, &path, base_dir)?))
            }
            (None, None, Some(exe)) => TransferBackend::Executable(exe.into()),
            (None, None, None) => return Err(invalid("no transfer program given")),
            _ => return Err(invalid("more than one transfer program given")),
        };

        TargetDefinition::new(
            id.clone(),
            self.env,
            disk_space,
            transfer,
            Template::identifier(self.transfer_process_name),
            Template::identifier(self.transfer_process_argument_prefix),
        )
    }
}

/// Read-only collection of target definitions, in load order.
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    targets: Vec<TargetDefinition>,
}

impl TargetRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The definitions shipped with the crate (`local_rsync`, `rsyncd`)
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_DEFINITIONS, None)
    }

    /// Parse definitions from YAML.
    ///
    /// Relative `*_path` entries resolve against `base_dir` when given.
    pub fn from_yaml_str(yaml: &str, base_dir: Option<&Path>) -> Result<Self> {
        let raw: RawDefinitions = serde_yaml::from_str(yaml)?;
        let mut registry = Self::new();

        for (id, target) in raw.target_definitions {
            if registry.get(&id).is_ok() {
                return Err(ConfigError::DuplicateTarget { target: id }.into());
            }
            let definition = target.into_definition(id, base_dir)?;
            tracing::debug!(target_id = definition.id(), "loaded target definition");
            registry.targets.push(definition);
        }

        Ok(registry)
    }

    /// Load definitions from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content, path.parent())
    }

    /// Add a definition, replacing any existing one with the same id
    pub fn register(&mut self, definition: TargetDefinition) {
        match self.targets.iter_mut().find(|t| t.id == definition.id) {
            Some(existing) => *existing = definition,
            None => self.targets.push(definition),
        }
    }

    /// Layer `other` over `self`; definitions in `other` win by id
    pub fn merged_with(mut self, other: TargetRegistry) -> Self {
        for definition in other.targets {
            self.register(definition);
        }
        self
    }

    /// Look up a target by id
    pub fn get(&self, id: &str) -> std::result::Result<&TargetDefinition, ConfigError> {
        self.targets
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| ConfigError::UnknownTarget {
                target: id.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetDefinition> {
        self.targets.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
