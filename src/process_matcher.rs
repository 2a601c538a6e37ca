//! Correlate running OS processes with logical targets.
//!
//! A transfer is recognized by its executable name and by one argument that
//! starts with the target's rendered argument prefix, e.g. `rsync` with an
//! argument starting `rsync://alice@nas:873/plots`. Matching is done against
//! a [`ProcessEntry`] snapshot so callers (and tests) can supply their own.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::env_schema::EnvOverrides;
use crate::error::Result;
use crate::target::{ProcessIdentity, TargetDefinition, TargetRegistry};

/// Length at which the kernel truncates `/proc/<pid>/comm`.
const COMM_MAX_LEN: usize = 15;

/// One row of a process table snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub args: Vec<String>,
}

impl ProcessEntry {
    pub fn new<I, S>(pid: u32, name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pid,
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Entries of `snapshot` whose name equals the identity's name and which
/// have at least one argument starting with its prefix. Snapshot order is
/// preserved.
pub fn match_processes<'a>(
    identity: &ProcessIdentity,
    snapshot: &'a [ProcessEntry],
) -> Vec<&'a ProcessEntry> {
    snapshot
        .iter()
        .filter(|entry| {
            entry.name == identity.name
                && entry
                    .args
                    .iter()
                    .any(|arg| arg.starts_with(&identity.argument_prefix))
        })
        .collect()
}

/// Transfers found running for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetProcesses {
    pub target_id: String,
    pub identity: ProcessIdentity,
    pub processes: Vec<ProcessEntry>,
}

/// Find running transfers of `target` in `snapshot`.
pub fn find_transfers(
    target: &TargetDefinition,
    overrides: &EnvOverrides,
    snapshot: &[ProcessEntry],
) -> Result<TargetProcesses> {
    let env = target.resolve_env(overrides)?;
    let identity = target.process_identity(&env)?;
    let processes: Vec<ProcessEntry> = match_processes(&identity, snapshot)
        .into_iter()
        .cloned()
        .collect();
    debug!(
        target_id = target.id(),
        name = %identity.name,
        prefix = %identity.argument_prefix,
        matched = processes.len(),
        "process match"
    );
    Ok(TargetProcesses {
        target_id: target.id().to_string(),
        identity,
        processes,
    })
}

/// Match every target in `registry` against one snapshot.
///
/// `overrides` holds per-target overrides keyed by target id. Targets whose
/// environment cannot be resolved (typically because nobody configured their
/// mandatory variables) are skipped, since no transfer of theirs can be
/// running under this configuration.
pub fn reconcile(
    registry: &TargetRegistry,
    overrides: &BTreeMap<String, EnvOverrides>,
    snapshot: &[ProcessEntry],
) -> Vec<TargetProcesses> {
    let empty = EnvOverrides::new();
    registry
        .iter()
        .filter_map(|target| {
            let target_overrides = overrides.get(target.id()).unwrap_or(&empty);
            match find_transfers(target, target_overrides, snapshot) {
                Ok(found) => Some(found),
                Err(e) => {
                    debug!(target_id = target.id(), "skipping target: {e}");
                    None
                }
            }
        })
        .collect()
}

/// Read the live process table.
///
/// On Linux this scans `/proc`. Processes that exit mid-scan, and kernel
/// threads without a command line, are skipped. Returns an empty snapshot on
/// other platforms or if `/proc` is unavailable.
pub fn snapshot() -> Vec<ProcessEntry> {
    #[cfg(target_os = "linux")]
    {
        snapshot_linux()
    }
    #[cfg(not(target_os = "linux"))]
    {
        Vec::new()
    }
}

#[cfg(target_os = "linux")]
fn snapshot_linux() -> Vec<ProcessEntry> {
    let Ok(proc_dir) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut entries: Vec<ProcessEntry> = proc_dir
        .flatten()
        .filter_map(|dir| {
            let pid: u32 = dir.file_name().to_str()?.parse().ok()?;
            read_process(pid)
        })
        .collect();
    entries.sort_by_key(|e| e.pid);
    entries
}

#[cfg(target_os = "linux")]
fn read_process(pid: u32) -> Option<ProcessEntry> {
    let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if cmdline.is_empty() {
        return None;
    }
    let args = split_cmdline(&cmdline);
    let name = process_name(comm.trim_end_matches('\n'), args.first().map(String::as_str));
    Some(ProcessEntry { pid, name, args })
}

/// Split a NUL-separated `/proc/<pid>/cmdline` into arguments.
fn split_cmdline(raw: &[u8]) -> Vec<String> {
    let raw = raw.strip_suffix(&[0u8]).unwrap_or(raw);
    raw.split(|b| *b == 0)
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

/// `comm` is cut at 15 bytes. When it looks truncated, take the full name
/// from the basename of `argv[0]` if that extends it.
fn process_name(comm: &str, argv0: Option<&str>) -> String {
    if comm.len() == COMM_MAX_LEN {
        if let Some(base) = argv0.and_then(|a| a.rsplit('/').next()) {
            if base.len() > comm.len() && base.starts_with(comm) {
                return base.to_string();
            }
        }
    }
    comm.to_string()
}
