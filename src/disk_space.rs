//! Disk space probing.
//!
//! A probe program prints one line per candidate directory:
//!
//! ```text
//! /mnt/farm/disk1:1000000000000
//! /mnt/farm/disk2:523452416
//! ```
//!
//! Parsing is best-effort: lines that do not fit are recorded as
//! [`ParseWarning`]s and skipped. A probe that exits non-zero is a
//! [`ProbeError`] and nothing it printed is trusted.
//!
//! Results are never cached. Free space changes under concurrent transfers,
//! so callers re-probe before each placement decision.

use nix::sys::statvfs::statvfs;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::env_schema::{EnvOverrides, ResolvedEnv};
use crate::error::Result;
use crate::script_runner::{self, DEFAULT_SHELL};
use crate::target::{RenderedProbe, TargetDefinition};

/// Errors raised while running a probe
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The probe program could not be started
    #[error("failed to start disk space probe for target '{target}': {reason}")]
    Spawn { target: String, reason: String },

    /// The probe program exited unsuccessfully; its output was discarded
    #[error(
        "disk space probe for target '{target}' failed ({}): {}",
        exit_label(.code),
        .stderr.trim()
    )]
    Failed {
        target: String,
        code: Option<i32>,
        stderr: String,
    },

    /// A native statvfs probe failed for one of its paths
    #[error("statvfs failed for '{path}' (target '{target}'): {reason}")]
    Statvfs {
        target: String,
        path: String,
        reason: String,
    },
}

pub(crate) fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_string(),
    }
}

/// Free space at one candidate directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskSpaceEntry {
    pub path: String,
    pub bytes_free: u64,
}

/// A probe output line that was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseWarning {
    /// 1-based line number in the probe output
    pub line_number: usize,
    pub line: String,
    pub reason: String,
}

/// Parsed result of one probe, in order of appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskSpaceReport {
    entries: Vec<DiskSpaceEntry>,
    warnings: Vec<ParseWarning>,
}

impl DiskSpaceReport {
    pub fn entries(&self) -> &[DiskSpaceEntry] {
        &self.entries
    }

    pub fn warnings(&self) -> &[ParseWarning] {
        &self.warnings
    }

    pub fn into_entries(self) -> Vec<DiskSpaceEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Free bytes for an exact (normalized) path
    pub fn get(&self, path: &str) -> Option<u64> {
        let path = normalize_path(path);
        self.entries
            .iter()
            .find(|e| e.path == path)
            .map(|e| e.bytes_free)
    }

    /// Entry a destination belongs to: the longest reported path that is a
    /// component-wise prefix of `destination`.
    pub fn entry_for(&self, destination: impl AsRef<Path>) -> Option<&DiskSpaceEntry> {
        let destination = destination.as_ref();
        self.entries
            .iter()
            .filter(|e| destination.starts_with(&e.path))
            .max_by_key(|e| Path::new(&e.path).components().count())
    }

    /// Record an entry; a repeated path keeps its first position and takes
    /// the latest value.
    fn insert(&mut self, path: String, bytes_free: u64) {
        match self.entries.iter_mut().find(|e| e.path == path) {
            Some(existing) => existing.bytes_free = bytes_free,
            None => self.entries.push(DiskSpaceEntry { path, bytes_free }),
        }
    }
}

/// Strip trailing slashes; the root directory stays `/`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Parse a byte count. Floats from upstream arithmetic are floored.
fn parse_bytes(raw: &str) -> std::result::Result<u64, String> {
    if raw.is_empty() {
        return Err("empty byte count".to_string());
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw
            .parse::<u64>()
            .map_err(|_| format!("byte count '{raw}' out of range"));
    }
    if !raw
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
        return Err(format!("byte count '{raw}' is not a number"));
    }

    let value: f64 = raw
        .parse()
        .map_err(|_| format!("byte count '{raw}' is not a number"))?;
    if !value.is_finite() {
        return Err(format!("byte count '{raw}' is not finite"));
    }
    if value < 0.0 {
        return Err(format!("byte count '{raw}' is negative"));
    }
    let floored = value.floor();
    if floored >= u64::MAX as f64 {
        return Err(format!("byte count '{raw}' out of range"));
    }
    Ok(floored as u64)
}

/// Parse probe stdout into a report. Never fails.
pub fn parse_disk_space(stdout: &str) -> DiskSpaceReport {
    let mut report = DiskSpaceReport::default();

    for (index, raw_line) in stdout.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = match line.rsplit_once(':') {
            None => Err("missing ':' separator".to_string()),
            Some((path, _)) if normalize_path(path.trim()).is_empty() => {
                Err("empty path".to_string())
            }
            Some((path, bytes)) => {
                parse_bytes(bytes.trim()).map(|b| (normalize_path(path.trim()), b))
            }
        };

        match parsed {
            Ok((path, bytes_free)) => report.insert(path, bytes_free),
            Err(reason) => {
                warn!(line_number = index + 1, line, "skipping disk space line: {reason}");
                report.warnings.push(ParseWarning {
                    line_number: index + 1,
                    line: line.to_string(),
                    reason,
                });
            }
        }
    }

    report
}

/// Runs disk space probes. Holds no mutable state, so one prober can serve
/// any number of threads.
#[derive(Debug, Clone)]
pub struct DiskSpaceProber {
    shell: String,
}

impl Default for DiskSpaceProber {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskSpaceProber {
    pub fn new() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
        }
    }

    /// Use a different interpreter for script probes
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Resolve, render and run the probe of `target`.
    pub fn probe(
        &self,
        target: &TargetDefinition,
        overrides: &EnvOverrides,
    ) -> Result<DiskSpaceReport> {
        let env = target.resolve_env(overrides)?;
        self.probe_with_env(target, &env)
    }

    /// Render and run the probe against an already resolved environment.
    pub fn probe_with_env(
        &self,
        target: &TargetDefinition,
        env: &ResolvedEnv,
    ) -> Result<DiskSpaceReport> {
        let rendered = target.render_disk_space(env)?;
        let report = match rendered {
            RenderedProbe::Command(invocation) => {
                let label = format!("disk space probe [{}]", target.id());
                let output = script_runner::run_captured(&label, &invocation, &self.shell, env)
                    .map_err(|e| ProbeError::Spawn {
                        target: target.id().to_string(),
                        reason: e.to_string(),
                    })?;
                if !output.success {
                    return Err(ProbeError::Failed {
                        target: target.id().to_string(),
                        code: output.exit_code,
                        stderr: output.stderr,
                    }
                    .into());
                }
                parse_disk_space(&output.stdout)
            }
            RenderedProbe::Statvfs(paths) => statvfs_report(target.id(), &paths)?,
        };

        debug!(
            target_id = target.id(),
            entries = report.len(),
            warnings = report.warnings().len(),
            "disk space probe complete"
        );
        Ok(report)
    }
}

fn statvfs_report(
    target: &str,
    paths: &[PathBuf],
) -> std::result::Result<DiskSpaceReport, ProbeError> {
    let mut report = DiskSpaceReport::default();
    for path in paths {
        let stat = statvfs(path.as_path()).map_err(|e| ProbeError::Statvfs {
            target: target.to_string(),
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let bytes_free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        report.insert(normalize_path(&path.to_string_lossy()), bytes_free);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(report: &DiskSpaceReport) -> Vec<(&str, u64)> {
        report
            .entries()
            .iter()
            .map(|e| (e.path.as_str(), e.bytes_free))
            .collect()
    }

    #[test]
    fn test_parse_in_order() {
        let report = parse_disk_space("/mnt/a:1000000000000\n/mnt/b:500\n");
        assert_eq!(pairs(&report), vec![("/mnt/a", 1_000_000_000_000), ("/mnt/b", 500)]);
        assert!(report.warnings().is_empty());
    }

    #[test]
    fn test_trailing_slash_normalized() {
        let report = parse_disk_space("/mnt/a/:42");
        assert_eq!(pairs(&report), vec![("/mnt/a", 42)]);
        assert_eq!(report.get("/mnt/a//"), Some(42));
    }

    #[test]
    fn test_root_path_kept() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("///"), "/");
        assert_eq!(normalize_path("rel/dir/"), "rel/dir");
    }

    #[test]
    fn test_garbage_skipped_and_later_lines_parsed() {
        let report = parse_disk_space("garbage\n/mnt/b:7\n");
        assert_eq!(pairs(&report), vec![("/mnt/b", 7)]);
        assert_eq!(report.warnings().len(), 1);
        assert_eq!(report.warnings()[0].line_number, 1);
        assert_eq!(report.warnings()[0].line, "garbage");
    }

    #[test]
    fn test_float_counts_are_floored() {
        let report = parse_disk_space("/a:1024.9\n/b:1.5e3\n/c:2E+2\n");
        assert_eq!(pairs(&report), vec![("/a", 1024), ("/b", 1500), ("/c", 200)]);
    }

    #[test]
    fn test_invalid_counts_warn() {
        let report = parse_disk_space(
            "/a:-5\n/b:inf\n/c:NaN\n/d:\n/e:12abc\n/f:99999999999999999999999\n:5\n",
        );
        assert!(report.is_empty());
        assert_eq!(report.warnings().len(), 7);
    }

    #[test]
    fn test_path_with_colon_splits_at_last() {
        let report = parse_disk_space("/mnt/odd:name:10\n");
        assert_eq!(pairs(&report), vec![("/mnt/odd:name", 10)]);
    }

    #[test]
    fn test_blank_lines_and_whitespace() {
        let report = parse_disk_space("\n  /mnt/a : 5 \n\n");
        assert_eq!(pairs(&report), vec![("/mnt/a", 5)]);
        assert!(report.warnings().is_empty());
    }

    #[test]
    fn test_duplicate_path_keeps_position_takes_latest() {
        let report = parse_disk_space("/a:1\n/b:2\n/a/:3\n");
        assert_eq!(pairs(&report), vec![("/a", 3), ("/b", 2)]);
    }

    #[test]
    fn test_entry_for_attributes_subpaths() {
        let report = parse_disk_space("/farm:10\n/farm/disk1:20\n/farmhouse:30\n");

        assert_eq!(report.entry_for("/farm/disk1/sub/plot.plot").unwrap().path, "/farm/disk1");
        assert_eq!(report.entry_for("/farm/disk2/plot.plot").unwrap().path, "/farm");
        assert_eq!(report.entry_for("/farmhouse/x").unwrap().path, "/farmhouse");
        assert!(report.entry_for("/elsewhere").is_none());
    }

    #[test]
    fn test_statvfs_root() {
        let report = statvfs_report("native", &[PathBuf::from("/")]).unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report.entries()[0].path, "/");
    }

    #[test]
    fn test_statvfs_missing_path() {
        let err =
            statvfs_report("native", &[PathBuf::from("/nonexistent/archtarget")]).unwrap_err();
        assert!(matches!(err, ProbeError::Statvfs { .. }));
    }
}
