//! Tests for probe and transfer execution against real processes
//!
//! These tests verify:
//! - Probe output parsing end to end, including tolerated garbage
//! - Non-zero probe exits discard all output
//! - Transfer success, failure codes and output streaming
//! - Dry-run mode never spawns
//! - A request addressed to another target is refused before spawning
//! - One prober serving concurrent probes

#![cfg(unix)]

use archtarget::{
    ArchiveError, ConfigError, DiskSpaceProber, EnvOverrides, OutputSink, OutputStream,
    ProbeError, TargetRegistry, TransferError, TransferInvoker, TransferRequest, WriterSink,
};
use std::fs;
use std::io;
use std::path::Path;
use std::thread;

fn registry(yaml: &str) -> TargetRegistry {
    TargetRegistry::from_yaml_str(yaml, None).expect("definitions should load")
}

const ECHO_TARGET: &str = r#"
target_definitions:
  echo:
    env:
      root: null
      exit_code: "0"
    disk_space_script: |
      printf '%s\n' "${root}/a:1000000000000" "garbage" "${root}/b/:500"
      exit "${exit_code}"
    transfer_script: |
      echo "copying ${source}"
      echo "to ${destination}" >&2
      cp "${source}" "${destination}"
    transfer_process_name: cp
    transfer_process_argument_prefix: "{root}"
"#;

#[derive(Default)]
struct Lines(Vec<(OutputStream, String)>);

impl OutputSink for Lines {
    fn line(&mut self, stream: OutputStream, line: &str) -> io::Result<()> {
        self.0.push((stream, line.to_string()));
        Ok(())
    }
}

// =============================================================================
// Disk Space Probes
// =============================================================================

#[test]
fn test_probe_parses_entries_and_keeps_warnings() {
    let registry = registry(ECHO_TARGET);
    let target = registry.get("echo").unwrap();

    let report = DiskSpaceProber::new()
        .probe(target, &EnvOverrides::new().set("root", "/mnt"))
        .unwrap();

    let entries: Vec<(&str, u64)> = report
        .entries()
        .iter()
        .map(|e| (e.path.as_str(), e.bytes_free))
        .collect();
    assert_eq!(entries, vec![("/mnt/a", 1_000_000_000_000), ("/mnt/b", 500)]);
    assert_eq!(report.warnings().len(), 1);
    assert_eq!(report.warnings()[0].line, "garbage");
    assert_eq!(report.warnings()[0].line_number, 2);
}

#[test]
fn test_probe_nonzero_exit_discards_valid_output() {
    let registry = registry(ECHO_TARGET);
    let target = registry.get("echo").unwrap();

    let err = DiskSpaceProber::new()
        .probe(
            target,
            &EnvOverrides::new().set("root", "/mnt").set("exit_code", "1"),
        )
        .unwrap_err();

    assert!(matches!(
        err,
        ArchiveError::Probe(ProbeError::Failed { code: Some(1), .. })
    ));
}

#[test]
fn test_probe_missing_variable_never_spawns() {
    let registry = registry(ECHO_TARGET);
    let target = registry.get("echo").unwrap();

    let err = DiskSpaceProber::new()
        .probe(target, &EnvOverrides::new())
        .unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn test_probe_spawn_failure() {
    let registry = registry(ECHO_TARGET);
    let target = registry.get("echo").unwrap();

    let err = DiskSpaceProber::new()
        .with_shell("/nonexistent/shell")
        .probe(target, &EnvOverrides::new().set("root", "/mnt"))
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Probe(ProbeError::Spawn { .. })));
}

#[test]
fn test_statvfs_probe() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
target_definitions:
  native:
    env:
      root: null
    disk_space_statvfs: ["{root}/"]
    transfer_executable:
      program: cp
      args: ["{source}", "{destination}"]
    transfer_process_name: cp
    transfer_process_argument_prefix: "{root}"
"#;
    let registry = registry(yaml);
    let target = registry.get("native").unwrap();
    let root = dir.path().to_string_lossy().to_string();

    let report = DiskSpaceProber::new()
        .probe(target, &EnvOverrides::new().set("root", root.as_str()))
        .unwrap();

    assert_eq!(report.len(), 1);
    assert_eq!(report.entries()[0].path, root.trim_end_matches('/'));
}

#[test]
fn test_concurrent_probes_share_one_prober() {
    let registry = registry(ECHO_TARGET);
    let target = registry.get("echo").unwrap();
    let prober = DiskSpaceProber::new();

    let reports: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let prober = &prober;
                scope.spawn(move || {
                    prober.probe(
                        target,
                        &EnvOverrides::new().set("root", format!("/mnt/{i}")),
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (i, report) in reports.into_iter().enumerate() {
        let report = report.unwrap();
        assert_eq!(report.get(&format!("/mnt/{i}/a")), Some(1_000_000_000_000));
    }
}

// =============================================================================
// Transfers
// =============================================================================

#[test]
fn test_transfer_copies_and_streams_output() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("plot.plot");
    let destination = dir.path().join("dest.plot");
    fs::write(&source, b"plot data").unwrap();

    let registry = registry(ECHO_TARGET);
    let target = registry.get("echo").unwrap();
    let request = TransferRequest::new("echo", &source, &destination);
    let mut lines = Lines::default();

    let outcome = TransferInvoker::new()
        .invoke(
            target,
            &EnvOverrides::new().set("root", dir.path().to_string_lossy()),
            &request,
            &mut lines,
        )
        .unwrap();

    assert!(!outcome.dry_run);
    assert_eq!(fs::read(&destination).unwrap(), b"plot data");
    assert!(lines.0.contains(&(
        OutputStream::Stdout,
        format!("copying {}", source.display())
    )));
    assert!(lines.0.contains(&(
        OutputStream::Stderr,
        format!("to {}", destination.display())
    )));
}

#[test]
fn test_transfer_failure_reports_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(ECHO_TARGET);
    let target = registry.get("echo").unwrap();
    let request = TransferRequest::new(
        "echo",
        dir.path().join("missing.plot"),
        dir.path().join("dest.plot"),
    );

    let err = TransferInvoker::new()
        .invoke(
            target,
            &EnvOverrides::new().set("root", dir.path().to_string_lossy()),
            &request,
            &mut Lines::default(),
        )
        .unwrap_err();

    // cp exits 1 when the source does not exist
    assert!(matches!(
        err,
        ArchiveError::Transfer(TransferError::Failed { code: Some(1), .. })
    ));
    assert!(!dir.path().join("dest.plot").exists());
}

#[test]
fn test_transfer_output_to_writer_sink() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("a.plot");
    fs::write(&source, b"x").unwrap();

    let registry = registry(ECHO_TARGET);
    let target = registry.get("echo").unwrap();
    let request = TransferRequest::new("echo", &source, dir.path().join("b.plot"));
    let mut sink = WriterSink::new(Vec::new());

    TransferInvoker::new()
        .invoke(
            target,
            &EnvOverrides::new().set("root", dir.path().to_string_lossy()),
            &request,
            &mut sink,
        )
        .unwrap();

    let written = String::from_utf8(sink.into_inner()).unwrap();
    assert!(written.contains("copying"));
    assert!(written.contains("to "));
}

#[test]
fn test_dry_run_does_not_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("a.plot");
    let destination = dir.path().join("b.plot");
    fs::write(&source, b"x").unwrap();

    let registry = registry(ECHO_TARGET);
    let target = registry.get("echo").unwrap();
    let request = TransferRequest::new("echo", &source, &destination);
    let mut lines = Lines::default();

    let outcome = TransferInvoker::new()
        .dry_run(true)
        .invoke(
            target,
            &EnvOverrides::new().set("root", dir.path().to_string_lossy()),
            &request,
            &mut lines,
        )
        .unwrap();

    assert!(outcome.dry_run);
    assert_eq!(outcome.pid, None);
    assert!(lines.0.is_empty());
    assert!(!destination.exists());
}

#[test]
fn test_request_for_another_target_never_spawns() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("a.plot");
    let destination = dir.path().join("b.plot");
    fs::write(&source, b"x").unwrap();

    let registry = registry(ECHO_TARGET);
    let target = registry.get("echo").unwrap();
    let request = TransferRequest::new("rsyncd", &source, &destination);
    let mut lines = Lines::default();

    let err = TransferInvoker::new()
        .invoke(
            target,
            &EnvOverrides::new().set("root", dir.path().to_string_lossy()),
            &request,
            &mut lines,
        )
        .unwrap_err();

    assert!(err.is_validation());
    assert!(matches!(
        err,
        ArchiveError::Config(ConfigError::TargetMismatch { ref requested, ref target })
            if requested == "rsyncd" && target == "echo"
    ));
    assert!(lines.0.is_empty());
    assert!(!destination.exists());
}

#[test]
fn test_transfer_rendering_binds_source_and_destination() {
    let registry = TargetRegistry::builtin().unwrap();
    let local = registry.get("local_rsync").unwrap();

    let prepared = TransferInvoker::new()
        .prepare(
            local,
            &EnvOverrides::new().set("site_root", "/farm"),
            Path::new("/tmp/x.plot"),
            Path::new("/farm/d1/x.plot"),
        )
        .unwrap();

    assert_eq!(prepared.env.get("source"), Some("/tmp/x.plot"));
    assert_eq!(prepared.env.get("destination"), Some("/farm/d1/x.plot"));
    let archtarget::Invocation::Shell { body } = &prepared.invocation else {
        panic!("local_rsync transfers through a script");
    };
    assert!(body.contains("\"rsync\" --preallocate"));
    assert!(body.contains("\"/tmp/x.plot\" \"/farm/d1/x.plot\""));
}
