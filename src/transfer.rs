//! Transfer invocation.
//!
//! A transfer binds `source` and `destination` into the target's resolved
//! environment, renders the transfer program and runs it until it exits.
//!
//! The invoker never retries and never touches the source or destination
//! itself. Transfer programs may move rather than copy (`rsync
//! --remove-source-files`), so after a failed or interrupted run the source
//! may be partially or entirely gone. What to do next is the caller's call.
//!
//! Transfers run in their own process group and get no death pact. A
//! transfer started with [`TransferInvoker::spawn_to_log`] is not tied to
//! this process's lifetime. One started with [`TransferInvoker::spawn`]
//! writes into pipes this process holds and dies on its next write once they
//! close. [`RunningTransfer::handle`] exposes the process group so a caller
//! can cancel from another thread.

use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::disk_space::exit_label;
use crate::env_schema::{ConfigError, EnvOverrides, ResolvedEnv};
use crate::error::Result;
use crate::process_guard::{self, CommandProcessGroup, Termination};
use crate::script_runner::{DEFAULT_SHELL, Invocation};
use crate::target::TargetDefinition;
use crate::template::TemplateError;

/// Errors raised while running a transfer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The transfer program could not be started
    #[error("failed to start transfer for target '{target}': {reason}")]
    Spawn { target: String, reason: String },

    /// The transfer program exited unsuccessfully
    #[error("transfer for target '{target}' failed ({})", exit_label(.code))]
    Failed { target: String, code: Option<i32> },

    /// Waiting on the transfer program failed
    #[error("I/O error while waiting on transfer for target '{target}': {reason}")]
    Io { target: String, reason: String },
}

/// One file to move to one destination of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRequest {
    pub target_id: String,
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl TransferRequest {
    pub fn new(
        target_id: impl Into<String>,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            source: source.into(),
            destination: destination.into(),
        }
    }
}

/// Which stream a line of transfer output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives transfer output line by line, without the trailing newline.
pub trait OutputSink {
    fn line(&mut self, stream: OutputStream, line: &str) -> io::Result<()>;
}

/// Logs each output line through `tracing`, tagged with the target id.
#[derive(Debug, Clone)]
pub struct TracingSink {
    target_id: String,
}

impl TracingSink {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
        }
    }
}

impl OutputSink for TracingSink {
    fn line(&mut self, stream: OutputStream, line: &str) -> io::Result<()> {
        info!(target_id = %self.target_id, %stream, "{line}");
        Ok(())
    }
}

/// Writes output lines to any writer, e.g. a per-transfer log file.
#[derive(Debug)]
pub struct WriterSink<W: Write> {
    writer: W,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> OutputSink for WriterSink<W> {
    fn line(&mut self, _stream: OutputStream, line: &str) -> io::Result<()> {
        writeln!(self.writer, "{line}")
    }
}

/// A rendered transfer, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedTransfer {
    pub target_id: String,
    pub env: ResolvedEnv,
    pub invocation: Invocation,
}

/// Result of a transfer that ran to a successful exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    pub target_id: String,
    /// None for dry runs
    pub pid: Option<u32>,
    pub dry_run: bool,
}

/// Cloneable handle to a running transfer's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHandle {
    pgid: u32,
}

impl TransferHandle {
    /// Process group id (equal to the leader's pid)
    pub fn process_group(&self) -> u32 {
        self.pgid
    }

    /// SIGTERM the whole group, SIGKILL after `grace_period`
    pub fn terminate(&self, grace_period: Duration) -> Termination {
        process_guard::terminate_group(self.pgid, grace_period)
    }
}

/// A spawned transfer process.
#[derive(Debug)]
pub struct RunningTransfer {
    target_id: String,
    child: Child,
}

impl RunningTransfer {
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// The transfer leads its own process group
    pub fn process_group(&self) -> u32 {
        self.child.id()
    }

    pub fn handle(&self) -> TransferHandle {
        TransferHandle {
            pgid: self.process_group(),
        }
    }

    /// Terminate the transfer's process group and reap it.
    pub fn terminate(&mut self, grace_period: Duration) -> Termination {
        let outcome = self.handle().terminate(grace_period);
        if let Err(e) = self.child.wait() {
            warn!(target_id = %self.target_id, "failed to reap terminated transfer: {e}");
        }
        outcome
    }

    /// Stream output to `sink` and block until the process exits.
    ///
    /// Sink failures are logged and do not affect the transfer. When output
    /// was redirected to a log file there is nothing to stream.
    pub fn wait(
        mut self,
        sink: &mut dyn OutputSink,
    ) -> std::result::Result<TransferOutcome, TransferError> {
        let (tx, rx) = mpsc::channel::<(OutputStream, String)>();
        let mut readers = Vec::new();
        if let Some(stdout) = self.child.stdout.take() {
            readers.push(spawn_line_reader(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = self.child.stderr.take() {
            readers.push(spawn_line_reader(stderr, OutputStream::Stderr, tx.clone()));
        }
        drop(tx);

        let mut sink_failed = false;
        for (stream, line) in rx {
            if let Err(e) = sink.line(stream, &line) {
                if !sink_failed {
                    warn!(target_id = %self.target_id, "transfer output sink failed: {e}");
                    sink_failed = true;
                }
            }
        }
        for reader in readers {
            let _ = reader.join();
        }

        let pid = self.child.id();
        let status = self.child.wait().map_err(|e| TransferError::Io {
            target: self.target_id.clone(),
            reason: e.to_string(),
        })?;

        if status.success() {
            info!(target_id = %self.target_id, pid, "transfer completed");
            Ok(TransferOutcome {
                target_id: self.target_id,
                pid: Some(pid),
                dry_run: false,
            })
        } else {
            warn!(target_id = %self.target_id, pid, code = ?status.code(), "transfer failed");
            Err(TransferError::Failed {
                target: self.target_id,
                code: status.code(),
            })
        }
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<(OutputStream, String)>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send((stream, line)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Runs transfers. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct TransferInvoker {
    shell: String,
    dry_run: bool,
}

impl Default for TransferInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferInvoker {
    pub fn new() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            dry_run: false,
        }
    }

    /// Use a different interpreter for transfer scripts
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Render and log transfers instead of running them
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Resolve the target's environment and render the transfer.
    pub fn prepare(
        &self,
        target: &TargetDefinition,
        overrides: &EnvOverrides,
        source: &Path,
        destination: &Path,
    ) -> Result<PreparedTransfer> {
        let env = target.resolve_env(overrides)?;
        Ok(self.prepare_with_env(target, &env, source, destination)?)
    }

    /// Render the transfer against an already resolved environment.
    pub fn prepare_with_env(
        &self,
        target: &TargetDefinition,
        env: &ResolvedEnv,
        source: &Path,
        destination: &Path,
    ) -> std::result::Result<PreparedTransfer, TemplateError> {
        let env = target.transfer_env(env, source, destination);
        let invocation = target.render_transfer(&env)?;
        debug!(target_id = target.id(), ?source, ?destination, "transfer rendered");
        Ok(PreparedTransfer {
            target_id: target.id().to_string(),
            env,
            invocation,
        })
    }

    /// Spawn with stdout and stderr piped back for [`RunningTransfer::wait`].
    ///
    /// The pipes tie the transfer to this process: once the caller exits or
    /// drops the [`RunningTransfer`], the next write the transfer makes fails
    /// with SIGPIPE. Only [`spawn_to_log`](Self::spawn_to_log) survives a
    /// restart of the caller.
    pub fn spawn(
        &self,
        prepared: &PreparedTransfer,
    ) -> std::result::Result<RunningTransfer, TransferError> {
        self.spawn_with(prepared, Stdio::piped(), Stdio::piped())
    }

    /// Spawn with stdout and stderr appended to `log_path`.
    ///
    /// The process keeps writing there even if this process exits.
    pub fn spawn_to_log(
        &self,
        prepared: &PreparedTransfer,
        log_path: &Path,
    ) -> std::result::Result<RunningTransfer, TransferError> {
        let spawn_error = |e: io::Error| TransferError::Spawn {
            target: prepared.target_id.clone(),
            reason: format!("cannot open log {}: {e}", log_path.display()),
        };
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(spawn_error)?;
        let log_err = log.try_clone().map_err(spawn_error)?;
        self.spawn_with(prepared, Stdio::from(log), Stdio::from(log_err))
    }

    fn spawn_with(
        &self,
        prepared: &PreparedTransfer,
        stdout: Stdio,
        stderr: Stdio,
    ) -> std::result::Result<RunningTransfer, TransferError> {
        info!(
            target_id = %prepared.target_id,
            "launching transfer: {}",
            prepared.invocation.describe(&self.shell)
        );

        let child = prepared
            .invocation
            .command(&self.shell, &prepared.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .in_new_process_group()
            .spawn()
            .map_err(|e| TransferError::Spawn {
                target: prepared.target_id.clone(),
                reason: e.to_string(),
            })?;

        debug!(target_id = %prepared.target_id, pid = child.id(), "transfer spawned");
        Ok(RunningTransfer {
            target_id: prepared.target_id.clone(),
            child,
        })
    }

    /// Prepare, spawn and wait for one transfer.
    ///
    /// `request.target_id` must name `target`.
    pub fn invoke(
        &self,
        target: &TargetDefinition,
        overrides: &EnvOverrides,
        request: &TransferRequest,
        sink: &mut dyn OutputSink,
    ) -> Result<TransferOutcome> {
        if request.target_id != target.id() {
            return Err(ConfigError::TargetMismatch {
                requested: request.target_id.clone(),
                target: target.id().to_string(),
            }
            .into());
        }
        let prepared = self.prepare(target, overrides, &request.source, &request.destination)?;

        if self.dry_run {
            info!(
                target_id = %prepared.target_id,
                "[DRY RUN] would run: {}",
                prepared.invocation.describe(&self.shell)
            );
            return Ok(TransferOutcome {
                target_id: prepared.target_id,
                pid: None,
                dry_run: true,
            });
        }

        let running = self.spawn(&prepared)?;
        Ok(running.wait(sink)?)
    }
}
