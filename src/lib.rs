//! Archive target runtime
//!
//! Declarative archive targets (an env schema plus a disk space probe, a
//! transfer program and a process identity) are loaded into a
//! [`TargetRegistry`], validated against caller overrides, rendered, and run:
//!
//! - [`DiskSpaceProber`] reports free bytes per candidate directory;
//! - [`TransferInvoker`] moves one file and streams its output;
//! - [`process_matcher`] finds transfers that are already running.

pub mod cli;
pub mod config_file;
pub mod disk_space;
pub mod env_schema;
pub mod error;
pub mod process_guard;
pub mod process_matcher;
pub mod script_runner;
pub mod target;
pub mod template;
pub mod transfer;

pub use config_file::{ArchiveConfig, ArchivingConfig};
pub use disk_space::{
    DiskSpaceEntry, DiskSpaceProber, DiskSpaceReport, ParseWarning, ProbeError, parse_disk_space,
};
pub use env_schema::{ConfigError, EnvDefault, EnvOverrides, EnvSchema, ResolvedEnv};
pub use error::{ArchiveError, Result};
pub use process_guard::{CommandProcessGroup, Termination};
pub use process_matcher::{ProcessEntry, TargetProcesses, match_processes};
pub use script_runner::{Invocation, ScriptOutput};
pub use target::{
    ExecutableSpec, ProbeBackend, ProcessIdentity, TargetDefinition, TargetRegistry,
    TransferBackend,
};
pub use template::{Syntax, Template, TemplateError};
pub use transfer::{
    OutputSink, OutputStream, RunningTransfer, TracingSink, TransferError, TransferHandle,
    TransferInvoker, TransferOutcome, TransferRequest, WriterSink,
};
