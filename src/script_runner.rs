//! Subprocess execution for rendered target programs.
//!
//! Probes and transfers both reduce to an [`Invocation`]: either a script body
//! handed to a shell as `<shell> -c <body>`, or an executable run directly.
//! In both cases the resolved environment is exported to the child on top of
//! the inherited process environment, so a script can use its variables
//! whether or not they were substituted inline.

use crate::env_schema::ResolvedEnv;
use crate::process_guard::CommandProcessGroup;
use serde::Serialize;
use std::io;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Interpreter used for script bodies unless configured otherwise.
pub const DEFAULT_SHELL: &str = "bash";

/// A fully rendered program, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Invocation {
    /// Script body run through the configured shell.
    Shell { body: String },
    /// Program run directly, without a shell.
    Executable { program: String, args: Vec<String> },
}

impl Invocation {
    /// Build the `Command` for this invocation with `env` exported.
    ///
    /// Stdio is left for the caller to configure.
    pub fn command(&self, shell: &str, env: &ResolvedEnv) -> Command {
        let mut cmd = match self {
            Invocation::Shell { body } => {
                let mut cmd = Command::new(shell);
                cmd.arg("-c").arg(body);
                cmd
            }
            Invocation::Executable { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };
        cmd.envs(env.iter());
        cmd
    }

    /// Short description for logs.
    pub fn describe(&self, shell: &str) -> String {
        match self {
            Invocation::Shell { body } => {
                format!("{shell} -c <script, {} lines>", body.lines().count())
            }
            Invocation::Executable { program, args } => {
                if args.is_empty() {
                    program.clone()
                } else {
                    format!("{program} {}", args.join(" "))
                }
            }
        }
    }
}

/// Run an invocation to completion, capturing stdout and stderr.
///
/// The child is tied to this process's lifetime: it gets its own process
/// group and is sent SIGTERM if we die first.
///
/// # Returns
///
/// - `Ok(output)` - the process ran; inspect `success`/`exit_code`
/// - `Err` - the process could not be spawned or waited on
pub fn run_captured(
    label: &str,
    invocation: &Invocation,
    shell: &str,
    env: &ResolvedEnv,
) -> io::Result<ScriptOutput> {
    info!("{label}: running {}", invocation.describe(shell));
    debug!("{label}: environment {:?}", env);

    let mut cmd = invocation.command(shell, env);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group()
        .with_death_pact();

    let output = cmd.spawn()?.wait_with_output()?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code();
    let success = output.status.success();

    if success {
        info!("{label}: exited successfully");
    } else {
        info!("{label}: failed with exit code {}", exit_code.unwrap_or(-1));
    }

    Ok(ScriptOutput {
        stdout,
        stderr,
        exit_code,
        success,
    })
}

/// Output from a captured run.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    /// Standard output from the process.
    pub stdout: String,
    /// Standard error from the process.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the process exited successfully (exit code 0).
    pub success: bool,
}
