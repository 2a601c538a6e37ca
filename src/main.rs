//! archtarget - command line entry point
//!
//! Thin operator front end over the library: loads the configuration and
//! target definitions, then runs one subcommand against the selected target.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use archtarget::cli::{Cli, Commands};
use archtarget::config_file::ArchiveConfig;
use archtarget::disk_space::DiskSpaceProber;
use archtarget::env_schema::{EnvDefault, EnvOverrides};
use archtarget::process_guard;
use archtarget::process_matcher::{self, TargetProcesses};
use archtarget::script_runner::Invocation;
use archtarget::target::{
    ProbeBackend, RenderedProbe, TargetDefinition, TargetRegistry, TransferBackend,
};
use archtarget::transfer::{TracingSink, TransferInvoker, TransferRequest};

/// How long a cancelled transfer gets between SIGTERM and SIGKILL
const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Initialize tracing; `-v`/`-q` win over `RUST_LOG`, which wins over `info`
fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Some("warn"),
        (false, 0) => None,
        (false, 1) => Some("debug"),
        (false, _) => Some("trace"),
    };
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Configuration, definitions and overrides for one invocation
struct Session {
    config: ArchiveConfig,
    registry: TargetRegistry,
    cli_target: Option<String>,
    cli_overrides: EnvOverrides,
}

impl Session {
    fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => ArchiveConfig::load_from_file(path)?,
            None => ArchiveConfig::default(),
        };
        if let Some(definitions) = &cli.definitions {
            config.target_definitions = Some(definitions.clone());
        }

        let registry = config.registry()?;
        debug!(targets = registry.len(), "target definitions loaded");

        let cli_overrides = EnvOverrides::parse_pairs(&cli.env).context("Invalid --env override")?;

        Ok(Self {
            config,
            registry,
            cli_target: cli.target.clone(),
            cli_overrides,
        })
    }

    /// `--target`, else `archiving.target`
    fn target_id(&self) -> Option<&str> {
        self.cli_target
            .as_deref()
            .or_else(|| self.config.archiving.as_ref().map(|a| a.target.as_str()))
    }

    fn target(&self) -> Result<&TargetDefinition> {
        let id = self
            .target_id()
            .context("No target selected: pass --target or set archiving.target in --config")?;
        Ok(self.registry.get(id)?)
    }

    /// Config env for the configured target, then `--env` for the selected one
    fn overrides_for(&self, id: &str) -> EnvOverrides {
        let mut overrides = match &self.config.archiving {
            Some(archiving) if archiving.target == id => archiving.env.clone(),
            _ => EnvOverrides::new(),
        };
        if self.target_id() == Some(id) {
            overrides = overrides.merged_with(&self.cli_overrides);
        }
        overrides
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose, cli.quiet);
    debug!("CLI arguments parsed");

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("✗ {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let session = Session::load(cli)?;

    match &cli.command {
        Commands::Targets => list_targets(&session),
        Commands::Show { id } => show_target(session.registry.get(id)?),
        Commands::Validate => validate(&session),
        Commands::Render {
            source,
            destination,
        } => render(&session, source, destination),
        Commands::Probe { json } => probe(&session, *json),
        Commands::Transfer {
            source,
            destination,
            log,
        } => transfer(&session, cli.dry_run, source, destination, log.as_deref()),
        Commands::Processes { json } => processes(&session, *json),
    }
}

fn list_targets(session: &Session) -> Result<()> {
    for target in session.registry.iter() {
        let required = target.env().required_names();
        if required.is_empty() {
            println!("{}", target.id());
        } else {
            println!("{}  (requires: {})", target.id(), required.join(", "));
        }
    }
    Ok(())
}

fn show_target(target: &TargetDefinition) -> Result<()> {
    println!("target: {}", target.id());

    println!("env:");
    for (name, default) in target.env().iter() {
        match default {
            EnvDefault::Required => println!("  {name}: (required)"),
            EnvDefault::Default(value) => println!("  {name}: {value:?}"),
        }
    }

    match target.disk_space() {
        ProbeBackend::Script(script) => {
            println!("disk_space_script: |");
            print_indented(script.source());
        }
        ProbeBackend::Executable(spec) => println!("disk_space_executable: {}", spec.source_line()),
        ProbeBackend::Statvfs(paths) => {
            println!("disk_space_statvfs:");
            for path in paths {
                println!("  - {}", path.source());
            }
        }
    }

    match target.transfer() {
        TransferBackend::Script(script) => {
            println!("transfer_script: |");
            print_indented(script.source());
        }
        TransferBackend::Executable(spec) => {
            println!("transfer_executable: {}", spec.source_line())
        }
    }

    println!("transfer_process_name: {}", target.transfer_process_name().source());
    println!(
        "transfer_process_argument_prefix: {}",
        target.transfer_process_argument_prefix().source()
    );
    Ok(())
}

fn print_indented(text: &str) {
    for line in text.lines() {
        println!("  {line}");
    }
}

fn print_invocation(label: &str, invocation: &Invocation) {
    match invocation {
        Invocation::Shell { body } => {
            println!("{label}: |");
            print_indented(body);
        }
        Invocation::Executable { program, args } => {
            println!("{label}: {program} {}", args.join(" "));
        }
    }
}

fn validate(session: &Session) -> Result<()> {
    let configured = session.config.archiving.as_ref().map(|a| a.target.as_str());
    // --env only applies to the configured target when it is the selected one
    if session.target_id() == configured {
        session
            .config
            .validate_with(&session.registry, &session.cli_overrides)?;
    } else {
        session.config.validate(&session.registry)?;
    }
    println!("✓ {} target definitions loaded", session.registry.len());

    if session.target_id().is_some() {
        let target = session.target()?;
        let env = target.resolve_env(&session.overrides_for(target.id()))?;
        target.render_disk_space(&env)?;
        TransferInvoker::new().prepare_with_env(
            target,
            &env,
            Path::new("/validate/source"),
            Path::new("/validate/destination"),
        )?;
        target.process_identity(&env)?;
        println!("✓ Target '{}' resolves and renders", target.id());
    }
    Ok(())
}

fn render(session: &Session, source: &Path, destination: &Path) -> Result<()> {
    let target = session.target()?;
    let env = target.resolve_env(&session.overrides_for(target.id()))?;

    match target.render_disk_space(&env)? {
        RenderedProbe::Command(invocation) => print_invocation("disk_space", &invocation),
        RenderedProbe::Statvfs(paths) => {
            println!("disk_space (statvfs):");
            for path in paths {
                println!("  - {}", path.display());
            }
        }
    }

    let prepared = TransferInvoker::new().prepare_with_env(target, &env, source, destination)?;
    print_invocation("transfer", &prepared.invocation);

    let identity = target.process_identity(&env)?;
    println!("transfer_process_name: {}", identity.name);
    println!("transfer_process_argument_prefix: {}", identity.argument_prefix);
    Ok(())
}

fn probe(session: &Session, json: bool) -> Result<()> {
    let target = session.target()?;
    let prober = DiskSpaceProber::new().with_shell(session.config.shell());
    let report = prober.probe(target, &session.overrides_for(target.id()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
        return Ok(());
    }

    for entry in report.entries() {
        println!("{}\t{}", entry.path, entry.bytes_free);
    }
    for warning in report.warnings() {
        eprintln!(
            "warning: line {}: {} ({:?})",
            warning.line_number, warning.reason, warning.line
        );
    }
    Ok(())
}

fn transfer(
    session: &Session,
    dry_run: bool,
    source: &Path,
    destination: &Path,
    log: Option<&Path>,
) -> Result<()> {
    let target = session.target()?;
    let overrides = session.overrides_for(target.id());
    let invoker = TransferInvoker::new()
        .with_shell(session.config.shell())
        .dry_run(dry_run);
    let mut sink = TracingSink::new(target.id());

    if invoker.is_dry_run() {
        let request = TransferRequest::new(target.id(), source, destination);
        invoker.invoke(target, &overrides, &request, &mut sink)?;
        return Ok(());
    }

    let prepared = invoker.prepare(target, &overrides, source, destination)?;
    let running = match log {
        Some(log) => invoker.spawn_to_log(&prepared, log)?,
        None => invoker.spawn(&prepared)?,
    };
    process_guard::cancel_group_on_signals(running.process_group(), CANCEL_GRACE_PERIOD)
        .context("Failed to install signal handlers")?;

    let outcome = running.wait(&mut sink)?;
    info!(target_id = %outcome.target_id, "transfer finished");
    println!("✓ Transferred {} to {}", source.display(), destination.display());
    Ok(())
}

fn processes(session: &Session, json: bool) -> Result<()> {
    let overrides: BTreeMap<String, EnvOverrides> = session
        .registry
        .ids()
        .map(|id| (id.to_string(), session.overrides_for(id)))
        .collect();
    let snapshot = process_matcher::snapshot();
    let found: Vec<TargetProcesses> =
        process_matcher::reconcile(&session.registry, &overrides, &snapshot);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&found).context("Failed to serialize matches")?
        );
        return Ok(());
    }

    for target in &found {
        println!(
            "{}: {} process(es) named {:?} with an argument starting {:?}",
            target.target_id,
            target.processes.len(),
            target.identity.name,
            target.identity.argument_prefix
        );
        for process in &target.processes {
            println!("  {}\t{}", process.pid, process.args.join(" "));
        }
    }
    Ok(())
}
