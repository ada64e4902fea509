//! Convergent CLI entrypoint.
//!
//! This is the main entrypoint for the convergent command-line tool: the
//! controller commands and the in-memory agent.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use convergent::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use convergent::config::{
    find_config_file, AgentSettings, ConfigParser, ConfigValidator, RunConfig,
};
use convergent::credential::EnvCredentialResolver;
use convergent::error::{ConfigError, Result};
use convergent::job::{
    serve, Agent, AgentResources, CancellationSignal, StreamChannel, TcpConnector,
};
use convergent::reconciler::{ReconcileMode, Reconciler};
use convergent::resource::{MemoryHost, ResourceKind};
use convergent::script::ProcessScriptHost;
use convergent::state::{LocalStateStore, StateStore, STATE_DIR};

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for `test` when drift was found.
const EXIT_DRIFT: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, format: OutputFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Cancels the returned signal on Ctrl-C.
fn interrupt_signal() -> CancellationSignal {
    let signal = CancellationSignal::new();
    let trigger = signal.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted, cancelling");
                trigger.cancel();
            }
            Err(e) => debug!("Cannot listen for Ctrl-C: {e}"),
        }
    });
    signal
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let cancel = interrupt_signal();
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Agent {
            listen,
            inventory,
            start_delay_polls,
        } => cmd_agent(config_path, listen, inventory, start_delay_polls, cancel).await,
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Collect { kind } => cmd_collect(config_path, kind.as_deref(), &formatter, &cancel).await,
        Commands::Test => cmd_reconcile(config_path, ReconcileMode::Test, &formatter, &cancel).await,
        Commands::Ensure { simulate, on_agent } => {
            let mode = if on_agent {
                ReconcileMode::EnsureOnAgent { simulation: simulate }
            } else {
                ReconcileMode::Ensure { simulation: simulate }
            };
            cmd_reconcile(config_path, mode, &formatter, &cancel).await
        }
        Commands::RunScript { name, simulate } => {
            cmd_run_script(config_path, &name, simulate, &formatter, &cancel).await
        }
        Commands::Status { attention } => cmd_status(config_path, attention, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Serves jobs against an in-memory host until interrupted.
async fn cmd_agent(
    config_path: Option<&PathBuf>,
    listen: Option<String>,
    inventory: Option<PathBuf>,
    start_delay_polls: u32,
    shutdown: CancellationSignal,
) -> Result<ExitCode> {
    let settings = match config_path {
        Some(path) => load_config(path)?.1.agent,
        None => find_config_file(".")
            .and_then(|path| load_config(&path))
            .map_or_else(|_| AgentSettings::default(), |(_, config)| config.agent),
    };

    let host = MemoryHost::new();
    if let Some(path) = inventory {
        let templates = ConfigParser::new().load_inventory(&path)?;
        for template in &templates {
            host.seed(template)?;
        }
        info!("Seeded {} resource(s) from {}", templates.len(), path.display());
    }

    let resources = AgentResources::new(Arc::new(ProcessScriptHost::default()))
        .with_adapters(host.adapters(start_delay_polls))
        .with_poll_policy(settings.poll_policy());
    let agent = Arc::new(Agent::with_builtin_jobs(resources));
    debug!("Registered job kinds: {}", agent.job_kinds().join(", "));

    let address = listen.unwrap_or(settings.address);
    let listener = TcpListener::bind(&address).await?;
    serve(agent, listener, shutdown).await?;

    Ok(ExitCode::SUCCESS)
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let report = ConfigValidator::new().check(&config);
    eprintln!("{}", formatter.format_validation(&report, show_warnings));

    if !report.is_valid() {
        return Ok(ExitCode::FAILURE);
    }

    eprintln!("\nConfiguration summary:");
    eprintln!("  Agent: {}", config.agent.address);
    eprintln!("  Resources: {}", config.resources.len());
    eprintln!("  Scripts: {}", config.scripts.len());

    Ok(ExitCode::SUCCESS)
}

/// Collect actual state.
async fn cmd_collect(
    config_path: Option<&PathBuf>,
    kind: Option<&str>,
    formatter: &OutputFormatter,
    cancel: &CancellationSignal,
) -> Result<ExitCode> {
    let (config_file, config) = load_config(resolve_config_path(config_path)?)?;
    let kind = kind.map(ResourceKind::from_str).transpose()?;
    let reconciler = connect(&config, &config_file);

    let mut collected = Vec::new();
    for template in config
        .resources
        .iter()
        .filter(|t| kind.is_none_or(|k| t.kind() == k))
    {
        collected.push(reconciler.collect_any(template, cancel).await?);
    }

    eprintln!("{}", formatter.format_collected(&collected));
    Ok(ExitCode::SUCCESS)
}

/// Test or ensure every configured resource.
async fn cmd_reconcile(
    config_path: Option<&PathBuf>,
    mode: ReconcileMode,
    formatter: &OutputFormatter,
    cancel: &CancellationSignal,
) -> Result<ExitCode> {
    let (config_file, config) = load_config(resolve_config_path(config_path)?)?;
    let reconciler = connect(&config, &config_file);

    let result = reconciler.reconcile_all(&config.resources, mode, cancel).await?;
    eprintln!("{}", formatter.format_reconciliation(&result));

    let code = match mode {
        ReconcileMode::Test if result.has_drift() => ExitCode::from(EXIT_DRIFT),
        _ if !result.success() => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    };
    Ok(code)
}

/// Run a named script.
async fn cmd_run_script(
    config_path: Option<&PathBuf>,
    name: &str,
    simulate: bool,
    formatter: &OutputFormatter,
    cancel: &CancellationSignal,
) -> Result<ExitCode> {
    let (config_file, config) = load_config(resolve_config_path(config_path)?)?;
    let definition = config.script(name).ok_or_else(|| ConfigError::UnknownScript {
        name: name.to_string(),
    })?;

    let reconciler = connect(&config, &config_file);
    let result = reconciler.run_definition(definition, simulate, cancel).await?;

    eprintln!("{}", formatter.format_script(name, &result));
    Ok(ExitCode::SUCCESS)
}

/// Show recorded drift status.
async fn cmd_status(
    config_path: Option<&PathBuf>,
    attention: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config_file, config) = load_config(resolve_config_path(config_path)?)?;
    let store = state_store(&config, &config_file);

    if let Some(state) = store.load().await? {
        eprintln!("{}", formatter.format_drift_state(&state, attention));
    } else {
        eprintln!("{}", formatter.warning("No drift status recorded yet."));
    }

    Ok(ExitCode::SUCCESS)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config_file, config) = load_config(resolve_config_path(config_path)?)?;
    let store = state_store(&config, &config_file);

    match command {
        StateCommands::Lock => match store.get_lock_info().await? {
            Some(lock) => eprintln!(
                "Locked by {} since {} ({}s remaining, id {})",
                lock.holder,
                lock.acquired_at,
                lock.remaining_secs(),
                lock.lock_id
            ),
            None => eprintln!("{}", formatter.success("State is not locked.")),
        },
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = store.get_lock_info().await? {
                    store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("{}", formatter.success("State forcefully unlocked."));
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("{}", formatter.success("State unlocked."));
            } else {
                eprintln!("{}", formatter.warning("Please provide --lock-id or use --force"));
            }
        }
        StateCommands::Clear => {
            store.delete().await?;
            eprintln!("{}", formatter.success("Drift status cleared."));
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads `.env`, the configuration and its environment overrides, then
/// validates.
fn load_config(config_file: impl AsRef<Path>) -> Result<(PathBuf, RunConfig)> {
    let config_file = config_file.as_ref().to_path_buf();
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    for warning in ConfigValidator::new().validate(&config)? {
        warn!("{warning}");
    }

    Ok((config_file, config))
}

/// Creates the drift store named by the configuration.
fn state_store(config: &RunConfig, config_file: &Path) -> LocalStateStore {
    config.state.path.as_ref().map_or_else(
        || LocalStateStore::with_base_dir(config_dir(config_file).join(STATE_DIR)),
        LocalStateStore::with_state_path,
    )
}

/// Creates a reconciler talking to the configured agent over TCP.
fn connect(config: &RunConfig, config_file: &Path) -> Reconciler<StreamChannel<TcpConnector>> {
    let connector = TcpConnector::new(config.agent.address.clone(), config.agent.connect_timeout());
    let channel = StreamChannel::new(connector).with_cancel_grace(config.agent.cancel_grace());

    let reconciler =
        Reconciler::new(channel).with_credentials(Arc::new(EnvCredentialResolver::new()));
    if config.state.enabled {
        reconciler.with_state_store(Arc::new(state_store(config, config_file)))
    } else {
        reconciler
    }
}
