//! fwsync - firewall rule synchronization agent
//!
//! # Usage
//!
//! ```bash
//! # Run the agent (default)
//! fwsync --config /etc/fwsync/config.yaml
//!
//! # One-shot and inspection commands
//! fwsync once          # Run a single reconciliation cycle
//! fwsync plan          # Show what the next cycle would change
//! fwsync status        # List the rules fwsync owns in ufw
//! fwsync check-config  # Validate the configuration and ufw installation
//! ```
//!
//! SIGINT/SIGTERM stop the agent after the in-flight cycle; SIGHUP requests
//! an immediate resync.

use clap::{Parser, Subcommand};
use fwsync::audit::AuditLog;
use fwsync::client::ControlPlaneClient;
use fwsync::config::{Config, DEFAULT_CONFIG_PATH, LEGACY_ENV_PATH};
use fwsync::core::reconcile::{Reconciler, run_reconciliation_loop};
use fwsync::core::snapshot::load_snapshot;
use fwsync::core::ufw::{PacketFilter, UfwFilter};
use fwsync::core::verify::verify_ufw;
use fwsync::elevation::ElevationMethod;
use fwsync::health::{HealthCollector, run_health_loop};
use fwsync::{logging, shutdown};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

shadow_rs::shadow!(build);

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "fwsync")]
#[command(about = "Keeps the ufw allow-list in sync with a remotely declared firewall policy", long_about = None)]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Run the reconciliation and health loops until stopped (default)
    Run,
    /// Run a single reconciliation cycle and print its report
    Once,
    /// Fetch and diff without applying; print the pending changes
    Plan,
    /// Print the allow rules currently held by ufw
    Status,
    /// Validate the configuration and the ufw installation, then exit
    CheckConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config, Path::new(LEGACY_ENV_PATH)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_logging(config.logging.level, config.logging.format) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.unwrap_or(Commands::Run);
    match runtime.block_on(handle_command(command, &cli.config, config)) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fwsync failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn handle_command(command: Commands, config_path: &Path, config: Config) -> CliResult<ExitCode> {
    match command {
        Commands::Run => run_agent(config_path, config).await,
        Commands::Once => run_once(config).await,
        Commands::Plan => show_plan(config).await,
        Commands::Status => show_status(config).await,
        Commands::CheckConfig => check_config(config).await,
    }
}

fn build_filter(config: &Config) -> CliResult<Arc<UfwFilter>> {
    let elevation = ElevationMethod::resolve(config.firewall.elevation)?;
    Ok(Arc::new(UfwFilter::new(config.firewall.ufw_binary.clone(), elevation)))
}

fn build_reconciler(config: &Config, client: Arc<ControlPlaneClient>, filter: Arc<UfwFilter>) -> Reconciler {
    let audit = config
        .audit
        .enabled
        .then(|| AuditLog::new(config.audit.path.clone()));
    Reconciler::new(client, filter, config.firewall.folding())
        .with_snapshot(config.firewall.output_file.clone())
        .with_audit(audit)
        .with_enforcement(config.firewall.enabled)
}

async fn ensure_ufw(filter: &UfwFilter) -> CliResult<()> {
    let result = verify_ufw(filter).await;
    for warning in &result.warnings {
        warn!("{warning}");
    }
    if !result.success {
        return Err(format!("ufw verification failed:\n{}", result.errors.join("\n")).into());
    }
    Ok(())
}

async fn run_agent(config_path: &Path, config: Config) -> CliResult<ExitCode> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = build::SHORT_COMMIT,
        config = %config_path.display(),
        "fwsync starting"
    );

    let resync = Arc::new(Notify::new());
    let cancel = shutdown::install_signal_handlers(Arc::clone(&resync))?;

    let client = Arc::new(ControlPlaneClient::new(&config.api)?);
    if let Err(e) = client.health_check().await {
        warn!(
            endpoint = client.endpoint(),
            error = %e,
            "initial control plane check failed; cycles will keep retrying"
        );
    }

    let filter = build_filter(&config)?;
    if config.firewall.enabled {
        ensure_ufw(&filter).await?;
    } else {
        warn!("firewall management disabled; rules are fetched but never applied");
    }

    let health = config.health.enabled.then(|| {
        tokio::spawn(run_health_loop(
            HealthCollector::new(config.api.project_id.clone()),
            Arc::clone(&client),
            config.health.interval.get(),
            cancel.clone(),
        ))
    });

    let reconciler = Arc::new(build_reconciler(&config, client, filter));
    let stats = run_reconciliation_loop(reconciler, config.agent.interval.get(), resync, cancel).await;

    if let Some(handle) = health
        && let Err(e) = handle.await
    {
        error!(error = %e, "health task panicked");
    }

    info!(
        cycles = stats.cycles_started,
        dropped = stats.triggers_dropped,
        "fwsync stopped"
    );
    Ok(ExitCode::SUCCESS)
}

async fn run_once(config: Config) -> CliResult<ExitCode> {
    let cancel = shutdown::install_signal_handlers(Arc::new(Notify::new()))?;
    let client = Arc::new(ControlPlaneClient::new(&config.api)?);
    let filter = build_filter(&config)?;
    if config.firewall.enabled {
        ensure_ufw(&filter).await?;
    }

    let report = build_reconciler(&config, client, filter)
        .run_cycle(&cancel)
        .await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn show_plan(config: Config) -> CliResult<ExitCode> {
    let cancel = shutdown::install_signal_handlers(Arc::new(Notify::new()))?;
    let client = Arc::new(ControlPlaneClient::new(&config.api)?);
    let filter = build_filter(&config)?;

    let prepared = build_reconciler(&config, client, filter)
        .with_snapshot(None)
        .prepare(&cancel)
        .await?;

    println!(
        "Desired: {} rule(s), current: {} owned rule(s)",
        prepared.desired.len(),
        prepared.current.len()
    );
    if prepared.plan.is_empty() {
        println!("Firewall is in sync; nothing to do.");
        return Ok(ExitCode::SUCCESS);
    }
    for rule in &prepared.plan.to_add {
        println!("  + {rule}");
    }
    for rule in &prepared.plan.to_remove {
        println!("  - {rule}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn show_status(config: Config) -> CliResult<ExitCode> {
    let filter = build_filter(&config)?;
    let rules = filter.list_rules(config.firewall.folding()).await?;

    println!("Owned allow rules: {}", rules.len());
    for rule in rules.rules() {
        println!("  {rule}");
    }

    if let Some(path) = &config.firewall.output_file {
        match load_snapshot(path) {
            Ok(snapshot) => println!(
                "Last fetched: {} (checksum {})",
                snapshot.fetched_at.to_rfc3339(),
                &snapshot.checksum[..12.min(snapshot.checksum.len())]
            ),
            Err(e) => println!("Last fetched: unavailable ({e})"),
        }
    }

    if config.audit.enabled {
        let audit = AuditLog::new(config.audit.path.clone());
        let recent = audit.read_recent(5).await.unwrap_or_default();
        if !recent.is_empty() {
            println!("Recent activity:");
            for event in recent {
                println!(
                    "  {} {} {}",
                    event.timestamp.to_rfc3339(),
                    event.event_type,
                    if event.success { "ok" } else { "FAILED" }
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn check_config(config: Config) -> CliResult<ExitCode> {
    print!("{}", config.to_yaml()?);

    if config.firewall.enabled {
        let filter = build_filter(&config)?;
        ensure_ufw(&filter).await?;
    }
    println!("Configuration OK");
    Ok(ExitCode::SUCCESS)
}
