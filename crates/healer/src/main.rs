//! PA fleet monitor CLI
//!
//! Runs the dashboard control surface with periodic scans and self-healing,
//! or performs a single scan, heal or check from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use healer::scheduler::{RefreshAndHeal, RefreshScheduler};
use healer::server::{run_server, AppState};
use healer::{
    AlertDeduplicator, ChangeMonitor, Collaborators, FleetScanner, HealLog, HealerConfig,
    HealingOrchestrator, HealthProbe, HttpRemediationClient, ScriptFleetScanner, ScriptProbe,
    StatusStore,
};
use notify::Notifier;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Self-healing monitor for PA audio servers
#[derive(Parser)]
#[command(name = "healer")]
#[command(about = "Self-healing monitor for PA audio servers - detects failures, repairs them and alerts operators")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, env = "PA_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory holding status, alert history and heal logs
    #[arg(long, env = "PA_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the dashboard API with periodic scans and self-healing
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:3003")]
        listen: String,

        /// Minutes between automatic scans
        #[arg(long)]
        interval: Option<u64>,

        /// Scan and alert only, never heal
        #[arg(long)]
        no_heal: bool,
    },
    /// Scan once, alert on changes, heal and wait for the second attempt
    Scan,
    /// Manually heal one server
    Heal {
        /// Server address
        #[arg(long)]
        address: String,
    },
    /// Probe one server and print the verdict
    Check {
        /// Server address
        #[arg(long)]
        address: String,
    },
    /// Print the alert history, newest first
    Alerts,
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "healer=debug,notify=debug,tower_http=debug"
    } else {
        "healer=info,notify=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

struct Runtime {
    orchestrator: Arc<HealingOrchestrator>,
    scanner: Arc<dyn FleetScanner>,
}

async fn build(config: &HealerConfig) -> Result<Runtime> {
    let probe = ScriptProbe::new(&config.check_script, config.probe_timeout());
    let remediation = HttpRemediationClient::new(&config.remediation())
        .context("Failed to build repair API client")?;

    let notifier = Arc::new(Notifier::from_email_config(&config.email));
    let dedup = Arc::new(AlertDeduplicator::load(config.alert_history_path()).await);
    let monitor = ChangeMonitor::new(
        Arc::clone(&notifier),
        Arc::clone(&dedup),
        config.status_change_cooldown(),
    )
    .with_removed_alerts(config.alert_on_removed);

    let orchestrator = Arc::new(HealingOrchestrator::new(
        Collaborators {
            store: Arc::new(StatusStore::new(config.status_path())),
            probe: Arc::new(probe.clone()),
            remediation: Arc::new(remediation),
            notifier,
            dedup,
            monitor,
            heal_log: HealLog::new(config.heal_log_path()),
        },
        config.healing(),
    ));

    let scanner: Arc<dyn FleetScanner> = Arc::new(ScriptFleetScanner::new(
        probe,
        config.scan_timeout(),
        config.scan_settle(),
    ));

    Ok(Runtime {
        orchestrator,
        scanner,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let mut config = HealerConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Commands::Serve {
            listen,
            interval,
            no_heal,
        } => {
            if let Some(minutes) = interval {
                anyhow::ensure!(minutes >= 1, "--interval must be at least 1 minute");
                config.scan_interval_mins = minutes;
            }
            if no_heal {
                config.auto_heal = false;
            }

            let runtime = build(&config).await?;
            if !runtime.orchestrator.notifier().verify_channels().await {
                warn!("Alert delivery is not available, monitoring continues without email");
            }

            let scheduler = Arc::new(RefreshScheduler::new(
                Arc::new(RefreshAndHeal {
                    orchestrator: Arc::clone(&runtime.orchestrator),
                    scanner: Arc::clone(&runtime.scanner),
                }),
                config.scan_interval(),
            ));
            scheduler.start(config.initial_scan_delay());
            info!(
                interval_mins = config.scan_interval_mins,
                initial_delay_secs = config.initial_scan_delay_secs,
                auto_heal = config.auto_heal,
                "Auto-refresh started"
            );

            let state = Arc::new(AppState {
                orchestrator: runtime.orchestrator,
                scanner: runtime.scanner,
                scheduler,
            });
            run_server(state, &listen).await?;
        }
        Commands::Scan => {
            let runtime = build(&config).await?;
            let outcome = runtime
                .orchestrator
                .refresh(runtime.scanner.as_ref())
                .await
                .context("Fleet scan failed")?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);

            let report = runtime
                .orchestrator
                .run_auto_heal(&outcome.previous)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if runtime.orchestrator.has_pending_second_attempt() {
                info!("Waiting for the second healing attempt");
                runtime.orchestrator.wait_for_second_attempt().await;
            }
        }
        Commands::Heal { address } => {
            let runtime = build(&config).await?;
            let report = runtime.orchestrator.heal_manual(&address).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Check { address } => {
            let probe = ScriptProbe::new(&config.check_script, config.probe_timeout());
            let report = probe.check_single(&address).await;
            println!(
                "{address}: {} ({:?})\n{}",
                report.status(),
                report.verdict,
                report.summary
            );
        }
        Commands::Alerts => {
            let dedup = AlertDeduplicator::load(config.alert_history_path()).await;
            println!("{}", serde_json::to_string_pretty(&dedup.history().await)?);
        }
    }

    Ok(())
}
