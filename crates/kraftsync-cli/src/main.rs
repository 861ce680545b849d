//! Command-line interface for the kraftsync energy bridge.

mod credentials;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use kraftsync_cloud::{AuthedCloud, CloudClient, DynCloud, TokenManager};
use kraftsync_core::config::log_json_requested;
use kraftsync_core::{BridgeConfig, Credential, DynHost, DynSource, SourceKind};
use kraftsync_devices::{Classifier, EntitySource, HassConnectionConfig, HassHost};
use kraftsync_sim::{shared_engine, SimulatedHost, SimulatedSource, SimulationEngine};
use kraftsync_sync::Bridge;

use crate::credentials::FileCredentialStore;

/// Kraftsync - bridge local energy devices to the cloud.
#[derive(Parser, Debug)]
#[command(name = "kraftsync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML).
    #[arg(short, long, global = true, env = "KRAFTSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge until interrupted.
    Run {
        /// Use the simulated devices instead of the host platform.
        #[arg(long)]
        simulate: bool,
        /// JSON file that keeps refreshed cloud credentials.
        #[arg(long, env = "KRAFTSYNC_CREDENTIALS")]
        credentials: Option<PathBuf>,
    },
    /// Print how the host's devices are classified.
    Discover {
        /// Classify the simulated devices instead.
        #[arg(long)]
        simulate: bool,
    },
    /// Print simulated samples as JSON lines.
    Simulate {
        /// Number of steps.
        #[arg(long, default_value_t = 10)]
        steps: usize,
        /// Simulated seconds per step.
        #[arg(long, default_value_t = 30)]
        step_secs: u64,
        /// Random seed, overriding the configuration.
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run {
            simulate,
            credentials,
        } => run(args.config.as_deref(), simulate, credentials).await,
        Command::Discover { simulate } => discover(args.config.as_deref(), simulate).await,
        Command::Simulate {
            steps,
            step_secs,
            seed,
        } => simulate(args.config.as_deref(), steps, step_secs, seed),
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "kraftsync=debug" } else { "kraftsync=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    // stdout is reserved for command output
    if log_json_requested() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

/// File (if any) plus environment; `simulate` forces the simulated source.
fn load_config(path: Option<&Path>, simulate: bool) -> Result<BridgeConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            BridgeConfig::from_toml_str(&text)?
        }
        None => BridgeConfig::default(),
    };
    config.apply_env();
    if simulate {
        config.source = SourceKind::Simulation;
    }
    Ok(config)
}

fn build_host(config: &BridgeConfig) -> Result<(DynHost, DynSource)> {
    match config.source {
        SourceKind::Simulation => {
            let engine = shared_engine(&config.simulation);
            let host: DynHost = Arc::new(SimulatedHost::new(engine.clone()));
            let source: DynSource = Arc::new(SimulatedSource::new(engine));
            Ok((host, source))
        }
        SourceKind::Host => {
            if config.host.token.trim().is_empty() {
                bail!("host.token is required to talk to the host platform");
            }
            let hass = HassHost::new(HassConnectionConfig::from_section(&config.host))?;
            let host: DynHost = Arc::new(hass);
            let source: DynSource = Arc::new(EntitySource::new(host.clone()));
            Ok((host, source))
        }
    }
}

async fn token_manager(
    config: &BridgeConfig,
    client: Arc<CloudClient>,
    credentials: Option<PathBuf>,
) -> Result<Arc<TokenManager>> {
    let mut tokens = TokenManager::new(&config.cloud.site_id, client, config.refresh_margin());
    if let Some(path) = credentials {
        tokens = tokens.with_store(Arc::new(FileCredentialStore::new(path)));
    }
    if tokens.load_from_store().await? {
        debug!("Using stored cloud credential");
        return Ok(Arc::new(tokens));
    }

    let Some(access_token) = config.cloud.access_token.clone() else {
        bail!("no cloud credential: set cloud.access_token or KRAFTSYNC_ACCESS_TOKEN");
    };
    // expiry of a configured token is unknown; a rejection triggers the refresh
    tokens
        .install(Credential {
            access_token,
            refresh_token: config.cloud.refresh_token.clone().unwrap_or_default(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
        .await?;
    Ok(Arc::new(tokens))
}

async fn run(path: Option<&Path>, simulate: bool, credentials: Option<PathBuf>) -> Result<()> {
    let config = load_config(path, simulate)?;
    config.validate()?;

    let (host, source) = build_host(&config)?;
    let client = Arc::new(CloudClient::from_config(&config)?);
    let tokens = token_manager(&config, client.clone(), credentials).await?;
    let cloud: DynCloud = Arc::new(AuthedCloud::new(client, tokens.clone(), config.retry.clone()));

    let grace = config.intervals.shutdown_grace();
    let bridge = Arc::new(Bridge::new(config, host, source, cloud, Some(tokens))?);
    bridge.start().await;

    wait_for_signals(&bridge).await?;

    info!("Shutting down");
    bridge.shutdown(grace).await;
    debug!(diagnostics = %bridge.diagnostics().await.to_json(), "Final state");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signals(bridge: &Arc<Bridge>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = hangup.recv() => {
                if let Err(e) = bridge.force_resync().await {
                    warn!(error = %e, "Resync failed");
                }
            }
            _ = user1.recv() => {
                match bridge.push_now().await {
                    Ok(report) => info!(pushed = report.pushed, failed = report.failed.len(), "Telemetry pushed"),
                    Err(e) => warn!(error = %e, "Telemetry push failed"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_bridge: &Arc<Bridge>) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn discover(path: Option<&Path>, simulate: bool) -> Result<()> {
    let config = load_config(path, simulate)?;
    let (host, _) = build_host(&config)?;
    let timeout = Duration::from_secs(config.host.timeout_secs.max(1));
    let devices = tokio::time::timeout(timeout, host.discover())
        .await
        .context("host discovery timed out")??;

    let classifier = Classifier::new();
    for device in &devices {
        let classification = classifier.classify(device);
        let (controls, sensors): (Vec<_>, Vec<_>) = device
            .child_entities()
            .into_iter()
            .partition(|c| c.kind.is_control());
        let ids = |entities: Vec<kraftsync_core::ChildEntity>| -> Vec<String> {
            entities.into_iter().map(|c| c.entity_id).collect()
        };
        let line = serde_json::json!({
            "local_id": device.local_id,
            "name": device.name,
            "role": classification.role,
            "tier": classification.tier.map(|t| t.number()),
            "confidence": classification.tier.map(|t| t.confidence()),
            "matched": classification.matched,
            "controls": ids(controls),
            "sensors": ids(sensors),
        });
        println!("{}", line);
    }
    info!(devices = devices.len(), host = host.name(), "Discovery finished");
    Ok(())
}

fn simulate(path: Option<&Path>, steps: usize, step_secs: u64, seed: Option<u64>) -> Result<()> {
    let config = load_config(path, true)?;
    let mut settings = config.simulation;
    if let Some(seed) = seed {
        settings.seed = seed;
    }
    if step_secs == 0 {
        bail!("--step-secs must be greater than zero");
    }

    let engine = SimulationEngine::new(&settings, Utc::now());
    for frame in engine.frames(Duration::from_secs(step_secs)).take(steps) {
        for sample in frame.samples() {
            println!("{}", serde_json::to_string(sample)?);
        }
    }
    Ok(())
}
