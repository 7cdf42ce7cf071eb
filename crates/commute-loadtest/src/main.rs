//! CLI entry point for the device fleet load generator.

use anyhow::Result;
use clap::Parser;
use commute_loadtest::{
    config::{ensure_staging, parse_distribution, Config},
    NetworkTransports, Orchestrator, StaticCatalog, Update,
};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "commute-loadtest")]
#[command(about = "Simulated device fleet load generator for the CommuteLive backend")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of devices to simulate
    #[arg(short, long)]
    devices: Option<usize>,

    /// Provider distribution, e.g. "cta=30,mta=40,mbta=20,septa=10"
    #[arg(short, long)]
    providers: Option<String>,

    /// Stop after this many seconds (runs until interrupted otherwise)
    #[arg(short = 'D', long)]
    duration: Option<u64>,

    /// Backend server URL
    #[arg(long, env = "LOADTEST_SERVER_URL")]
    server_url: Option<String>,

    /// Shared load test key
    #[arg(long, env = "LOADTEST_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// MQTT broker host
    #[arg(long, env = "LOADTEST_MQTT_HOST")]
    mqtt_host: Option<String>,

    /// MQTT broker port
    #[arg(long, env = "LOADTEST_MQTT_PORT")]
    mqtt_port: Option<u16>,

    /// MQTT username
    #[arg(long, env = "LOADTEST_MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password
    #[arg(long, env = "LOADTEST_MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,

    /// Run against a server URL that does not contain "staging"
    #[arg(long)]
    force: bool,

    /// Write the final JSON report (with generated credentials) to this file
    #[arg(short, long)]
    report: Option<PathBuf>,
}

impl Cli {
    /// Loads the config file (if any) and applies flag overrides.
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(devices) = self.devices {
            config.fleet.devices = devices;
        }
        if let Some(providers) = &self.providers {
            config.fleet.distribution = parse_distribution(providers)?;
        }
        if let Some(duration) = self.duration {
            config.fleet.duration_secs = Some(duration);
        }
        if let Some(url) = &self.server_url {
            config.backend.server_url = url.clone();
        }
        if let Some(key) = &self.secret_key {
            config.backend.secret_key = Some(key.clone());
        }
        if let Some(host) = &self.mqtt_host {
            config.broker.host = host.clone();
        }
        if let Some(port) = self.mqtt_port {
            config.broker.port = port;
        }
        if let Some(username) = &self.mqtt_username {
            config.broker.username = username.clone();
        }
        if let Some(password) = &self.mqtt_password {
            config.broker.password = password.clone();
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    ensure_staging(&config.backend.server_url, cli.force)?;

    info!(
        "Starting {} devices against {} (broker {}:{})",
        config.fleet.devices, config.backend.server_url, config.broker.host, config.broker.port
    );

    let duration = config.fleet.duration();
    let transports = NetworkTransports::new(&config);
    let orchestrator = Orchestrator::new(config, &StaticCatalog::transit(), &transports)?;

    let mut updates = orchestrator.subscribe();
    let tasks = orchestrator.start()?;
    let watcher = orchestrator.watch_termination(duration);

    loop {
        match updates.recv().await {
            Ok(Update::Tick(_)) => {
                let stats = orchestrator.stats();
                info!(
                    "active {}/{} | errors {} | messages {} ({:.1}/s)",
                    stats.active(),
                    stats.total_devices(),
                    stats.errors(),
                    stats.messages_total(),
                    stats.messages_per_sec()
                );
            }
            Ok(Update::ShutdownRequested) | Ok(Update::Drained) | Err(RecvError::Closed) => break,
            Ok(Update::Device(_)) => {}
            Err(RecvError::Lagged(skipped)) => warn!("Status display lagged by {} updates", skipped),
        }
    }

    orchestrator.shutdown();
    info!("Waiting for devices to clean up...");
    tasks.join().await;
    watcher.abort();

    let report = orchestrator.report();
    report.print_summary();

    if let Some(path) = &cli.report {
        std::fs::write(path, report.to_json())?;
        info!("Report saved to: {}", path.display());
    }

    Ok(())
}
