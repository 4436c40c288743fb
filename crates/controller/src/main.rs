mod config;
mod control;
mod db;
mod error;
mod link;
mod metrics;
mod poller;
mod scheduler;
mod state;
mod warnings;
mod weather;
mod web;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::env;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use control::{Controller, Settings};
use db::Db;
use link::serial::SerialTransport;
use link::{LinkManager, Transport};
use poller::Poller;
use state::{SharedState, SystemState};
use weather::OpenWeatherMap;
use web::AppState;

#[derive(Parser)]
#[command(name = "irrigation-controller", version)]
#[command(about = "Polls zone units over a shared radio link and schedules watering", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller loop and HTTP API
    Run {
        /// Path to the TOML config file
        #[arg(env = "CONFIG_PATH", default_value = "config.toml")]
        config: String,
    },
    /// Print a complete example config
    Example,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Example) => {
            print!("{}", toml::to_string_pretty(&config::example())?);
            Ok(())
        }
        Some(Command::Run { config }) => run(&config).await,
        None => {
            let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
            run(&path).await
        }
    }
}

async fn run(config_path: &str) -> Result<()> {
    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load(config_path)?;
    info!(
        path = config_path,
        name = %cfg.name,
        mode = ?cfg.mode,
        zones = cfg.zones.len(),
        "config loaded"
    );
    if cfg.zones.is_empty() {
        warn!("no zones configured; nothing will be polled");
    }

    // ── Metrics store ───────────────────────────────────────────────
    let db = Db::connect(&cfg.metrics.db_url).await?;
    db.migrate().await?;
    info!(db_url = %cfg.metrics.db_url, "metrics store ready");

    // ── Shared state (scheduler timers, latest readings) ────────────
    let shared = SystemState::new(&cfg.name, &cfg.zones, cfg.mode, cfg.schedule.timings()).shared();
    shared
        .write()
        .await
        .record_system(format!("controller starting ({} zones)", cfg.zones.len()));

    // ── Web server ──────────────────────────────────────────────────
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(cfg.web.port);
    let web_state = AppState {
        shared: SharedState::clone(&shared),
        default_delay: cfg.schedule.override_delay(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, port).await {
            error!("{e:#}");
        }
    });

    // ── Weather ─────────────────────────────────────────────────────
    let weather = cfg.weather.as_ref().map(OpenWeatherMap::new).transpose()?;
    if weather.is_none() {
        info!("no [weather] section; weather is not fetched");
    }

    // ── Radio link ──────────────────────────────────────────────────
    if cfg.serial.port == config::SIM_PORT {
        start_sim(&cfg, db, weather, shared).await
    } else {
        let transport = SerialTransport::open(&cfg.serial.port, cfg.serial.baud_rate)?;
        start(transport, &cfg, db, weather, shared).await;
        Ok(())
    }
}

#[cfg(feature = "sim")]
async fn start_sim(cfg: &Config, db: Db, weather: Option<OpenWeatherMap>, shared: SharedState) -> Result<()> {
    let ids: Vec<_> = cfg.zones.iter().map(|z| z.id).collect();
    let radio = link::sim::SimRadio::new(&ids, fastrand::u64(..));
    info!(zones = ids.len(), "using simulated radio");
    start(radio, cfg, db, weather, shared).await;
    Ok(())
}

#[cfg(not(feature = "sim"))]
async fn start_sim(_: &Config, _: Db, _: Option<OpenWeatherMap>, _: SharedState) -> Result<()> {
    anyhow::bail!("serial.port = \"sim\" needs the `sim` feature")
}

async fn start<T: Transport>(
    transport: T,
    cfg: &Config,
    db: Db,
    weather: Option<OpenWeatherMap>,
    shared: SharedState,
) {
    let link = LinkManager::new(transport, cfg.serial.timings());
    let controller = Controller::new(Poller::new(link), db, weather, shared, Settings::from_config(cfg));
    controller.run().await;
}
