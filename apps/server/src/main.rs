pub mod config;
pub mod listener;
pub mod relay;
pub mod web;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use heating_engine::interfaces::SystemClock;
use heating_engine::registry::DEFAULT_MAX_AGE_SECS;
use heating_engine::{
    CachedRegistry, Collaborators, ConfigStore, Debouncer, HeatingCycleEngine, JsonFileStore,
    JsonLinesEventStore,
};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::config::Settings;
use crate::listener::{main_loop, DeviceReport, ReportHandler};
use crate::relay::UdpRelayBus;
use crate::web::{create_web_server, WebState};

/// The engine is driven by the tick loop, the report listener and the web
/// handlers; the lock keeps cycles from overlapping.
pub type SharedEngine = Arc<Mutex<HeatingCycleEngine>>;

async fn run_ticks(engine: SharedEngine, interval: std::time::Duration) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticks.tick().await;
        let report = engine.lock().await.run_cycle(Utc::now()).await;
        if !report.is_clean() {
            warn!(
                "cycle finished with {} failed commands of {}",
                report.failures.len(),
                report.failures.len() + report.commands_sent
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let settings = Settings::from_env()?;
    info!("config directory {}", settings.config_dir.display());

    let store = Arc::new(JsonFileStore::new(&settings.config_dir));
    let zones = store.load_zones().await.context("loading zones")?;
    let global = store.load_global().await.context("loading global config")?;
    let registry = Arc::new(CachedRegistry::new(
        Arc::new(SystemClock),
        Duration::seconds(DEFAULT_MAX_AGE_SECS),
        global.outdoor_sensor.clone(),
    ));
    let collaborators = Collaborators {
        registry: registry.clone(),
        bus: Arc::new(UdpRelayBus::new(settings.relay_port, settings.boiler_host.clone())),
        config_store: store,
        event_store: Arc::new(JsonLinesEventStore::new(settings.events_dir())),
        weather: registry.clone(),
    };
    let engine = HeatingCycleEngine::new(zones, global, collaborators, Utc::now())
        .context("invalid configuration")?;
    let tick = engine.config().tick_interval();
    let debounce = engine.config().debounce_delay();
    let engine: SharedEngine = Arc::new(Mutex::new(engine));

    tokio::spawn(run_ticks(engine.clone(), tick));

    let web_state = WebState::new(engine.clone());
    let http_addr = settings.http_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = create_web_server(&http_addr, web_state).await {
            error!("{:#}", e);
        }
    });

    let mut handler = ReportHandler::new(registry, Arc::new(Debouncer::new(debounce)), engine);
    main_loop::<DeviceReport, _>(&settings.sensor_addr, &mut handler).await
}
