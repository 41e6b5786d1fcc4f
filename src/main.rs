use anyhow::{Context, Result};
use cor_bridge_lib::config::AppConfig;
use cor_bridge_lib::core::registry::DeviceFamily;
use cor_bridge_lib::{commands, logging, state::AppState};
use log::{error, info, warn};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    if logging::BridgeLogger::init(log::Level::Info).is_err() {
        // Only fall back to env_logger if the bridge logger could not be installed
        if let Err(e) = env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .try_init()
        {
            eprintln!("Failed to initialize logging: {}", e);
        }
    }

    let mut args = std::env::args().skip(1);
    let family: DeviceFamily = match args.next() {
        Some(arg) => arg.parse().map_err(anyhow::Error::msg)?,
        None => DeviceFamily::Cor,
    };
    let config_dir = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config"));

    let config = AppConfig::load(&config_dir)
        .await
        .with_context(|| format!("Failed to load config from {:?}", config_dir))?;
    let app_state = AppState::with_bluetooth(config)
        .await
        .context("Failed to initialize Bluetooth")?;
    app_state.load_known_peripherals().await;

    let family_name = family.as_str();
    let found = commands::scan_devices(&app_state, family_name)
        .await
        .map_err(anyhow::Error::msg)?;
    let Some(peripheral) = found.first() else {
        warn!("No {} peripherals found.", family);
        return Ok(());
    };
    info!("Found {} ({:?} dBm), connecting...", peripheral.display_name, peripheral.rssi);

    let session = app_state.session(family);
    let mut events = session.subscribe();
    commands::connect_to_device(&app_state, family_name, &peripheral.id)
        .await
        .map_err(anyhow::Error::msg)?;
    if let Err(e) = commands::read_all(&app_state, family_name).await {
        warn!("Initial read failed: {}", e);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down.");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => println!("{}", json),
                    Err(e) => error!("Failed to serialize event: {}", e),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} event(s)", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    if session.state() == cor_bridge_lib::core::bluetooth::ConnectionState::Connected {
        commands::disconnect(&app_state, family_name, &peripheral.id)
            .await
            .map_err(anyhow::Error::msg)?;
    }
    Ok(())
}
