mod bluetooth;
mod config;
mod database;
mod models;
mod session;
mod utils;

use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::sleep;

use bluetooth::BluerRadio;
use config::MonitorConfig;
use database::PostgresStore;
use models::PeripheralHandle;
use session::{SessionController, SessionEvent, SessionOutcome};

/// Log session progress as the UI would display it
async fn report_events(mut events: UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged(state) => info!("Session is now {:?}", state),
            SessionEvent::Sample(sample) => info!(
                "SpO2 {}%  pulse {} bpm  PI {:.1}",
                sample.spo2, sample.pulse, sample.perfusion_index
            ),
            SessionEvent::Completed(Some(average)) => info!(
                "Session result: SpO2 {:.1}%, pulse {:.1} bpm, PI {:.1}",
                average.spo2, average.pulse, average.perfusion_index
            ),
            SessionEvent::Completed(None) => warn!("Session ended without a valid result"),
            SessionEvent::Aborted(reason) => warn!("Session aborted: {:?}", reason),
        }
    }
}

/// Pick the oximeter to connect to from the scan results
fn choose_peripheral(
    discovered: &[PeripheralHandle],
    device_name: Option<&str>,
) -> Option<PeripheralHandle> {
    discovered
        .iter()
        .filter(|p| match device_name {
            Some(filter) => p
                .name
                .as_deref()
                .map_or(false, |name| name.contains(filter)),
            None => true,
        })
        .max_by_key(|p| p.rssi.unwrap_or(i16::MIN))
        .cloned()
}

async fn main_loop(config: MonitorConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting oximeter monitoring service");

    let store = PostgresStore::new(&config.database_url);
    store.prepare().await?;

    let (tx, rx) = unbounded_channel();
    tokio::spawn(report_events(rx));

    let radio = Arc::new(BluerRadio::new());
    let mut controller = SessionController::new(radio, store, config.session_settings(), tx);

    loop {
        // Collect everything the scan window reports
        let mut found = match controller.start_scan().await {
            Ok(found) => found,
            Err(e) => {
                error!("Scan failed: {}", e);
                sleep(config.session_interval).await;
                continue;
            }
        };
        while found.recv().await.is_some() {}

        let Some(peripheral) =
            choose_peripheral(&controller.discovered(), config.device_name.as_deref())
        else {
            warn!("No oximeter found, scanning again in {:?}", config.session_interval);
            controller.cancel().await;
            sleep(config.session_interval).await;
            continue;
        };

        if let Err(e) = controller.select(&peripheral).await {
            error!("Could not connect to {}: {}", peripheral.display_name(), e);
            sleep(config.session_interval).await;
            continue;
        }

        match controller.start_monitoring().await {
            Ok(SessionOutcome::Completed { session, persisted }) => {
                info!(
                    "Session on {} finished with {} samples (stored: {})",
                    session.peripheral.display_name(),
                    session.samples.len(),
                    persisted
                );
                info!("Pulse trace: {:?}", controller.pulse_series());
            }
            Ok(SessionOutcome::Aborted(reason)) => warn!("Session aborted: {:?}", reason),
            Err(e) => error!("Monitoring failed: {}", e),
        }

        info!(
            "Waiting {:?} until the next session",
            config.session_interval
        );
        sleep(config.session_interval).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match MonitorConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        let _ = tx.send(());
    });

    // Run main loop or wait for shutdown signal
    tokio::select! {
        result = main_loop(config) => {
            match result {
                Ok(_) => info!("Program completed successfully"),
                Err(e) => error!("Fatal error: {}", e),
            }
        }
        _ = &mut rx => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    Ok(())
}
