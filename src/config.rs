use std::env;
use std::str::FromStr;

use log::info;
use tokio::time::Duration;

use crate::session::aggregator::DEFAULT_MIN_SAMPLES;
use crate::session::controller::{DEFAULT_SCAN_DURATION_MS, DEFAULT_SESSION_DURATION_SECS};
use crate::session::SessionSettings;

const DEFAULT_SESSION_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub database_url: String,
    pub user_email: String,
    /// Only connect to oximeters whose name contains this text
    pub device_name: Option<String>,
    pub scan_duration: Duration,
    pub session_duration: Duration,
    pub min_samples: usize,
    pub session_interval: Duration,
}

/// Read an optional numeric variable, falling back to `default` when unset
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, Box<dyn std::error::Error>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| format!("{} must be a number, got '{}'", key, value).into()),
        Err(_) => Ok(default),
    }
}

impl MonitorConfig {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        // Load environment variables
        dotenv::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL environment variable not set")?;
        let user_email =
            env::var("USER_EMAIL").map_err(|_| "USER_EMAIL environment variable not set")?;

        let device_name = env::var("OXIMETER_NAME")
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        let config = MonitorConfig {
            database_url,
            user_email,
            device_name,
            scan_duration: Duration::from_millis(env_or(
                "SCAN_DURATION_MS",
                DEFAULT_SCAN_DURATION_MS,
            )?),
            session_duration: Duration::from_secs(env_or(
                "SESSION_DURATION_SECS",
                DEFAULT_SESSION_DURATION_SECS,
            )?),
            min_samples: env_or("MIN_SAMPLES", DEFAULT_MIN_SAMPLES)?,
            session_interval: Duration::from_secs(env_or(
                "SESSION_INTERVAL_SECS",
                DEFAULT_SESSION_INTERVAL_SECS,
            )?),
        };

        if config.session_duration.is_zero() {
            return Err("SESSION_DURATION_SECS must be greater than zero".into());
        }

        info!(
            "Monitoring for {:?} per session, {} samples minimum, device filter: {}",
            config.session_duration,
            config.min_samples,
            config.device_name.as_deref().unwrap_or("none")
        );

        Ok(config)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            scan_duration: self.scan_duration,
            session_duration: self.session_duration,
            min_samples: self.min_samples,
            user_email: self.user_email.clone(),
            ..SessionSettings::default()
        }
    }
}
