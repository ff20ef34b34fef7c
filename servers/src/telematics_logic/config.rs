use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_tripcast::EngineSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "server_telematics.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Live telematics trip-session and broadcast server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "TELEMATICS_PORT", help = "Port serving the SSE stream and health endpoint.")]
    pub port: Option<u16>,

    #[clap(long, env = "TELEMATICS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "TELEMATICS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "TELEMATICS_LOG_LEVEL", help = "Logging level or filter directive (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "TELEMATICS_REDIS_URL", help = "Redis server carrying the telemetry channel.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "TELEMATICS_TOPIC", help = "Pub/Sub channel carrying device telemetry.")]
    pub topic: Option<String>,

    #[clap(long, env = "TELEMATICS_WINDOW_SIZE", help = "Samples kept per trip for classification.")]
    pub window_size: Option<usize>,

    #[clap(long, env = "TELEMATICS_DEVICE_TIMEOUT_SECONDS", help = "Seconds of silence before the device is reported disconnected.")]
    pub device_timeout_seconds: Option<u64>,

    #[clap(long, env = "TELEMATICS_TRIP_INACTIVITY_SECONDS", help = "Seconds of silence before a trip session is evicted.")]
    pub trip_inactivity_seconds: Option<u64>,

    #[clap(long, env = "TELEMATICS_MONITOR_INTERVAL_SECONDS", help = "Connectivity check interval in seconds.")]
    pub monitor_interval_seconds: Option<u64>,

    #[clap(long, env = "TELEMATICS_REAPER_INTERVAL_SECONDS", help = "Stale trip sweep interval in seconds.")]
    pub reaper_interval_seconds: Option<u64>,

    #[clap(long, env = "TELEMATICS_TRIP_LIST_INTERVAL_SECONDS", help = "Active trip list broadcast interval in seconds.")]
    pub trip_list_interval_seconds: Option<u64>,

    #[clap(long, env = "TELEMATICS_ENRICHMENT_INTERVAL_SECONDS", help = "Minimum seconds between road lookups for one trip.")]
    pub enrichment_interval_seconds: Option<u64>,

    #[clap(long, env = "TELEMATICS_RECONNECT_DELAY_SECONDS", help = "Seconds to wait before resubscribing to the broker.")]
    pub reconnect_delay_seconds: Option<u64>,

    #[clap(long, env = "TELEMATICS_SUBSCRIBER_BUFFER", help = "Events buffered per viewer before it is disconnected.")]
    pub subscriber_buffer: Option<usize>,

    #[clap(long, env = "TELEMATICS_RESOLVER_URL", help = "Reverse geocoding endpoint used for speed limits.")]
    pub resolver_url: Option<String>,

    #[clap(long, env = "TELEMATICS_RESOLVER_USER_AGENT", help = "User agent sent to the reverse geocoding endpoint.")]
    pub resolver_user_agent: Option<String>,

    #[clap(long, env = "TELEMATICS_RESOLVER_TIMEOUT_SECONDS", help = "Per-request timeout for road lookups.")]
    pub resolver_timeout_seconds: Option<u64>,

    #[clap(long, env = "TELEMATICS_CSV_PATH", help = "CSV dataset file every processed sample is appended to.")]
    pub csv_path: Option<PathBuf>,

    #[clap(long, env = "TELEMATICS_MODEL_PATH", help = "Classifier artifact (JSON).")]
    pub model_path: Option<PathBuf>,

    #[clap(long, env = "TELEMATICS_SPEEDING_TOLERANCE_KMH", help = "km/h allowed above the limit before a speeding alert.")]
    pub speeding_tolerance_kmh: Option<f64>,
}

/// Fully resolved server settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub redis_url: String,
    pub topic: String,
    pub resolver_url: String,
    pub resolver_user_agent: String,
    pub resolver_timeout: Duration,
    pub csv_path: PathBuf,
    pub model_path: PathBuf,
    pub engine: EngineSettings,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            redis_url: other.redis_url.or(self.redis_url),
            topic: other.topic.or(self.topic),
            window_size: other.window_size.or(self.window_size),
            device_timeout_seconds: other.device_timeout_seconds.or(self.device_timeout_seconds),
            trip_inactivity_seconds: other.trip_inactivity_seconds.or(self.trip_inactivity_seconds),
            monitor_interval_seconds: other.monitor_interval_seconds.or(self.monitor_interval_seconds),
            reaper_interval_seconds: other.reaper_interval_seconds.or(self.reaper_interval_seconds),
            trip_list_interval_seconds: other.trip_list_interval_seconds.or(self.trip_list_interval_seconds),
            enrichment_interval_seconds: other.enrichment_interval_seconds.or(self.enrichment_interval_seconds),
            reconnect_delay_seconds: other.reconnect_delay_seconds.or(self.reconnect_delay_seconds),
            subscriber_buffer: other.subscriber_buffer.or(self.subscriber_buffer),
            resolver_url: other.resolver_url.or(self.resolver_url),
            resolver_user_agent: other.resolver_user_agent.or(self.resolver_user_agent),
            resolver_timeout_seconds: other.resolver_timeout_seconds.or(self.resolver_timeout_seconds),
            csv_path: other.csv_path.or(self.csv_path),
            model_path: other.model_path.or(self.model_path),
            speeding_tolerance_kmh: other.speeding_tolerance_kmh.or(self.speeding_tolerance_kmh),
        }
    }

    pub fn defaults() -> Config {
        let engine = EngineSettings::default();
        Config {
            port: Some(8080),
            config_path: None,
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            redis_url: Some("redis://127.0.0.1/".to_string()),
            topic: Some("telematics/data".to_string()),
            window_size: Some(engine.window_capacity),
            device_timeout_seconds: Some(engine.device_timeout.as_secs()),
            trip_inactivity_seconds: Some(engine.trip_inactivity_timeout.as_secs()),
            monitor_interval_seconds: Some(engine.monitor_interval.as_secs()),
            reaper_interval_seconds: Some(engine.reaper_interval.as_secs()),
            trip_list_interval_seconds: Some(engine.trip_list_interval.as_secs()),
            enrichment_interval_seconds: Some(engine.enrichment_interval.as_secs()),
            reconnect_delay_seconds: Some(engine.reconnect_delay.as_secs()),
            subscriber_buffer: Some(engine.subscriber_buffer),
            resolver_url: Some("https://nominatim.openstreetmap.org/reverse".to_string()),
            resolver_user_agent: Some(concat!("server_telematics/", env!("CARGO_PKG_VERSION")).to_string()),
            resolver_timeout_seconds: Some(10),
            csv_path: Some(PathBuf::from("telematics_dataset_live.csv")),
            model_path: Some(PathBuf::from("classifier_model.json")),
            speeding_tolerance_kmh: Some(engine.speeding_tolerance_kmh),
        }
    }

    /// Checks every value and produces the settings the server runs with.
    /// Missing values fall back to [`Config::defaults`].
    pub fn into_settings(self) -> Result<ServerSettings> {
        let c = Config::defaults().merge(self);

        let seconds = |name: &str, value: Option<u64>| -> Result<Duration> {
            match value {
                Some(0) => bail!("{name} must be greater than zero"),
                Some(secs) => Ok(Duration::from_secs(secs)),
                None => bail!("{name} is not set"),
            }
        };

        let window_capacity = c.window_size.context("windowSize is not set")?;
        if window_capacity == 0 {
            bail!("windowSize must be greater than zero");
        }
        let subscriber_buffer = c.subscriber_buffer.context("subscriberBuffer is not set")?;
        if subscriber_buffer == 0 {
            bail!("subscriberBuffer must be greater than zero");
        }
        let speeding_tolerance_kmh = c.speeding_tolerance_kmh.context("speedingToleranceKmh is not set")?;
        if !speeding_tolerance_kmh.is_finite() || speeding_tolerance_kmh < 0.0 {
            bail!("speedingToleranceKmh must be a non-negative number");
        }

        let engine = EngineSettings {
            window_capacity,
            device_timeout: seconds("deviceTimeoutSeconds", c.device_timeout_seconds)?,
            trip_inactivity_timeout: seconds("tripInactivitySeconds", c.trip_inactivity_seconds)?,
            monitor_interval: seconds("monitorIntervalSeconds", c.monitor_interval_seconds)?,
            reaper_interval: seconds("reaperIntervalSeconds", c.reaper_interval_seconds)?,
            trip_list_interval: seconds("tripListIntervalSeconds", c.trip_list_interval_seconds)?,
            enrichment_interval: seconds("enrichmentIntervalSeconds", c.enrichment_interval_seconds)?,
            reconnect_delay: seconds("reconnectDelaySeconds", c.reconnect_delay_seconds)?,
            subscriber_buffer,
            speeding_tolerance_kmh,
        };

        Ok(ServerSettings {
            port: c.port.context("port is not set")?,
            log_dir: c.log_dir.context("logDir is not set")?,
            log_level: c.log_level.context("logLevel is not set")?,
            redis_url: c.redis_url.context("redisUrl is not set")?,
            topic: c.topic.context("topic is not set")?,
            resolver_url: c.resolver_url.context("resolverUrl is not set")?,
            resolver_user_agent: c.resolver_user_agent.context("resolverUserAgent is not set")?,
            resolver_timeout: seconds("resolverTimeoutSeconds", c.resolver_timeout_seconds)?,
            csv_path: c.csv_path.context("csvPath is not set")?,
            model_path: c.model_path.context("modelPath is not set")?,
            engine,
        })
    }
}

fn read_config_file(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str::<Config>(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Layers defaults, the JSON config file (if present) and CLI/env values, in
/// that order of increasing precedence.
pub fn resolve_config(cli: Config) -> Result<Config> {
    // An explicitly named file must exist; the default one is optional.
    let file_config = match &cli.config_path {
        Some(path) => Some(read_config_file(path)?),
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_FILE);
            if default_path.exists() { Some(read_config_file(default_path)?) } else { None }
        }
    };

    let mut current_config = Config::defaults();
    if let Some(file_config) = file_config {
        current_config = current_config.merge(file_config);
    }
    Ok(current_config.merge(cli))
}

pub fn load_config() -> Result<ServerSettings> {
    resolve_config(Config::parse())?.into_settings()
}
