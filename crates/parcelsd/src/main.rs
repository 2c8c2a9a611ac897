// # parcelsd - Parcel Tracking Daemon
//
// Thin integration layer: all tracking logic lives in parcels-core.
//
// The parcelsd daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Registering the tracking API and state stores
// 4. Starting the poll scheduler and logging published snapshots
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### Account
// - `PARCELS_API_KEY`: Parcels App API key (required)
// - `PARCELS_DESTINATION_COUNTRY`: Destination country (required)
// - `PARCELS_LANGUAGE`: Response language (default: en)
//
// ### Tracking API
// - `PARCELS_API_BASE_URL`: Service root (default: https://parcelsapp.com)
// - `PARCELS_HTTP_TIMEOUT_SECS`: Request timeout (default: 30)
//
// ### State Store
// - `PARCELS_STATE_STORE_TYPE`: Type of state store (file, memory)
// - `PARCELS_STATE_STORE_PATH`: Path to state file (for file store)
//
// ### Scheduling
// - `PARCELS_POLL_INTERVAL_SECS`: Poll interval (default: 900)
// - `PARCELS_TOKEN_TTL_SECS`: Correlation token lifetime (default: 1800, max: one year)
// - `PARCELS_RETENTION_DAYS`: Days to keep delivered shipments (default: 30, 0 disables,
//   max: 36500)
//
// ### Shipments
// - `PARCELS_TRACKING_IDS`: Comma-separated `id` or `id=name` entries tracked at startup
//
// ## Example
//
// ```bash
// export PARCELS_API_KEY=your_key
// export PARCELS_DESTINATION_COUNTRY="United States"
// export PARCELS_STATE_STORE_TYPE=file
// export PARCELS_STATE_STORE_PATH=/var/lib/parcels/state.json
// export PARCELS_TRACKING_IDS="1Z999AA10123456784=Laptop,LB123456789CN"
//
// parcelsd
// ```

use anyhow::{Context, Result};
use parcels_core::config::{
    ApiConfig, ParcelsConfig, SchedulerConfig, StateStoreConfig, TrackingConfig,
};
use parcels_core::{
    BackendRegistry, EntitySet, PollScheduler, Reconciler, Snapshot, SnapshotObserver,
};
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How long the scheduler gets to finish its current cycle on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum ParcelsExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<ParcelsExitCode> for ExitCode {
    fn from(code: ParcelsExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// A shipment to track at startup
#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackingEntry {
    tracking_id: String,
    display_name: Option<String>,
}

/// Application configuration
struct Config {
    api_key: String,
    destination_country: String,
    language: Option<String>,
    api_base_url: Option<String>,
    http_timeout_secs: Option<u64>,
    state_store_type: String,
    state_store_path: Option<String>,
    poll_interval_secs: Option<u64>,
    token_ttl_secs: Option<u64>,
    retention_days: Option<u64>,
    tracking_ids: Vec<TrackingEntry>,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through a variable lookup
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            api_key: lookup("PARCELS_API_KEY").unwrap_or_default(),
            destination_country: lookup("PARCELS_DESTINATION_COUNTRY").unwrap_or_default(),
            language: lookup("PARCELS_LANGUAGE"),
            api_base_url: lookup("PARCELS_API_BASE_URL"),
            http_timeout_secs: parse_var(&lookup, "PARCELS_HTTP_TIMEOUT_SECS")?,
            state_store_type: lookup("PARCELS_STATE_STORE_TYPE")
                .unwrap_or_else(|| "file".to_string()),
            state_store_path: lookup("PARCELS_STATE_STORE_PATH"),
            poll_interval_secs: parse_var(&lookup, "PARCELS_POLL_INTERVAL_SECS")?,
            token_ttl_secs: parse_var(&lookup, "PARCELS_TOKEN_TTL_SECS")?,
            retention_days: parse_var(&lookup, "PARCELS_RETENTION_DAYS")?,
            tracking_ids: parse_tracking_ids(&lookup("PARCELS_TRACKING_IDS").unwrap_or_default()),
            log_level: lookup("PARCELS_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the values the core config cannot check
    fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            anyhow::bail!(
                "PARCELS_API_KEY is required. \
                Set it via: export PARCELS_API_KEY=your_key"
            );
        }

        if self.destination_country.trim().is_empty() {
            anyhow::bail!(
                "PARCELS_DESTINATION_COUNTRY is required. \
                Set it via: export PARCELS_DESTINATION_COUNTRY=\"United States\""
            );
        }

        match self.state_store_type.as_str() {
            "file" => {
                if self.state_store_path.as_ref().is_none_or(|p| p.trim().is_empty()) {
                    anyhow::bail!(
                        "PARCELS_STATE_STORE_PATH is required when PARCELS_STATE_STORE_TYPE=file. \
                        Set it via: export PARCELS_STATE_STORE_PATH=/var/lib/parcels/state.json"
                    );
                }
            }
            "memory" => {}
            _ => anyhow::bail!(
                "PARCELS_STATE_STORE_TYPE '{}' is not supported. \
                Supported types: file, memory",
                self.state_store_type
            ),
        }

        if let Some(interval) = self.poll_interval_secs
            && !(60..=86400).contains(&interval)
        {
            anyhow::bail!(
                "PARCELS_POLL_INTERVAL_SECS must be between 60 and 86400 seconds. Got: {}",
                interval
            );
        }

        if let Some(ref url) = self.api_base_url
            && url.starts_with("http://")
        {
            eprintln!(
                "WARNING: PARCELS_API_BASE_URL uses HTTP (not HTTPS). \
                The API key is sent in cleartext."
            );
        }

        parse_log_level(&self.log_level)?;

        Ok(())
    }

    /// Build the core configuration
    fn to_parcels_config(&self) -> Result<ParcelsConfig> {
        let mut tracking =
            TrackingConfig::new(self.api_key.trim(), self.destination_country.trim());
        if let Some(ref language) = self.language {
            tracking = tracking.with_language(language.trim());
        }
        if let Some(ttl) = self.token_ttl_secs {
            tracking.token_ttl_secs = ttl;
        }
        if let Some(days) = self.retention_days {
            tracking = tracking.with_retention_days(Some(days));
        }

        let mut api = ApiConfig::default();
        if let ApiConfig::ParcelsApp {
            base_url,
            timeout_secs,
        } = &mut api
        {
            if let Some(ref url) = self.api_base_url {
                *base_url = url.trim().to_string();
            }
            if let Some(timeout) = self.http_timeout_secs {
                *timeout_secs = timeout;
            }
        }

        let state_store = match self.state_store_type.as_str() {
            "memory" => StateStoreConfig::Memory,
            _ => StateStoreConfig::File {
                path: self.state_store_path.clone().unwrap_or_default(),
            },
        };

        let mut scheduler = SchedulerConfig::default();
        if let Some(interval) = self.poll_interval_secs {
            scheduler.interval_secs = interval;
        }

        let config = ParcelsConfig {
            tracking,
            api,
            state_store,
            scheduler,
        };
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Parse an optional numeric variable, rejecting garbage instead of defaulting
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("{} must be a number. Got: {}", key, value))
        })
        .transpose()
}

/// Parse `PARCELS_TRACKING_IDS`: comma-separated `id` or `id=name` entries
fn parse_tracking_ids(raw: &str) -> Vec<TrackingEntry> {
    raw.split(',')
        .filter_map(|entry| {
            let (id, name) = match entry.split_once('=') {
                Some((id, name)) => (id.trim(), Some(name.trim())),
                None => (entry.trim(), None),
            };
            if id.is_empty() {
                return None;
            }
            Some(TrackingEntry {
                tracking_id: id.to_string(),
                display_name: name.filter(|n| !n.is_empty()).map(str::to_string),
            })
        })
        .collect()
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!(
            "PARCELS_LOG_LEVEL '{}' is not valid. \
            Valid levels: trace, debug, info, warn, error",
            level
        ),
    }
}

/// Observer that logs shipments as they appear, disappear and change
struct LoggingObserver {
    entities: Mutex<EntitySet>,
}

impl LoggingObserver {
    fn new() -> Self {
        Self {
            entities: Mutex::new(EntitySet::new()),
        }
    }
}

impl SnapshotObserver for LoggingObserver {
    fn on_snapshot(&self, snapshot: &Snapshot) {
        let diff = {
            let mut entities = self
                .entities
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entities.apply(snapshot)
        };

        for tracking_id in &diff.added {
            info!("Now tracking shipment {}", tracking_id);
        }
        for tracking_id in &diff.removed {
            info!("No longer tracking shipment {}", tracking_id);
        }

        if !snapshot.status.reachable {
            warn!("Parcels App unavailable (code: {:?})", snapshot.status.http_code);
        }

        for (tracking_id, record) in &snapshot.shipments {
            debug!(
                "{} [{}]: {} ({})",
                record.display_name.as_deref().unwrap_or(tracking_id),
                record.status,
                record.message.as_deref().unwrap_or("-"),
                record.location.as_deref().unwrap_or("-"),
            );
        }
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return ParcelsExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return ParcelsExitCode::ConfigError.into();
    }

    let parcels_config = match config.to_parcels_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration validation error: {:#}", e);
            return ParcelsExitCode::ConfigError.into();
        }
    };

    // Initialize tracing
    let log_level = parse_log_level(&config.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return ParcelsExitCode::ConfigError.into();
    }

    info!("Starting parcelsd daemon");
    info!(
        "Configuration loaded: {} startup shipment(s), {} state store",
        config.tracking_ids.len(),
        parcels_config.state_store.type_name()
    );

    // Reconciler operations are serialized on one cooperative task queue
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return ParcelsExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(parcels_config, config.tracking_ids).await {
            error!("Daemon error: {:#}", e);
            ParcelsExitCode::RuntimeError
        } else {
            ParcelsExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Run the daemon
async fn run_daemon(config: ParcelsConfig, tracking_ids: Vec<TrackingEntry>) -> Result<()> {
    let registry = BackendRegistry::with_builtin_stores();

    #[cfg(feature = "parcelsapp")]
    {
        info!("Registering Parcels App tracking API");
        parcels_api_http::register(&registry);
    }

    let state_store = registry
        .create_state_store(&config.state_store)
        .await
        .context("Failed to create state store")?;
    let api = registry
        .create_api(&config.api)
        .context("Failed to create tracking API")?;

    let (reconciler, event_rx) = Reconciler::new(api, state_store, &config)
        .await
        .context("Failed to initialize reconciler")?;
    let reconciler = Arc::new(reconciler);

    for entry in &tracking_ids {
        if reconciler.get(&entry.tracking_id).await.is_some() {
            debug!("Shipment {} already tracked", entry.tracking_id);
            continue;
        }
        let outcome = reconciler
            .track(&entry.tracking_id, entry.display_name.as_deref())
            .await;
        info!("Tracking {}: {:?}", entry.tracking_id, outcome);
    }

    let mut scheduler = PollScheduler::new(reconciler.clone(), event_rx, &config.scheduler);
    scheduler.add_observer(Box::new(LoggingObserver::new()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let scheduler_handle = tokio::spawn(scheduler.run_with_shutdown(Some(shutdown_rx)));

    info!("Daemon initialized successfully");

    let signal = wait_for_shutdown().await?;
    info!("Received shutdown signal: {}", signal);

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, scheduler_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => anyhow::bail!("Scheduler task failed: {}", e),
        Err(_) => anyhow::bail!("Shutdown timeout after {:?}", SHUTDOWN_TIMEOUT),
    }

    if reconciler.is_dirty() {
        reconciler
            .flush()
            .await
            .context("Failed to save state on shutdown")?;
    }

    info!("Shutting down daemon");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// # Returns
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("PARCELS_API_KEY", "key-123"),
            ("PARCELS_DESTINATION_COUNTRY", "Germany"),
            ("PARCELS_STATE_STORE_TYPE", "memory"),
        ]
    }

    #[test]
    fn test_parse_tracking_ids() {
        let entries = parse_tracking_ids(" ABC123 = Laptop ,XYZ789,, =orphan,DEF456=");
        assert_eq!(
            entries,
            vec![
                TrackingEntry {
                    tracking_id: "ABC123".to_string(),
                    display_name: Some("Laptop".to_string()),
                },
                TrackingEntry {
                    tracking_id: "XYZ789".to_string(),
                    display_name: None,
                },
                TrackingEntry {
                    tracking_id: "DEF456".to_string(),
                    display_name: None,
                },
            ]
        );
        assert!(parse_tracking_ids("").is_empty());
    }

    #[test]
    fn test_defaults_build_core_config() {
        let config = config_from(&required()).unwrap();
        config.validate().unwrap();

        let parcels = config.to_parcels_config().unwrap();
        assert_eq!(parcels.tracking.language, "en");
        assert_eq!(parcels.tracking.token_ttl_secs, 1800);
        assert_eq!(parcels.scheduler.interval_secs, 900);
        assert!(matches!(parcels.state_store, StateStoreConfig::Memory));
        assert_eq!(parcels.api.type_name(), "parcels_app");
    }

    #[test]
    fn test_overrides_build_core_config() {
        let mut vars = required();
        vars.extend([
            ("PARCELS_LANGUAGE", "de"),
            ("PARCELS_API_BASE_URL", "https://example.test"),
            ("PARCELS_HTTP_TIMEOUT_SECS", "5"),
            ("PARCELS_POLL_INTERVAL_SECS", "300"),
            ("PARCELS_TOKEN_TTL_SECS", "600"),
            ("PARCELS_RETENTION_DAYS", "0"),
        ]);
        let config = config_from(&vars).unwrap();
        config.validate().unwrap();

        let parcels = config.to_parcels_config().unwrap();
        assert_eq!(parcels.tracking.language, "de");
        assert_eq!(parcels.tracking.token_ttl_secs, 600);
        assert_eq!(parcels.tracking.retention(), None);
        assert_eq!(parcels.scheduler.interval_secs, 300);
        match parcels.api {
            ApiConfig::ParcelsApp {
                base_url,
                timeout_secs,
            } => {
                assert_eq!(base_url, "https://example.test");
                assert_eq!(timeout_secs, 5);
            }
            other => panic!("unexpected api config: {:?}", other),
        }
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let config = config_from(&[("PARCELS_DESTINATION_COUNTRY", "Germany")]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_store_requires_path() {
        let config = config_from(&[
            ("PARCELS_API_KEY", "key-123"),
            ("PARCELS_DESTINATION_COUNTRY", "Germany"),
        ])
        .unwrap();
        assert!(config.validate().is_err());

        let config = config_from(&[
            ("PARCELS_API_KEY", "key-123"),
            ("PARCELS_DESTINATION_COUNTRY", "Germany"),
            ("PARCELS_STATE_STORE_PATH", "/tmp/parcels/state.json"),
        ])
        .unwrap();
        config.validate().unwrap();
        assert!(matches!(
            config.to_parcels_config().unwrap().state_store,
            StateStoreConfig::File { .. }
        ));
    }

    #[test]
    fn test_interval_range() {
        let mut vars = required();
        vars.push(("PARCELS_POLL_INTERVAL_SECS", "30"));
        assert!(config_from(&vars).unwrap().validate().is_err());
    }

    #[test]
    fn test_non_numeric_rejected() {
        let mut vars = required();
        vars.push(("PARCELS_RETENTION_DAYS", "forever"));
        assert!(config_from(&vars).is_err());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let mut vars = required();
        vars.push(("PARCELS_RETENTION_DAYS", "18446744073709551615"));
        assert!(config_from(&vars).unwrap().to_parcels_config().is_err());

        let mut vars = required();
        vars.push(("PARCELS_TOKEN_TTL_SECS", "10000000000000000"));
        assert!(config_from(&vars).unwrap().to_parcels_config().is_err());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut vars = required();
        vars.push(("PARCELS_LOG_LEVEL", "verbose"));
        assert!(config_from(&vars).unwrap().validate().is_err());
    }
}
