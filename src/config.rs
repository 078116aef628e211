// Configuration module - runtime settings and the metric catalog
//
// This module is responsible for:
// 1. Reading runtime settings from environment variables
// 2. Validating schedule and timing values before the loop starts
// 3. Loading the ordered metric catalog from its JSON file
//
// Everything here is read once at startup. A failure in this module is fatal.

use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::metrics::{EntityScope, MetricDefinition};

/// Errors that can occur while loading settings or the catalog
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    MissingRequiredSetting(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid catalog format in {path}: {source}")]
    CatalogFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid catalog entry #{index}: {reason}")]
    InvalidCatalogEntry { index: usize, reason: String },
}

/// Query window passed verbatim to the metrics API
///
/// The strings are relative expressions (`-24h`, `now`) resolved by the API
/// when each request arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: String,
    pub to: String,
}

impl Default for TimeWindow {
    fn default() -> Self {
        TimeWindow {
            from: "-24h".to_string(),
            to: "now".to_string(),
        }
    }
}

/// Runtime settings sourced from the environment
///
/// # Environment
/// | Variable | Default |
/// |---|---|
/// | `SHEET_KEY` | required |
/// | `WORKSHEET_NAME` | required |
/// | `SHEET_NAME` | none |
/// | `METRICS_API_URL` | required |
/// | `METRICS_API_TOKEN` | required |
/// | `EXECUTION_HOUR` | `23` |
/// | `EXECUTION_MINUTE` | `0` |
/// | `METRICS_FROM` / `METRICS_TO` | `-24h` / `now` |
/// | `GOOGLE_SERVICE_FILE` | `config/service-account.json` |
/// | `METRICS_CATALOG` | `config/metrics.json` |
/// | `LOG_FILE_PATH` | `logs/watchdog.log` |
/// | `POLL_INTERVAL_SECS` | `10` |
/// | `HTTP_TIMEOUT_SECS` | `30` |
#[derive(Debug, Clone)]
pub struct AppSettings {
    /// Spreadsheet id (the long key in the sheet URL)
    pub sheet_key: String,

    /// Human readable spreadsheet name, used for logging only
    pub sheet_name: Option<String>,

    /// Title of the worksheet tab that holds the metric grid
    pub worksheet_name: String,

    /// Metrics query endpoint
    pub api_url: String,

    /// Token sent in the `Authorization` header
    pub api_token: String,

    pub execution_hour: u32,
    pub execution_minute: u32,

    pub window: TimeWindow,

    /// Service account key file for the spreadsheet API
    pub service_file: PathBuf,

    /// Metric catalog file
    pub catalog_path: PathBuf,

    /// Append-only log file
    pub log_file: PathBuf,

    /// How often the schedule gate is re-evaluated
    pub poll_interval: Duration,

    /// Timeout applied to every outbound HTTP request
    pub http_timeout: Duration,
}

impl AppSettings {
    /// Reads settings from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds settings from an arbitrary variable lookup
    ///
    /// Empty values are treated as unset so that `FOO=` in a unit file does
    /// not silently produce an empty sheet key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::MissingRequiredSetting(name));

        let execution_hour = parse_bounded(get("EXECUTION_HOUR"), "EXECUTION_HOUR", 23, 23)?;
        let execution_minute = parse_bounded(get("EXECUTION_MINUTE"), "EXECUTION_MINUTE", 0, 59)?;

        // Anything above a minute could step over the trigger minute entirely.
        let poll_secs = parse_bounded(get("POLL_INTERVAL_SECS"), "POLL_INTERVAL_SECS", 10, 59)?;
        if poll_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "POLL_INTERVAL_SECS",
                reason: "must be at least 1 second".to_string(),
            });
        }

        let timeout_secs = parse_bounded(get("HTTP_TIMEOUT_SECS"), "HTTP_TIMEOUT_SECS", 30, 600)?;

        let defaults = TimeWindow::default();
        let window = TimeWindow {
            from: get("METRICS_FROM").unwrap_or(defaults.from),
            to: get("METRICS_TO").unwrap_or(defaults.to),
        };

        Ok(AppSettings {
            sheet_key: required("SHEET_KEY")?,
            sheet_name: get("SHEET_NAME"),
            worksheet_name: required("WORKSHEET_NAME")?,
            api_url: required("METRICS_API_URL")?,
            api_token: required("METRICS_API_TOKEN")?,
            execution_hour,
            execution_minute,
            window,
            service_file: get("GOOGLE_SERVICE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/service-account.json")),
            catalog_path: get("METRICS_CATALOG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/metrics.json")),
            log_file: get("LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs/watchdog.log")),
            poll_interval: Duration::from_secs(u64::from(poll_secs)),
            http_timeout: Duration::from_secs(u64::from(timeout_secs)),
        })
    }
}

/// Parses an optional integer setting, applying a default and an upper bound
///
/// # Arguments
/// * `raw` - the variable's value, `None` when unset
/// * `name` - variable name, reported in errors
/// * `default` - used when `raw` is `None`
/// * `max` - largest accepted value, inclusive
fn parse_bounded(
    raw: Option<String>,
    name: &'static str,
    default: u32,
    max: u32,
) -> Result<u32, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };

    // Negative numbers fail here, so the lower bound is implicit
    let value: u32 = raw.trim().parse().map_err(|_| ConfigError::InvalidSetting {
        name,
        reason: format!("'{}' is not a non-negative integer", raw),
    })?;

    if value > max {
        return Err(ConfigError::InvalidSetting {
            name,
            reason: format!("{} is out of range 0..={}", value, max),
        });
    }

    Ok(value)
}

/// On-disk layout of the catalog file
///
/// ```json
/// {
///   "metrics": [
///     ["Response time", "builtin:service.response.time", "SERVICE-1A2B", "Checkout response time"],
///     ["Active users", "uacm.users", "empty", "Active users"]
///   ]
/// }
/// ```
#[derive(Debug, Deserialize)]
struct CatalogFile {
    metrics: Vec<[String; 4]>,
}

/// Ordered, immutable list of metric definitions
#[derive(Debug, Clone)]
pub struct MetricCatalog {
    definitions: Vec<MetricDefinition>,
}

impl MetricCatalog {
    /// Loads and validates the catalog file
    ///
    /// # Errors
    /// * `ConfigError::Io` - the file cannot be read
    /// * `ConfigError::CatalogFormat` - not valid JSON or a record is not a 4-element string array
    /// * `ConfigError::InvalidCatalogEntry` - empty label/selector or duplicate sheet label
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading metric catalog from {}", path.display());

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let file: CatalogFile =
            serde_json::from_str(&raw).map_err(|source| ConfigError::CatalogFormat {
                path: path.to_path_buf(),
                source,
            })?;

        let definitions = file
            .metrics
            .into_iter()
            .map(|[sheet_label, selector, entity, display_label]| MetricDefinition {
                sheet_label,
                selector,
                entity: EntityScope::parse(&entity),
                display_label,
            })
            .collect();

        let catalog = Self::from_definitions(definitions)?;

        info!("Loaded {} metric definition(s)", catalog.len());
        for definition in catalog.iter() {
            info!(
                "  '{}' <- {} ({})",
                definition.sheet_label, definition.selector, definition.entity
            );
        }

        Ok(catalog)
    }

    /// Validates an in-memory list of definitions
    ///
    /// # Arguments
    /// * `definitions` - catalog rows, in the order they will be processed
    ///
    /// # Returns
    /// * `Ok(MetricCatalog)` - every row is usable, order preserved
    /// * `Err(ConfigError::InvalidCatalogEntry)` - the first offending row, 0-based
    pub fn from_definitions(definitions: Vec<MetricDefinition>) -> Result<Self, ConfigError> {
        let mut labels = HashSet::new();

        for (index, definition) in definitions.iter().enumerate() {
            if definition.sheet_label.trim().is_empty() {
                return Err(ConfigError::InvalidCatalogEntry {
                    index,
                    reason: "sheet label is empty".to_string(),
                });
            }
            if definition.selector.trim().is_empty() {
                return Err(ConfigError::InvalidCatalogEntry {
                    index,
                    reason: "metric selector is empty".to_string(),
                });
            }
            // Two rows with one label would both write into the first matching row
            if !labels.insert(definition.sheet_label.as_str()) {
                return Err(ConfigError::InvalidCatalogEntry {
                    index,
                    reason: format!("duplicate sheet label '{}'", definition.sheet_label),
                });
            }
        }

        if definitions.is_empty() {
            warn!("Metric catalog is empty, scheduled runs will write nothing");
        }

        Ok(MetricCatalog { definitions })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }
}
