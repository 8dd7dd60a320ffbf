//! Configuration module for regionjoin.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [streams.event]
//! name = "guest-locations"
//! initial_position = "latest"
//!
//! [streams.reference]
//! name = "${REGION_CHANGELOG_STREAM}"
//! format = "dynamodb"
//!
//! [streams.output]
//! name = "guest-regions"
//!
//! [buffer]
//! capacity = 1000
//! ttl_ms = 60000
//! time_domain = "event"
//!
//! [checkpoint]
//! dir = "/var/lib/regionjoin"
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::buffer::{BufferConfig, TimeDomain};
use crate::engine::{EngineConfig, RestartPolicy};
use crate::processor::ProcessorConfig;
use crate::reference::ReferenceFormat;
use crate::source::InitialPosition;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid substitution pattern: {0}")]
    PatternError(#[from] regex::Error),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RegionJoinConfig {
    #[serde(default)]
    pub streams: StreamsConfig,

    #[serde(default)]
    pub buffer: BufferSection,

    #[serde(default)]
    pub checkpoint: CheckpointSection,

    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Stream identifiers. All three names are required.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StreamsConfig {
    #[serde(default)]
    pub event: StreamConfig,

    #[serde(default)]
    pub reference: ReferenceStreamConfig,

    #[serde(default)]
    pub output: OutputStreamConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default)]
    pub name: Option<String>,

    /// Region hint for the stream, reported on `/health`
    #[serde(default = "default_region")]
    pub region: String,

    /// Where to start without a checkpoint
    #[serde(default)]
    pub initial_position: Option<InitialPosition>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: None,
            region: default_region(),
            initial_position: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ReferenceStreamConfig {
    #[serde(flatten)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub format: ReferenceFormat,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutputStreamConfig {
    #[serde(flatten)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub sink: SinkKind,
}

/// Where RegionEvents are delivered.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// XADD to the output stream on Redis
    #[default]
    Redis,
    /// Log each event with `tracing`; the stream name is used as log prefix
    Log,
}

fn default_region() -> String {
    env::var("AWS_REGION").unwrap_or_else(|_| "us-west-2".to_string())
}

/// Pending-buffer settings
#[derive(Debug, Deserialize, Clone)]
pub struct BufferSection {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    #[serde(default)]
    pub time_domain: TimeDomain,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_ms: default_ttl_ms(),
            time_domain: TimeDomain::default(),
        }
    }
}

fn default_capacity() -> usize {
    1000
}

fn default_ttl_ms() -> u64 {
    60_000
}

/// Checkpoint settings
#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointSection {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_checkpoint_interval_ms")]
    pub interval_ms: u64,

    /// Complete checkpoints kept on disk
    #[serde(default = "default_retain")]
    pub retain: usize,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            interval_ms: default_checkpoint_interval_ms(),
            retain: default_retain(),
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_checkpoint_interval_ms() -> u64 {
    5_000
}

fn default_retain() -> usize {
    3
}

/// Engine settings
#[derive(Debug, Deserialize, Clone)]
pub struct EngineSection {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// JSON array of definitions loaded when no checkpoint exists
    #[serde(default)]
    pub seed_file: Option<PathBuf>,

    #[serde(default = "default_max_out_of_orderness_ms")]
    pub max_out_of_orderness_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    #[serde(default)]
    pub max_restarts: Option<u32>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            seed_file: None,
            max_out_of_orderness_ms: default_max_out_of_orderness_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            channel_capacity: default_channel_capacity(),
            restart_backoff_ms: default_restart_backoff_ms(),
            max_restarts: None,
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_max_out_of_orderness_ms() -> u64 {
    10_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_restart_backoff_ms() -> u64 {
    1_000
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Approximate length cap of the output streams
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            max_len: default_max_len(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_max_len() -> usize {
    100_000
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl RegionJoinConfig {
    /// Load configuration from the default path or REGIONJOIN_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = env::var("REGIONJOIN_CONFIG")
            .unwrap_or_else(|_| "config/regionjoin.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    ///
    /// A missing file yields defaults, which then fail validation on the
    /// required stream names.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let config = if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            let content = fs::read_to_string(path)?;
            Self::parse(&content)?
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.validate()?;

        info!(
            event_stream = %config.event_stream(),
            reference_stream = %config.reference_stream(),
            output_stream = %config.output_stream(),
            workers = config.engine.workers,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse TOML after substituting `${VAR}` placeholders.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        debug!("Parsing TOML configuration");
        Ok(toml::from_str(&content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("streams.event.name", &self.streams.event.name),
            ("streams.reference.name", &self.streams.reference.stream.name),
            ("streams.output.name", &self.streams.output.stream.name),
        ];
        for (field, value) in required {
            match value.as_deref() {
                None | Some("") => return Err(ConfigError::MissingField(field.to_string())),
                Some(name) if name.contains("${") => {
                    return Err(ConfigError::ValidationError(format!(
                        "{field} contains an unsubstituted environment variable: {name}"
                    )));
                }
                Some(_) => {}
            }
        }

        if self.engine.workers == 0 {
            return Err(ConfigError::ValidationError(
                "engine.workers must be at least 1".to_string(),
            ));
        }
        if self.buffer.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "buffer.capacity must be at least 1".to_string(),
            ));
        }
        if self.buffer.ttl_ms == 0 {
            return Err(ConfigError::ValidationError(
                "buffer.ttl_ms must be positive".to_string(),
            ));
        }
        if self.checkpoint.interval_ms == 0 || self.engine.sweep_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "checkpoint.interval_ms and engine.sweep_interval_ms must be positive".to_string(),
            ));
        }

        if self.streams.output.stream.initial_position.is_some() {
            warn!("streams.output.initial_position has no effect");
        }

        Ok(())
    }

    pub fn event_stream(&self) -> &str {
        self.streams.event.name.as_deref().unwrap_or_default()
    }

    pub fn reference_stream(&self) -> &str {
        self.streams.reference.stream.name.as_deref().unwrap_or_default()
    }

    pub fn output_stream(&self) -> &str {
        self.streams.output.stream.name.as_deref().unwrap_or_default()
    }

    /// Engine settings derived from the configuration.
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            workers: self.engine.workers,
            processor: ProcessorConfig {
                buffer: BufferConfig {
                    capacity: self.buffer.capacity,
                    ttl: millis(self.buffer.ttl_ms),
                    time_domain: self.buffer.time_domain,
                },
                max_out_of_orderness: millis(self.engine.max_out_of_orderness_ms),
            },
            checkpoint_interval: Duration::from_millis(self.checkpoint.interval_ms),
            sweep_interval: Duration::from_millis(self.engine.sweep_interval_ms),
            event_start: self
                .streams
                .event
                .initial_position
                .unwrap_or(defaults.event_start),
            reference_start: self
                .streams
                .reference
                .stream
                .initial_position
                .unwrap_or(defaults.reference_start),
            reference_format: self.streams.reference.format,
            channel_capacity: self.engine.channel_capacity,
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            base_delay: Duration::from_millis(self.engine.restart_backoff_ms),
            max_restarts: self.engine.max_restarts,
        }
    }
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;

    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [streams.event]
        name = "locations"

        [streams.reference]
        name = "regions"

        [streams.output]
        name = "guest-regions"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("REGIONJOIN_TEST_VAR", "substituted_value");
        let input = "name = \"${REGIONJOIN_TEST_VAR}\"";
        let output = substitute_env_vars(input).unwrap();
        assert_eq!(output, "name = \"substituted_value\"");
        env::remove_var("REGIONJOIN_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "name = \"${NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input).unwrap();
        assert_eq!(output, "name = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = RegionJoinConfig::parse(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.event_stream(), "locations");
        assert_eq!(config.output_stream(), "guest-regions");
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.streams.output.sink, SinkKind::Redis);
        assert_eq!(config.checkpoint.interval_ms, 5_000);
        assert_eq!(config.engine.max_out_of_orderness_ms, 10_000);

        let engine = config.engine_config();
        assert_eq!(engine.event_start, InitialPosition::Latest);
        assert_eq!(engine.reference_start, InitialPosition::Earliest);
        assert_eq!(engine.reference_format, ReferenceFormat::Changelog);
        assert_eq!(engine.processor.buffer.ttl, chrono::Duration::seconds(60));
        assert_eq!(engine.processor.buffer.time_domain, TimeDomain::Wall);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [streams.event]
            name = "locations"
            region = "eu-west-1"
            initial_position = "earliest"

            [streams.reference]
            name = "regions"
            format = "dynamodb"
            initial_position = "latest"

            [streams.output]
            name = "guest-regions"
            sink = "log"

            [buffer]
            capacity = 10
            ttl_ms = 5000
            time_domain = "event"

            [checkpoint]
            dir = "/tmp/chk"
            interval_ms = 1000
            retain = 5

            [engine]
            workers = 8
            seed_file = "regions.json"
            max_restarts = 3

            [server]
            port = 4000
        "#;

        let config = RegionJoinConfig::parse(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.streams.event.region, "eu-west-1");
        assert_eq!(config.streams.output.sink, SinkKind::Log);
        assert_eq!(config.checkpoint.dir, PathBuf::from("/tmp/chk"));
        assert_eq!(config.checkpoint.retain, 5);
        assert_eq!(config.engine.seed_file, Some(PathBuf::from("regions.json")));
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.restart_policy().max_restarts, Some(3));

        let engine = config.engine_config();
        assert_eq!(engine.workers, 8);
        assert_eq!(engine.event_start, InitialPosition::Earliest);
        assert_eq!(engine.reference_start, InitialPosition::Latest);
        assert_eq!(engine.reference_format, ReferenceFormat::DynamoDb);
        assert_eq!(engine.processor.buffer.capacity, 10);
        assert_eq!(engine.processor.buffer.ttl, chrono::Duration::seconds(5));
        assert_eq!(engine.processor.buffer.time_domain, TimeDomain::Event);
        assert_eq!(engine.checkpoint_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_missing_stream_names() {
        let config = RegionJoinConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField(field)) if field == "streams.event.name"
        ));

        let toml = r#"
            [streams.event]
            name = "locations"
            [streams.reference]
            name = "regions"
        "#;
        let config = RegionJoinConfig::parse(toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField(field)) if field == "streams.output.name"
        ));
    }

    #[test]
    fn test_unsubstituted_stream_name_is_rejected() {
        let toml = MINIMAL.replace("\"regions\"", "\"${REGIONJOIN_UNSET_STREAM}\"");
        let config = RegionJoinConfig::parse(&toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validation_zero_workers() {
        let toml = format!("{MINIMAL}\n[engine]\nworkers = 0\n");
        let config = RegionJoinConfig::parse(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_time_domain() {
        let toml = format!("{MINIMAL}\n[buffer]\ntime_domain = \"processing\"\n");
        assert!(matches!(
            RegionJoinConfig::parse(&toml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_missing_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let result = RegionJoinConfig::load_from(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regionjoin.toml");
        fs::write(&path, MINIMAL).unwrap();
        let config = RegionJoinConfig::load_from(&path).unwrap();
        assert_eq!(config.reference_stream(), "regions");
    }
}
