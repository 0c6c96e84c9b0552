//! Configuration loading with precedence: CLI args > env vars > config file
//! > defaults
//!
//! Environment variables use the `RELAY_` prefix; a `.env` file is honored
//! but never overrides variables already set in the environment.

use crate::error::RelayError;
use clap::Parser;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP/WebSocket listener binds to
    pub bind_addr: String,
    /// `host:port` entries trusted for the Origin header
    pub allowed_origins: Vec<String>,
    /// Hard cap on concurrent WebSocket connections
    pub max_connections: usize,
    /// Depth of each connection's outbound message queue
    pub outbound_queue_depth: usize,
    pub idle_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub write_deadline_secs: u64,
    /// Master switch for the HTTP admission token bucket
    pub rate_limit_enabled: bool,
    pub bucket_capacity: u32,
    pub bucket_refill_per_sec: f64,
    pub bucket_sweep_interval_secs: u64,
    pub bucket_idle_secs: u64,
    pub msg_max_per_window: usize,
    pub msg_window_ms: u64,
    pub msg_backoff_base_ms: u64,
    pub msg_backoff_multiplier: f64,
    pub msg_backoff_max_secs: u64,
    pub adaptive_interval_secs: u64,
    pub adaptive_high_load_keys: usize,
    pub adaptive_low_load_keys: usize,
    pub adaptive_min_rate_per_sec: f64,
    pub abuse_flood_threshold: u32,
    pub abuse_observation_secs: u64,
    pub abuse_block_secs: u64,
    pub abuse_sweep_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // 35729 is the conventional livereload port
            bind_addr: "127.0.0.1:35729".to_string(),
            allowed_origins: vec![
                "localhost:3000".to_string(),
                "127.0.0.1:3000".to_string(),
            ],
            max_connections: 256,
            outbound_queue_depth: 32,
            idle_timeout_secs: 300,
            ping_interval_secs: 30,
            write_deadline_secs: 10,
            rate_limit_enabled: true,
            bucket_capacity: 60,
            bucket_refill_per_sec: 1.0,
            bucket_sweep_interval_secs: 120,
            // 10x the time a full bucket takes to refill
            bucket_idle_secs: 600,
            msg_max_per_window: 100,
            msg_window_ms: 1000,
            msg_backoff_base_ms: 1000,
            msg_backoff_multiplier: 2.0,
            msg_backoff_max_secs: 300,
            adaptive_interval_secs: 30,
            adaptive_high_load_keys: 1000,
            adaptive_low_load_keys: 100,
            adaptive_min_rate_per_sec: 0.25,
            abuse_flood_threshold: 300,
            abuse_observation_secs: 10,
            abuse_block_secs: 300,
            abuse_sweep_interval_secs: 60,
            shutdown_grace_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

/// CLI arguments. Only the operational knobs are exposed here; everything
/// else is reachable via environment variables or the config file.
#[derive(Debug, Parser)]
#[command(name = "reload-relay")]
#[command(about = "Live-update hub for a development preview server")]
pub struct CliArgs {
    /// Path to configuration file (TOML or YAML)
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:35729
    #[arg(long)]
    pub bind_addr: Option<String>,

    /// Comma-separated host:port origins allowed to connect
    #[arg(long, value_delimiter = ',')]
    pub allowed_origins: Option<Vec<String>>,

    /// Maximum concurrent WebSocket connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds of inbound silence before a connection is dropped
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Keepalive ping interval in seconds
    #[arg(long)]
    pub ping_interval_secs: Option<u64>,

    /// Enable or disable the HTTP admission rate limiter
    #[arg(long)]
    pub rate_limit_enabled: Option<bool>,

    /// Logging level: trace, debug, info, warn, error
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Config file structure (TOML or YAML)
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    relay: Option<RelaySection>,
    rate_limit: Option<RateLimitSection>,
    messages: Option<MessagesSection>,
    abuse: Option<AbuseSection>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Default, Deserialize)]
struct RelaySection {
    bind_addr: Option<String>,
    allowed_origins: Option<Vec<String>>,
    max_connections: Option<usize>,
    outbound_queue_depth: Option<usize>,
    idle_timeout_secs: Option<u64>,
    ping_interval_secs: Option<u64>,
    write_deadline_secs: Option<u64>,
    shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitSection {
    enabled: Option<bool>,
    bucket_capacity: Option<u32>,
    bucket_refill_per_sec: Option<f64>,
    bucket_sweep_interval_secs: Option<u64>,
    bucket_idle_secs: Option<u64>,
    adaptive_interval_secs: Option<u64>,
    adaptive_high_load_keys: Option<usize>,
    adaptive_low_load_keys: Option<usize>,
    adaptive_min_rate_per_sec: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesSection {
    max_per_window: Option<usize>,
    window_ms: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    backoff_max_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AbuseSection {
    flood_threshold: Option<u32>,
    observation_secs: Option<u64>,
    block_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingSection {
    level: Option<String>,
}

impl Config {
    /// Load configuration, layering file then env then CLI over defaults so
    /// later sources win.
    pub fn load(cli_args: &CliArgs) -> Result<Config, RelayError> {
        // .env never overrides variables already present in the environment
        dotenv::dotenv().ok();

        let mut config = Config::default();

        if let Some(path) = &cli_args.config_file {
            let file = Self::load_from_file(path)?;
            config.apply_file(file);
        }
        config.apply_env();
        config.apply_cli(cli_args);
        config.validate()?;

        Ok(config)
    }

    fn load_from_file(path: &PathBuf) -> Result<ConfigFile, RelayError> {
        use config::Config as ConfigBuilder;

        if !path.exists() {
            return Err(RelayError::ConfigError(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let file_source = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => {
                config::File::from(path.as_path()).format(config::FileFormat::Yaml)
            }
            // Unknown extensions default to TOML
            _ => config::File::from(path.as_path()).format(config::FileFormat::Toml),
        };

        let builder = ConfigBuilder::builder()
            .add_source(file_source)
            .build()
            .map_err(|e| RelayError::ConfigError(format!("Failed to load config file: {}", e)))?;

        builder
            .try_deserialize()
            .map_err(|e| RelayError::ConfigError(format!("Failed to parse config file: {}", e)))
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(relay) = file.relay {
            set(&mut self.bind_addr, relay.bind_addr);
            set(&mut self.allowed_origins, relay.allowed_origins);
            set(&mut self.max_connections, relay.max_connections);
            set(&mut self.outbound_queue_depth, relay.outbound_queue_depth);
            set(&mut self.idle_timeout_secs, relay.idle_timeout_secs);
            set(&mut self.ping_interval_secs, relay.ping_interval_secs);
            set(&mut self.write_deadline_secs, relay.write_deadline_secs);
            set(&mut self.shutdown_grace_secs, relay.shutdown_grace_secs);
        }
        if let Some(rate) = file.rate_limit {
            set(&mut self.rate_limit_enabled, rate.enabled);
            set(&mut self.bucket_capacity, rate.bucket_capacity);
            set(&mut self.bucket_refill_per_sec, rate.bucket_refill_per_sec);
            set(&mut self.bucket_sweep_interval_secs, rate.bucket_sweep_interval_secs);
            set(&mut self.bucket_idle_secs, rate.bucket_idle_secs);
            set(&mut self.adaptive_interval_secs, rate.adaptive_interval_secs);
            set(&mut self.adaptive_high_load_keys, rate.adaptive_high_load_keys);
            set(&mut self.adaptive_low_load_keys, rate.adaptive_low_load_keys);
            set(&mut self.adaptive_min_rate_per_sec, rate.adaptive_min_rate_per_sec);
        }
        if let Some(messages) = file.messages {
            set(&mut self.msg_max_per_window, messages.max_per_window);
            set(&mut self.msg_window_ms, messages.window_ms);
            set(&mut self.msg_backoff_base_ms, messages.backoff_base_ms);
            set(&mut self.msg_backoff_multiplier, messages.backoff_multiplier);
            set(&mut self.msg_backoff_max_secs, messages.backoff_max_secs);
        }
        if let Some(abuse) = file.abuse {
            set(&mut self.abuse_flood_threshold, abuse.flood_threshold);
            set(&mut self.abuse_observation_secs, abuse.observation_secs);
            set(&mut self.abuse_block_secs, abuse.block_secs);
            set(&mut self.abuse_sweep_interval_secs, abuse.sweep_interval_secs);
        }
        if let Some(logging) = file.logging {
            set(&mut self.log_level, logging.level);
        }
    }

    fn apply_env(&mut self) {
        set(&mut self.bind_addr, env::var("RELAY_BIND_ADDR").ok());
        set(
            &mut self.allowed_origins,
            env::var("RELAY_ALLOWED_ORIGINS").ok().map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),
        );
        set(&mut self.max_connections, env_parse("RELAY_MAX_CONNECTIONS"));
        set(&mut self.outbound_queue_depth, env_parse("RELAY_QUEUE_DEPTH"));
        set(&mut self.idle_timeout_secs, env_parse("RELAY_IDLE_TIMEOUT_SECS"));
        set(&mut self.ping_interval_secs, env_parse("RELAY_PING_INTERVAL_SECS"));
        set(&mut self.write_deadline_secs, env_parse("RELAY_WRITE_DEADLINE_SECS"));
        set(&mut self.rate_limit_enabled, env_parse("RELAY_RATE_LIMIT_ENABLED"));
        set(&mut self.bucket_capacity, env_parse("RELAY_BUCKET_CAPACITY"));
        set(&mut self.bucket_refill_per_sec, env_parse("RELAY_BUCKET_REFILL_PER_SEC"));
        set(&mut self.bucket_sweep_interval_secs, env_parse("RELAY_BUCKET_SWEEP_SECS"));
        set(&mut self.bucket_idle_secs, env_parse("RELAY_BUCKET_IDLE_SECS"));
        set(&mut self.msg_max_per_window, env_parse("RELAY_MSG_MAX_PER_WINDOW"));
        set(&mut self.msg_window_ms, env_parse("RELAY_MSG_WINDOW_MS"));
        set(&mut self.msg_backoff_base_ms, env_parse("RELAY_MSG_BACKOFF_BASE_MS"));
        set(&mut self.msg_backoff_multiplier, env_parse("RELAY_MSG_BACKOFF_MULTIPLIER"));
        set(&mut self.msg_backoff_max_secs, env_parse("RELAY_MSG_BACKOFF_MAX_SECS"));
        set(&mut self.adaptive_interval_secs, env_parse("RELAY_ADAPTIVE_INTERVAL_SECS"));
        set(&mut self.adaptive_high_load_keys, env_parse("RELAY_ADAPTIVE_HIGH_LOAD_KEYS"));
        set(&mut self.adaptive_low_load_keys, env_parse("RELAY_ADAPTIVE_LOW_LOAD_KEYS"));
        set(&mut self.adaptive_min_rate_per_sec, env_parse("RELAY_ADAPTIVE_MIN_RATE"));
        set(&mut self.abuse_flood_threshold, env_parse("RELAY_ABUSE_FLOOD_THRESHOLD"));
        set(&mut self.abuse_observation_secs, env_parse("RELAY_ABUSE_OBSERVATION_SECS"));
        set(&mut self.abuse_block_secs, env_parse("RELAY_ABUSE_BLOCK_SECS"));
        set(&mut self.abuse_sweep_interval_secs, env_parse("RELAY_ABUSE_SWEEP_SECS"));
        set(&mut self.shutdown_grace_secs, env_parse("RELAY_SHUTDOWN_GRACE_SECS"));
        set(&mut self.log_level, env::var("RELAY_LOG_LEVEL").ok());
    }

    fn apply_cli(&mut self, cli: &CliArgs) {
        set(&mut self.bind_addr, cli.bind_addr.clone());
        set(&mut self.allowed_origins, cli.allowed_origins.clone());
        set(&mut self.max_connections, cli.max_connections);
        set(&mut self.idle_timeout_secs, cli.idle_timeout_secs);
        set(&mut self.ping_interval_secs, cli.ping_interval_secs);
        set(&mut self.rate_limit_enabled, cli.rate_limit_enabled);
        set(&mut self.log_level, cli.log_level.clone());
    }

    fn validate(&self) -> Result<(), RelayError> {
        if self.max_connections == 0 {
            return Err(RelayError::ConfigError(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.outbound_queue_depth == 0 {
            return Err(RelayError::ConfigError(
                "outbound_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.msg_window_ms == 0 || self.msg_max_per_window == 0 {
            return Err(RelayError::ConfigError(
                "message window and max_per_window must be positive".to_string(),
            ));
        }
        if self.msg_backoff_multiplier < 1.0 {
            return Err(RelayError::ConfigError(
                "backoff multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.bucket_capacity == 0 {
            return Err(RelayError::ConfigError(
                "bucket_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}
