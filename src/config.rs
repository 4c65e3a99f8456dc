use std::{path::Path, time::Duration};

use clap::{Args, Parser, Subcommand};
use fundstore_core::{PoolOptions, StorageError, VariantKind};
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "fundstore", about = "FundStore - schema and seed data tooling for fund accounting")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "fundstore.toml")]
    pub config: String,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Database file or connection string (overrides config file)
    #[arg(short, long)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compare the live database with the record type registry
    Validate(ValidateArgs),
    /// Create or extend the schema, then validate it
    Deploy,
    /// Load seed data from a bootstrap file
    Bootstrap(BootstrapArgs),
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Also report tables and columns the registry does not know about
    #[arg(long)]
    pub flag_extra: bool,
}

#[derive(Args, Debug)]
pub struct BootstrapArgs {
    /// Bootstrap file (.toml or .json)
    #[arg(short, long)]
    pub file: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Ephemeral; everything is lost when the process exits.
    Memory,
    #[default]
    Sqlite,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// File path for SQLite, connection string for PostgreSQL.
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_schema")]
    pub schema: String,

    /// Identifier dialect. Defaults to the natural one for the backend.
    #[serde(default)]
    pub variant: Option<VariantKind>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_url() -> String {
    "fundstore.db".to_string()
}

fn default_schema() -> String {
    "oakfunds".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_connection_timeout_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            backend: BackendKind::default(),
            url: default_url(),
            schema: default_schema(),
            variant: None,
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DatabaseConfig {
    pub fn variant_kind(&self) -> VariantKind {
        self.variant.unwrap_or(match self.backend {
            BackendKind::Memory => VariantKind::UpperCase,
            BackendKind::Sqlite => VariantKind::Sqlite,
            BackendKind::Postgres => VariantKind::Postgres,
        })
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections,
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
        }
    }
}

impl Config {
    pub fn parse(contents: &str) -> Result<Self, StorageError> {
        toml::from_str(contents).map_err(|e| StorageError::Config(e.to_string()))
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    /// A file that exists but does not parse is an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(StorageError::Config(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))),
        }
    }

    pub fn load(cli: &CliArgs) -> Result<Self, StorageError> {
        let mut config = Self::from_file(&cli.config)?;

        // CLI overrides
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }
        if let Some(ref url) = cli.database_url {
            config.database.url = url.clone();
        }

        Ok(config)
    }
}
