use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::db::DatabaseSettings;
use crate::engine::EngineSettings;
use crate::queue::QueueSettings;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

const ENV_PREFIX: &str = "FORMSHIFT_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub formshift: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const FORMSHIFT_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            formshift: Self::FORMSHIFT_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let original = self.formshift.clone();
        self.formshift = self.formshift.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.formshift.as_str()) {
            eprintln!(
                "Config error: formshift log level of '{}' is invalid - using default of '{}'",
                original,
                Self::FORMSHIFT_LEVEL
            );
            self.formshift = Self::FORMSHIFT_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    const HOST: &str = "127.0.0.1";
    const PORT: u16 = 8080;

    fn default() -> Self {
        ServerConfig {
            host: Self::HOST.to_string(),
            port: Self::PORT,
        }
    }

    fn ensure_valid(&mut self) {
        if self.host.trim().is_empty() {
            eprintln!("Config error: server host is empty - using default of '{}'", Self::HOST);
            self.host = Self::HOST.to_string();
        }
        if self.port == 0 {
            eprintln!("Config error: server port 0 is invalid - using default of {}", Self::PORT);
            self.port = Self::PORT;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// Database file. Empty means `formshift.db` in the data directory.
    pub path: String,
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    const FILE_NAME: &str = "formshift.db";
    const POOL_SIZE: u32 = 8;
    const BUSY_TIMEOUT_MS: u64 = 30_000;

    fn default() -> Self {
        DatabaseConfig {
            path: String::new(),
            pool_size: Self::POOL_SIZE,
            busy_timeout_ms: Self::BUSY_TIMEOUT_MS,
        }
    }

    pub fn db_path(&self, data_dir: &Path) -> PathBuf {
        if self.path.trim().is_empty() {
            data_dir.join(Self::FILE_NAME)
        } else {
            PathBuf::from(self.path.trim())
        }
    }

    pub fn settings(&self) -> DatabaseSettings {
        DatabaseSettings {
            pool_size: self.pool_size,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }

    fn ensure_valid(&mut self) {
        // Workers, the dispatcher and API handlers all draw from the pool
        if self.pool_size < 2 {
            eprintln!(
                "Config error: database pool_size of {} is too small - using default of {}",
                self.pool_size,
                Self::POOL_SIZE
            );
            self.pool_size = Self::POOL_SIZE;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TablesConfig {
    /// Prepended to a form id to name its table
    pub prefix: String,
}

impl TablesConfig {
    const PREFIX: &str = "form_";

    fn default() -> Self {
        TablesConfig {
            prefix: Self::PREFIX.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let valid = self.prefix.len() < 32
            && self.prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !self.prefix.starts_with(|c: char| c.is_ascii_digit());
        if !valid {
            eprintln!(
                "Config error: table prefix '{}' is invalid - using default of '{}'",
                self.prefix,
                Self::PREFIX
            );
            self.prefix = Self::PREFIX.to_string();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MigrationsConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub poll_interval_secs: u64,
    pub operation_timeout_secs: u64,
    pub large_table_rows: u64,
    pub backup_batch_size: usize,
    pub backup_retention_days: i64,
    pub backup_safe_conversions: bool,
}

impl MigrationsConfig {
    const WORKERS: usize = 4;
    const MAX_RETRIES: u32 = 3;
    const RETRY_BASE_DELAY_MS: u64 = 500;
    const RETRY_MAX_DELAY_MS: u64 = 30_000;
    const POLL_INTERVAL_SECS: u64 = 2;
    const OPERATION_TIMEOUT_SECS: u64 = 30;
    const LARGE_TABLE_ROWS: u64 = 10_000;
    const BACKUP_BATCH_SIZE: usize = 1000;
    const BACKUP_RETENTION_DAYS: i64 = 90;

    fn default() -> Self {
        MigrationsConfig {
            workers: Self::WORKERS,
            max_retries: Self::MAX_RETRIES,
            retry_base_delay_ms: Self::RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: Self::RETRY_MAX_DELAY_MS,
            poll_interval_secs: Self::POLL_INTERVAL_SECS,
            operation_timeout_secs: Self::OPERATION_TIMEOUT_SECS,
            large_table_rows: Self::LARGE_TABLE_ROWS,
            backup_batch_size: Self::BACKUP_BATCH_SIZE,
            backup_retention_days: Self::BACKUP_RETENTION_DAYS,
            backup_safe_conversions: false,
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            workers: self.workers,
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            large_table_rows: self.large_table_rows,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            backup_batch_size: self.backup_batch_size,
            backup_retention_days: self.backup_retention_days,
            backup_safe_conversions: self.backup_safe_conversions,
        }
    }

    fn ensure_valid(&mut self) {
        fn positive<T: PartialOrd + Default + Copy + std::fmt::Display>(name: &str, value: &mut T, default: T) {
            if *value <= T::default() {
                eprintln!(
                    "Config error: migrations {} of {} is invalid - using default of {}",
                    name, value, default
                );
                *value = default;
            }
        }

        positive("workers", &mut self.workers, Self::WORKERS);
        positive("retry_base_delay_ms", &mut self.retry_base_delay_ms, Self::RETRY_BASE_DELAY_MS);
        positive("poll_interval_secs", &mut self.poll_interval_secs, Self::POLL_INTERVAL_SECS);
        positive("operation_timeout_secs", &mut self.operation_timeout_secs, Self::OPERATION_TIMEOUT_SECS);
        positive("large_table_rows", &mut self.large_table_rows, Self::LARGE_TABLE_ROWS);
        positive("backup_batch_size", &mut self.backup_batch_size, Self::BACKUP_BATCH_SIZE);

        if self.backup_retention_days < 0 {
            eprintln!(
                "Config error: migrations backup_retention_days of {} is invalid - using default of {}",
                self.backup_retention_days,
                Self::BACKUP_RETENTION_DAYS
            );
            self.backup_retention_days = Self::BACKUP_RETENTION_DAYS;
        }

        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            eprintln!(
                "Config error: migrations retry_max_delay_ms of {} is below retry_base_delay_ms - using {}",
                self.retry_max_delay_ms, self.retry_base_delay_ms
            );
            self.retry_max_delay_ms = self.retry_base_delay_ms;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub tables: TablesConfig,
    pub migrations: MigrationsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            tables: TablesConfig::default(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Config {
    /// Load once and keep for the life of the process.
    pub fn init(project_dirs: &ProjectDirs) -> &'static Config {
        CONFIG.get_or_init(|| Self::load_config(project_dirs))
    }

    /// Loads the configuration from `config.toml` in the app's data directory,
    /// then applies `FORMSHIFT_` environment overrides (`__` separates sections,
    /// e.g. `FORMSHIFT_SERVER__PORT`). Writes the defaults to disk if no file
    /// exists. Falls back to defaults if the merged configuration can't be read.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");
        let default_config = Config::default();

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            match toml::to_string_pretty(&default_config) {
                Ok(toml_string) => {
                    if let Err(e) = fs::write(&config_path, toml_string) {
                        eprintln!(
                            "Failed to write default config to {}: {}",
                            config_path.display(),
                            e
                        );
                    }
                }
                Err(e) => eprintln!("Failed to serialize default config: {}", e),
            }
        }

        Self::from_figment(Self::figment(&config_path), &config_path)
    }

    fn figment(config_path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn from_figment(figment: Figment, config_path: &Path) -> Self {
        let mut config: Config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            Config::default()
        });

        config.ensure_valid();
        config
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.server.ensure_valid();
        self.database.ensure_valid();
        self.tables.ensure_valid();
        self.migrations.ensure_valid();
    }
}
