//! Registry configuration.
//!
//! Loaded from multiple sources with priority:
//! 1. Default values (hardcoded)
//! 2. Optional TOML file
//! 3. Environment variables prefixed `REGISTRY__` (highest priority),
//!    e.g. `REGISTRY__EVENTS__QUEUE_CAPACITY=256`

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{RegistryError, Result};
use crate::validation::Cidr;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Key-value backend selection and pool tuning
    pub store: StoreConfig,
    /// Listener queue sizing
    pub events: EventsConfig,
    /// Caller-side retry policy for read-modify-write helpers
    pub registry: WriteConfig,
    /// Stateful pod validation inputs
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database file, used by the sqlite backend only
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: PathBuf::from("registry.db"),
            max_connections: 5,
            busy_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Per-listener queue bound; the oldest event is dropped past it
    pub queue_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    pub max_update_retries: u32,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            max_update_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub vpc_cidrs: Vec<String>,
    pub default_instance_type: String,
    /// Empty means any instance type is accepted
    pub allowed_instance_types: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            vpc_cidrs: vec!["172.20.0.0/16".to_string()],
            default_instance_type: "t3.nano".to_string(),
            allowed_instance_types: Vec::new(),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("REGISTRY")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("validation.vpc_cidrs")
                .with_list_parse_key("validation.allowed_instance_types"),
        );

        let config: RegistryConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the registry cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.events.queue_capacity == 0 {
            return Err(RegistryError::InvalidInput(
                "events.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.store.max_connections == 0 {
            return Err(RegistryError::InvalidInput(
                "store.max_connections must be greater than 0".to_string(),
            ));
        }
        for cidr in &self.validation.vpc_cidrs {
            cidr.parse::<Cidr>()?;
        }
        Ok(())
    }
}
