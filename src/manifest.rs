//! Configuration file parsing for Moorage
//!
//! Parses the optional `moorage.toml` settings file using serde. Every
//! field has a default, so a missing file means a stock local setup.

use crate::error::{Error, Result};
use crate::helm::ElectionOptions;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Load settings from a file, falling back to defaults if it does not exist
pub fn load(path: &Path) -> Result<Settings> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Settings::default());
        }
        Err(e) => {
            return Err(Error::ConfigRead {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    let settings: Settings = toml::from_str(&content)?;
    settings.validate()?;
    Ok(settings)
}

/// Root settings structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Local key-value endpoint
    #[serde(default)]
    pub store: StoreConfig,

    /// Master election
    #[serde(default)]
    pub election: ElectionConfig,
}

impl Settings {
    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.store.address.is_empty() {
            return Err(Error::ConfigValidation("store.address is empty".into()));
        }

        if self.store.lease_key.is_empty() {
            return Err(Error::ConfigValidation("store.lease_key is empty".into()));
        }

        if self.store.pool_size == 0 {
            return Err(Error::ConfigValidation(
                "store.pool_size must be at least 1".into(),
            ));
        }

        if self.election.master_key.is_empty() {
            return Err(Error::ConfigValidation(
                "election.master_key is empty".into(),
            ));
        }

        // The key must outlive the gap between refreshes
        if self.election.refresh_secs == 0 || self.election.refresh_secs >= self.election.ttl_secs {
            return Err(Error::ConfigValidation(format!(
                "election.refresh_secs ({}) must be between 1 and ttl_secs ({})",
                self.election.refresh_secs, self.election.ttl_secs
            )));
        }

        if matches!(self.election.advertise.as_deref(), Some("")) {
            return Err(Error::ConfigValidation(
                "election.advertise is empty".into(),
            ));
        }

        Ok(())
    }

    /// Apply command-line overrides
    pub fn with_overrides(mut self, store: Option<String>, advertise: Option<String>) -> Result<Self> {
        if let Some(address) = store {
            self.store.address = address;
        }
        if advertise.is_some() {
            self.election.advertise = advertise;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.store.connect_timeout_secs)
    }

    /// Election parameters derived from these settings
    pub fn election_options(&self) -> ElectionOptions {
        ElectionOptions {
            advertise: self.election.advertise.clone(),
            master_key: self.election.master_key.clone(),
            ttl: Duration::from_secs(self.election.ttl_secs),
            refresh: Duration::from_secs(self.election.refresh_secs),
        }
    }
}

fn default_store_address() -> String {
    "127.0.0.1:9300".into()
}

fn default_pool_size() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_lease_key() -> String {
    "stellarproject.io/ips".into()
}

/// Key-value store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Endpoint used for reads (and for writes while no master is known)
    #[serde(default = "default_store_address")]
    pub address: String,

    /// Maximum pooled connections per endpoint
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Seconds to wait for a connection before giving up
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Hash holding container id to address leases
    #[serde(default = "default_lease_key")]
    pub lease_key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: default_store_address(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            lease_key: default_lease_key(),
        }
    }
}

fn default_master_key() -> String {
    "stellarproject.io/master".into()
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_refresh_secs() -> u64 {
    45
}

/// Master election configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ElectionConfig {
    /// Address published when this host claims mastership
    pub advertise: Option<String>,

    /// Key holding the current master's address
    #[serde(default = "default_master_key")]
    pub master_key: String,

    /// Master key lifetime in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds between master key refreshes
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            advertise: None,
            master_key: default_master_key(),
            ttl_secs: default_ttl_secs(),
            refresh_secs: default_refresh_secs(),
        }
    }
}
