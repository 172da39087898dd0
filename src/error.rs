//! Unified error types for Moorage

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Moorage operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    #[error("Failed to decode network configuration: {0}")]
    NetConf(#[from] serde_json::Error),

    // Range errors
    #[error("Invalid subnet range '{input}': {reason}")]
    InvalidRange { input: String, reason: String },

    // Allocation errors
    #[error("no available IPs in {range}")]
    PoolExhausted { range: String },

    #[error("{addr} is already leased to {holder}")]
    AddressInUse { addr: std::net::Ipv4Addr, holder: String },

    // Store errors
    #[error("Key-value store at {address} unavailable: {message}")]
    StoreUnavailable { address: String, message: String },

    #[error("Key-value store error: {0}")]
    Store(String),

    // Election errors
    #[error("Master discovery failed: {0}")]
    MasterDiscovery(String),

    #[error("Election state transition rejected: {0}")]
    ElectionState(String),

    // CNI protocol errors
    #[error("{0}: not implemented")]
    NotImplemented(String),

    #[error("unknown CNI_COMMAND: {0}")]
    UnknownCommand(String),

    #[error("Required environment variable {0} is not set")]
    MissingEnv(&'static str),
}

impl Error {
    /// Error code reported to the container runtime
    ///
    /// Codes below 100 are the well-known CNI codes; the rest are ours.
    pub fn cni_code(&self) -> u32 {
        match self {
            Error::ConfigRead { .. }
            | Error::ConfigParse(_)
            | Error::ConfigValidation(_)
            | Error::InvalidRange { .. } => 7,
            Error::NetConf(_) => 6,
            Error::MissingEnv(_) | Error::UnknownCommand(_) => 4,
            Error::Io(_) => 5,
            Error::StoreUnavailable { .. } => 11,
            Error::PoolExhausted { .. } => 100,
            Error::Store(_) => 101,
            Error::MasterDiscovery(_) | Error::ElectionState(_) => 102,
            Error::NotImplemented(_) => 103,
            Error::AddressInUse { .. } => 104,
        }
    }
}

/// Result type alias for Moorage operations
pub type Result<T> = std::result::Result<T, Error>;
