//! Engine configuration module.
//!
//! This module provides configuration loading for the storage engine from
//! environment variables, plus the process-wide instance installed at startup.
//!
//! # Environment Variables
//!
//! - `ENGINE_BLOCK_SIZE`: Size of every cache block in bytes (default: `4096`)
//! - `ENGINE_MAX_REF_LEN`: Maximum blob reference length in bytes (default: `251`)
//! - `ENGINE_BLOB_FANOUT`: Concurrent leaf acquisitions per blob read (default: `8`)
//!
//! # Invariants
//!
//! - `block_size` is within `MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE`
//! - `max_ref_len` can hold a large reference with at least one block id, and
//!   a leaf block holds four maximal entries
//! - `blob_fanout` is at least 1

use std::sync::OnceLock;

use crate::storage::btree::LEAF_HEADER_SIZE;
use crate::storage::page::{BLOCK_ID_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::types::MAX_KEY_SIZE;

/// Engine configuration.
///
/// # Post-conditions
///
/// When constructed via `from_env()` or `validate()` returns `Ok`, every
/// invariant listed in the module documentation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Size of every block in the buffer cache.
    pub block_size: usize,
    /// Maximum length of a blob reference stored inside a leaf.
    pub max_ref_len: usize,
    /// Maximum number of blob leaf blocks acquired concurrently.
    pub blob_fanout: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
    /// `init` was called after a configuration was already installed.
    AlreadyInitialized,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
            Self::AlreadyInitialized => write!(f, "engine configuration already initialized"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: Self::DEFAULT_BLOCK_SIZE,
            max_ref_len: Self::DEFAULT_MAX_REF_LEN,
            blob_fanout: Self::DEFAULT_BLOB_FANOUT,
        }
    }
}

impl EngineConfig {
    /// Default block size.
    pub const DEFAULT_BLOCK_SIZE: usize = 4096;
    /// Default maximum blob reference length.
    pub const DEFAULT_MAX_REF_LEN: usize = 251;
    /// Default blob leaf fan-out.
    pub const DEFAULT_BLOB_FANOUT: usize = 8;

    /// Smallest usable reference: size prefix, 8-byte value size, one block id.
    pub const MIN_MAX_REF_LEN: usize = 2 + 8 + BLOCK_ID_SIZE;

    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse as a positive
    /// integer, or if the resulting combination is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            block_size: Self::load_usize("ENGINE_BLOCK_SIZE", Self::DEFAULT_BLOCK_SIZE)?,
            max_ref_len: Self::load_usize("ENGINE_MAX_REF_LEN", Self::DEFAULT_MAX_REF_LEN)?,
            blob_fanout: Self::load_usize("ENGINE_BLOB_FANOUT", Self::DEFAULT_BLOB_FANOUT)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration invariants.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(ConfigError::InvalidValue {
                name: "ENGINE_BLOCK_SIZE".to_string(),
                message: format!("{} is outside {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}", self.block_size),
            });
        }

        // A split leaf must leave room for another maximal entry in either half.
        let max_entry = 2 + 8 + 1 + MAX_KEY_SIZE + self.max_ref_len;
        if self.max_ref_len < Self::MIN_MAX_REF_LEN
            || self.max_ref_len > usize::from(u16::MAX)
            || LEAF_HEADER_SIZE + max_entry * 4 > self.block_size
        {
            return Err(ConfigError::InvalidValue {
                name: "ENGINE_MAX_REF_LEN".to_string(),
                message: format!(
                    "{} must be at least {} and leave room for four maximal entries in a {} byte block",
                    self.max_ref_len,
                    Self::MIN_MAX_REF_LEN,
                    self.block_size
                ),
            });
        }

        if self.blob_fanout == 0 {
            return Err(ConfigError::InvalidValue {
                name: "ENGINE_BLOB_FANOUT".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Load a positive integer from the environment.
    ///
    /// Returns `default` if not set.
    fn load_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
        match std::env::var(name) {
            Ok(value) => value.trim().parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}' is not a valid non-negative integer"),
            }),
            Err(_) => Ok(default),
        }
    }
}

static GLOBAL: OnceLock<EngineConfig> = OnceLock::new();

/// Install the process-wide configuration.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or one was already installed.
pub fn init(config: EngineConfig) -> Result<(), ConfigError> {
    config.validate()?;
    GLOBAL.set(config).map_err(|_| ConfigError::AlreadyInitialized)?;
    tracing::info!(
        block_size = config.block_size,
        max_ref_len = config.max_ref_len,
        blob_fanout = config.blob_fanout,
        "engine configuration initialized"
    );
    Ok(())
}

/// The process-wide configuration, or the defaults if none was installed.
#[must_use]
pub fn global() -> EngineConfig {
    GLOBAL.get().copied().unwrap_or_default()
}
