//! Deployment configuration for the engine.
//!
//! Everything injected at startup lives here: the transform constants, the
//! cache bound, and the feature schemas this process accepts. The transform
//! constants are deliberately configuration: they are part of a deployed
//! model's reproducibility metadata, not magic numbers in code.
//!
//! ```toml
//! cache_capacity = 1024
//!
//! [transform]
//! block_size = 2
//! max_depth = 8
//! truth_coefficient = 1.0
//! normalization_range = 1000.0
//!
//! [[schema]]
//! version = "v1"
//! fields = [
//!     { name = "age", min = 0.0, max = 120.0 },
//!     { name = "temperature_c", min = 30.0, max = 45.0, normalize = true },
//! ]
//! ```

use crate::reduce::PyramidParams;
use crate::schema::FeatureSchema;
use serde::Deserialize;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read engine configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse engine configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// The full engine configuration document. Value-level validation of the
/// transform happens in `Engine::new`, not here: parsing and checking are
/// separate failures with separate owners.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub transform: PyramidParams,
    pub cache_capacity: NonZeroUsize,
    #[serde(rename = "schema", default)]
    pub schemas: Vec<FeatureSchema>,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }
}
