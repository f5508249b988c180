use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::features::{ExtractionOptions, MatchingOptions};
use crate::geometry::TwoViewGeometryOptions;
use crate::mapper::MapperOptions;
use crate::view_graph::PairingMode;

/// Error types for loading a pipeline configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read configuration")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration.
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Options of every pipeline stage.
///
/// Missing fields take their default values, so a configuration file only
/// needs to list what it changes:
///
/// ```
/// use kornia_sfm::config::SfmConfig;
///
/// let config = SfmConfig::from_json_str(r#"{ "mapper": { "min_num_correspondences": 30 } }"#).unwrap();
/// assert_eq!(config.mapper.min_num_correspondences, 30);
/// assert_eq!(config.extraction.max_num_features, 4096);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SfmConfig {
    /// Feature extraction.
    pub extraction: ExtractionOptions,
    /// Descriptor matching.
    pub matching: MatchingOptions,
    /// Candidate pair selection.
    pub pairing: PairingMode,
    /// Two-view geometric verification.
    pub verification: TwoViewGeometryOptions,
    /// Incremental mapping, including bundle adjustment and filtering.
    pub mapper: MapperOptions,
}

impl SfmConfig {
    /// Read a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Write the configuration as pretty JSON.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }
}
