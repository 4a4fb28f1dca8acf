//! Catalog File Feed
//!
//! Reads a TOML catalog of logical models and their provider offerings and
//! turns it into [`LogicalModel`] values ready for
//! [`ProviderRouter::register`](crate::routing::ProviderRouter::register).
//!
//! ```toml
//! [[models]]
//! id = "gemini-1.5-flash"
//! display_name = "Gemini 1.5 Flash"
//! context_length = 1000000
//! modalities = ["text", "image"]
//!
//! [[models.providers]]
//! provider = "google"
//! provider_model_id = "gemini-1.5-flash-002"
//! priority = 1
//! input_cost_per_1k = 0.075
//! output_cost_per_1k = 0.3
//! capabilities = { streaming = true, function_calling = true, vision = true }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::LogicalModel;

/// Errors raised while reading a catalog
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Catalog file could not be read
    #[error("Failed to read catalog at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Catalog is not valid TOML or has the wrong shape
    #[error("Failed to parse catalog: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Catalog parsed but holds an invalid entry
    #[error("Invalid catalog entry: {0}")]
    ValidationError(String),
}

/// Top-level catalog document
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogDocument {
    /// Every model in the catalog
    pub models: Vec<LogicalModel>,
}

impl CatalogDocument {
    fn validate(&self) -> Result<(), CatalogError> {
        for model in &self.models {
            if model.id.trim().is_empty() {
                return Err(CatalogError::ValidationError("model with empty id".into()));
            }
            for provider in &model.providers {
                if provider.provider.trim().is_empty() {
                    return Err(CatalogError::ValidationError(format!(
                        "model {} has a provider with an empty name",
                        model.id
                    )));
                }
                if provider.input_cost_per_1k < 0.0 || provider.output_cost_per_1k < 0.0 {
                    return Err(CatalogError::ValidationError(format!(
                        "model {} provider {} has a negative cost",
                        model.id, provider.provider
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Parse a catalog document
///
/// # Errors
///
/// Returns [`CatalogError::ParseError`] for malformed TOML and
/// [`CatalogError::ValidationError`] for empty ids, empty provider names or
/// negative costs.
pub fn parse_catalog(content: &str) -> Result<Vec<LogicalModel>, CatalogError> {
    let document: CatalogDocument = toml::from_str(content)?;
    document.validate()?;
    Ok(document.models)
}

/// Read and parse a catalog file
///
/// # Errors
///
/// See [`parse_catalog`]; also [`CatalogError::ReadError`] if the file cannot be read.
pub fn load_catalog(path: &Path) -> Result<Vec<LogicalModel>, CatalogError> {
    let content = std::fs::read_to_string(path).map_err(|e| CatalogError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    let models = parse_catalog(&content)?;

    tracing::info!(
        path = %path.display(),
        models = models.len(),
        offerings = models.iter().map(|m| m.providers.len()).sum::<usize>(),
        "Loaded catalog"
    );
    Ok(models)
}
