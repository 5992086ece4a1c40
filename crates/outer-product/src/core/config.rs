//! Construction-time configuration for [`OuterProductMean`](crate::OuterProductMean).
//!
//! Dimensions are fixed when the layer is built. The inference chunk size can
//! come from a config file, from the `OPM_CHUNK_SIZE` environment variable, or
//! per call through
//! [`forward_with_chunk_size`](crate::OuterProductMean::forward_with_chunk_size).

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::core::errors::{OuterProductError, Result};

/// Environment variable overriding [`OuterProductConfig::chunk_size`].
///
/// Accepts a positive integer, or `none` / `0` to force the dense path.
pub const CHUNK_SIZE_ENV: &str = "OPM_CHUNK_SIZE";

/// Dimensions and execution knobs for the outer-product mean layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OuterProductConfig {
    /// Channel width of the incoming sequence features.
    pub input_dim: usize,
    /// Width of the left/right projections contracted into pairs.
    pub hidden_dim: usize,
    /// Channel width of the produced pair features.
    pub output_dim: usize,
    /// Inference-only chunk size along the left hidden axis.
    ///
    /// `None` always runs the dense contraction. A trailing chunk shorter than
    /// this value covers the remainder when it does not divide `hidden_dim`.
    #[serde(default)]
    pub chunk_size: Option<usize>,
    /// Stabiliser of the input layer norm.
    #[serde(default = "default_norm_epsilon")]
    pub norm_epsilon: f64,
}

fn default_norm_epsilon() -> f64 {
    1e-5
}

impl OuterProductConfig {
    /// Creates a dense-only configuration.
    pub fn new(input_dim: usize, hidden_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            hidden_dim,
            output_dim,
            chunk_size: None,
            norm_epsilon: default_norm_epsilon(),
        }
    }

    /// Sets the inference chunk size.
    pub fn with_chunk_size(mut self, chunk_size: Option<usize>) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Width of the flattened pair features fed to the output projection.
    pub fn pair_dim(&self) -> usize {
        self.hidden_dim * self.hidden_dim
    }

    /// Loads a `.toml` or `.json` config, applies env overrides, and validates.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(OuterProductError::InvalidConfig(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Layers `OPM_CHUNK_SIZE` on top of the current chunk size.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        let Ok(raw) = std::env::var(CHUNK_SIZE_ENV) else {
            return;
        };
        match parse_chunk_size(&raw) {
            Some(chunk_size) => {
                log::debug!("{CHUNK_SIZE_ENV}={raw} overrides chunk_size={:?}", self.chunk_size);
                self.chunk_size = chunk_size;
            }
            None => log::warn!("ignoring {CHUNK_SIZE_ENV}={raw:?}: expected a positive integer or 'none'"),
        }
    }

    /// Validate structural invariants before any parameters are built.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.input_dim == 0 {
            errors.push("input_dim must be greater than zero".to_string());
        }
        if self.hidden_dim == 0 {
            errors.push("hidden_dim must be greater than zero".to_string());
        }
        if self.output_dim == 0 {
            errors.push("output_dim must be greater than zero".to_string());
        }
        if self.norm_epsilon.is_nan() || self.norm_epsilon <= 0.0 {
            errors.push(format!(
                "norm_epsilon must be positive, got {}",
                self.norm_epsilon
            ));
        }
        if !errors.is_empty() {
            return Err(OuterProductError::InvalidConfig(errors.join("; ")));
        }
        if let Some(chunk_size) = self.chunk_size {
            validate_chunk_size(chunk_size, self.hidden_dim)?;
        }
        Ok(())
    }
}

/// Rejects chunk sizes outside `[1, hidden_dim]`.
pub fn validate_chunk_size(chunk_size: usize, hidden_dim: usize) -> Result<()> {
    if chunk_size == 0 || chunk_size > hidden_dim {
        Err(OuterProductError::InvalidChunkSize {
            chunk_size,
            hidden_dim,
        })
    } else {
        Ok(())
    }
}

/// `Some(None)` disables chunking, `Some(Some(n))` sets it, `None` is invalid.
fn parse_chunk_size(raw: &str) -> Option<Option<usize>> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("none") || trimmed.is_empty() {
        return Some(None);
    }
    match trimmed.parse::<usize>() {
        Ok(0) => Some(None),
        Ok(value) => Some(Some(value)),
        Err(_) => None,
    }
}
