use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConnError;

pub const DEFAULT_FWHM: u32 = 8;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub smoothing: Option<SmoothingConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SmoothingConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub fwhm: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

impl PipelineConfig {
    pub fn effective_fwhm(&self, cli_fwhm: u32) -> u32 {
        match &self.smoothing {
            // Any JSON number is accepted; the batch script takes whole millimetres.
            Some(smoothing) if smoothing.enabled => smoothing
                .fwhm
                .filter(|fwhm| fwhm.is_finite() && *fwhm >= 0.0)
                .map_or(cli_fwhm, |fwhm| fwhm.round() as u32),
            _ => cli_fwhm,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// No path means defaults. A path that does not exist is reported and
    /// also yields defaults; an unreadable or malformed file is an error.
    pub fn resolve(path: Option<&Utf8Path>) -> Result<PipelineConfig, ConnError> {
        let Some(path) = path else {
            return Ok(PipelineConfig::default());
        };
        if !path.exists() {
            warn!("config file {path} not found, using defaults");
            return Ok(PipelineConfig::default());
        }
        Self::load(path)
    }

    pub fn load(path: &Utf8Path) -> Result<PipelineConfig, ConnError> {
        let content =
            fs::read_to_string(path).map_err(|_| ConnError::ConfigRead(path.to_owned()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<PipelineConfig, ConnError> {
        serde_json::from_str(content).map_err(|err| ConnError::ConfigParse(err.to_string()))
    }
}
