use crate::estimator::ValidationError;
use crate::memory::DEFAULT_MEMORY_LIMIT_GIB;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid estimator configuration: {0}")]
    Validation(#[from] ValidationError),
}

/// Hyperparameters of a kernel exponential family fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Gaussian kernel bandwidth.
    pub sigma: f64,
    /// Ridge strength of the score-matching objective.
    pub lambda: f64,
    #[serde(default = "default_memory_limit_gib")]
    pub memory_limit_gib: f64,
}

fn default_memory_limit_gib() -> f64 {
    DEFAULT_MEMORY_LIMIT_GIB
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            sigma: 1.0,
            lambda: 0.01,
            memory_limit_gib: DEFAULT_MEMORY_LIMIT_GIB,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.sigma > 0.0 && self.sigma.is_finite()) {
            return Err(ValidationError::InvalidSigma(self.sigma));
        }
        if !(self.lambda > 0.0 && self.lambda.is_finite()) {
            return Err(ValidationError::InvalidLambda(self.lambda));
        }
        if !(self.memory_limit_gib > 0.0) {
            return Err(ValidationError::InvalidMemoryLimit(self.memory_limit_gib));
        }
        Ok(())
    }

    /// Saves the configuration in a human-readable TOML format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads and validates a configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trips_through_toml() {
        let config = EstimatorConfig {
            sigma: 2.5,
            lambda: 1e-3,
            memory_limit_gib: 0.25,
        };
        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();
        let loaded = EstimatorConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn memory_limit_defaults_when_omitted() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sigma = 0.5\nlambda = 0.1").unwrap();
        file.flush().unwrap();
        let loaded = EstimatorConfig::load(file.path()).unwrap();
        assert_eq!(loaded.memory_limit_gib, DEFAULT_MEMORY_LIMIT_GIB);
    }

    #[test]
    fn invalid_values_fail_validation_on_load() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sigma = -1.0\nlambda = 0.1").unwrap();
        file.flush().unwrap();
        match EstimatorConfig::load(file.path()) {
            Err(ConfigError::Validation(ValidationError::InvalidSigma(sigma))) => {
                assert_eq!(sigma, -1.0)
            }
            other => panic!("Expected InvalidSigma, got {other:?}"),
        }
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sigma = \"wide\"").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            EstimatorConfig::load(file.path()),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn default_is_valid() {
        assert!(EstimatorConfig::default().validate().is_ok());
    }
}
