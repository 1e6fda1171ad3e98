//! Search configuration
//!
//! The configuration surface consumed by the search core. Every field has a
//! default so partial JSON documents can be loaded; the library itself never
//! reads the environment.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Type alias for configuration results
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Notation used by the defect score table for method identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureFormat {
    /// `pkg.Class.method(I[Ljava/lang/String;)V`, identical to the lookup names
    Jvm,
    /// `pkg.Class:method(int;String[];)boolean:`, converted on load and on lookup
    Native,
}

impl Default for SignatureFormat {
    fn default() -> Self {
        SignatureFormat::Jvm
    }
}

/// Configuration for a predictive many-objective search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Number of survivors kept each generation
    pub population_size: usize,

    /// Generations without a change in the uncovered buggy goal count
    /// before held goals are admitted
    pub stagnation_threshold: u32,

    /// Generation at which held goals are admitted if no buggy goal was covered
    pub zero_coverage_threshold: u32,

    /// Run the goal balancing hook before each ranking step
    pub balance_coverage: bool,

    /// Notation of the method identifiers in the defect score table
    pub signature_format: SignatureFormat,

    /// Location of the defect score table
    pub defect_scores_path: Option<PathBuf>,

    /// Stop after this many generations
    pub max_generations: Option<u32>,

    /// Stop after this many seconds of search
    pub max_time_secs: Option<u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            population_size: 50,
            stagnation_threshold: 50,
            zero_coverage_threshold: 50,
            balance_coverage: false,
            signature_format: SignatureFormat::Jvm,
            defect_scores_path: None,
            max_generations: None,
            max_time_secs: Some(60),
        }
    }
}

impl SearchConfig {
    /// Parse a JSON document, filling absent fields with defaults
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let config: SearchConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check the values that the search cannot run without
    pub fn validate(&self) -> ConfigResult<()> {
        if self.population_size == 0 {
            return Err(ConfigError::Invalid(
                "population_size must be at least 1".to_string(),
            ));
        }
        if self.max_time_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "max_time_secs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Wall-clock search budget, if any
    pub fn max_time(&self) -> Option<Duration> {
        self.max_time_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SearchConfig::default();
        assert_eq!(config.population_size, 50);
        assert_eq!(config.signature_format, SignatureFormat::Jvm);
        assert!(!config.balance_coverage);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SearchConfig::from_json_str(
            r#"{ "population_size": 8, "signature_format": "native", "balance_coverage": true }"#,
        )
        .unwrap();

        assert_eq!(config.population_size, 8);
        assert_eq!(config.signature_format, SignatureFormat::Native);
        assert!(config.balance_coverage);
        assert_eq!(config.stagnation_threshold, 50);
        assert_eq!(config.max_time(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_rejects_empty_population() {
        let err = SearchConfig::from_json_str(r#"{ "population_size": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_json() {
        let err = SearchConfig::from_json_str("{ population_size").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "zero_coverage_threshold": 5, "defect_scores_path": "scores.csv" }}"#).unwrap();

        let config = SearchConfig::from_file(file.path()).unwrap();
        assert_eq!(config.zero_coverage_threshold, 5);
        assert_eq!(config.defect_scores_path, Some(PathBuf::from("scores.csv")));
    }
}
