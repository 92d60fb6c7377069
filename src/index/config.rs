//! Index configuration
//!
//! Loaded from a JSON file; every field has a default so an empty object
//! is a valid configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::errors::{IndexError, IndexResult};
use super::value::canonical_locale;
use crate::observability::Severity;

/// Attribute index configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Cache the resolved chain order between writes (default: true)
    #[serde(default = "default_memoize_resolved_order")]
    pub memoize_resolved_order: bool,

    /// Verify chain invariants of every committed chain index (default: false)
    #[serde(default)]
    pub verify_chains_on_commit: bool,

    /// Minimum log severity (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Locales accepted for localized attributes; empty accepts any
    #[serde(default)]
    pub allowed_locales: Vec<String>,
}

fn default_memoize_resolved_order() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            memoize_resolved_order: default_memoize_resolved_order(),
            verify_chains_on_commit: false,
            log_level: default_log_level(),
            allowed_locales: Vec::new(),
        }
    }
}

impl IndexConfig {
    /// Configuration with chain verification switched on
    pub fn verifying() -> Self {
        Self {
            verify_chains_on_commit: true,
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> IndexResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            IndexError::configuration(format!("Failed to read config {}: {}", path.display(), e))
        })?;

        let config: IndexConfig = serde_json::from_str(&content)
            .map_err(|e| IndexError::configuration(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate field values
    pub fn validate(&self) -> IndexResult<()> {
        if Severity::parse(&self.log_level).is_none() {
            return Err(IndexError::configuration(format!(
                "Invalid log_level: '{}'",
                self.log_level
            )));
        }

        if self.allowed_locales.iter().any(|l| l.trim().is_empty()) {
            return Err(IndexError::configuration("allowed_locales must not contain empty tags"));
        }

        Ok(())
    }

    /// Parsed log severity
    pub fn severity(&self) -> Severity {
        Severity::parse(&self.log_level).unwrap_or(Severity::Info)
    }

    /// Canonical form of the allowed locales
    pub fn canonical_locales(&self) -> Vec<String> {
        let mut locales: Vec<String> = self.allowed_locales.iter().map(|l| canonical_locale(l)).collect();
        locales.sort();
        locales.dedup();
        locales
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = IndexConfig::default();
        assert!(config.memoize_resolved_order);
        assert!(!config.verify_chains_on_commit);
        assert_eq!(config.severity(), Severity::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: IndexConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, IndexConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"verify_chains_on_commit": true, "log_level": "warn", "allowed_locales": ["cs_cz", "en"]}}"#
        )
        .unwrap();

        let config = IndexConfig::load(file.path()).unwrap();
        assert!(config.verify_chains_on_commit);
        assert_eq!(config.severity(), Severity::Warn);
        assert_eq!(config.canonical_locales(), vec!["cs-CZ", "en"]);
    }

    #[test]
    fn test_invalid_log_level() {
        let config = IndexConfig {
            log_level: "loud".into(),
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().code(), "IDX_CONFIG_INVALID");
    }

    #[test]
    fn test_missing_file() {
        let err = IndexConfig::load(Path::new("/nonexistent/index.json")).unwrap_err();
        assert_eq!(err.code(), "IDX_CONFIG_INVALID");
    }
}
