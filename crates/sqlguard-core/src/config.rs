//! Guard configuration files (YAML or JSON).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::validators::{AdapterConfig, GuardConfig, GuardSpec, ValidatorKind};

/// Errors that can occur when loading guard configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config validation failed: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

fn default_name() -> String {
    "sqlguard".to_string()
}

/// Top-level guard configuration file.
///
/// ```yaml
/// name: spider-sqlite
/// guard:
///   dialect: sqlite
///   allow_before_select: true
///   treat_incomplete_as_ok: true
/// adapter:
///   root: external/picard
///   backend:
///     type: in_process
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardFile {
    #[serde(default = "default_name")]
    pub name: String,

    /// Grammar guard settings
    #[serde(default)]
    pub guard: GuardConfig,

    /// External adapter settings, needed only for the external validator
    #[serde(default)]
    pub adapter: Option<AdapterConfig>,
}

impl Default for GuardFile {
    fn default() -> Self {
        Self {
            name: default_name(),
            guard: GuardConfig::default(),
            adapter: None,
        }
    }
}

impl GuardFile {
    /// Parse from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let file: GuardFile = serde_yaml::from_str(yaml)?;
        file.validate()?;
        Ok(file)
    }

    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: GuardFile = serde_json::from_str(json)?;
        file.validate()?;
        Ok(file)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Load by extension: `.json` is JSON, anything else YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_file(path)
        } else {
            Self::from_yaml_file(path)
        }
    }

    /// Recipe for the requested validator variant.
    pub fn guard_spec(&self, kind: ValidatorKind) -> Result<GuardSpec, ConfigError> {
        match kind {
            ValidatorKind::Grammar => Ok(GuardSpec::Grammar(self.guard.clone())),
            ValidatorKind::External => self
                .adapter
                .clone()
                .map(GuardSpec::External)
                .ok_or_else(|| ConfigError::MissingField("adapter".to_string())),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.guard.dialect.trim().is_empty() {
            return Err(ConfigError::MissingField("guard.dialect".to_string()));
        }

        if crate::validators::SqlGuard::new(self.guard.clone()).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Unknown SQL dialect: {}",
                self.guard.dialect
            )));
        }

        if let Some(adapter) = &self.adapter {
            if adapter.root.as_os_str().is_empty() {
                return Err(ConfigError::MissingField("adapter.root".to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_yaml() {
        let file = GuardFile::from_yaml(
            r#"
name: spider
guard:
  dialect: postgres
  treat_incomplete_as_ok: false
adapter:
  root: external/picard
"#,
        )
        .unwrap();

        assert_eq!(file.name, "spider");
        assert_eq!(file.guard.dialect, "postgres");
        assert!(file.guard.allow_before_select);
        assert!(!file.guard.treat_incomplete_as_ok);
        assert!(file.adapter.is_some());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let file = GuardFile::from_yaml("{}").unwrap();
        assert_eq!(file.name, "sqlguard");
        assert_eq!(file.guard, GuardConfig::default());
        assert!(file.adapter.is_none());
    }

    #[test]
    fn test_unknown_dialect_rejected() {
        let result = GuardFile::from_json(r#"{"guard": {"dialect": "fortran"}}"#);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_external_spec_requires_adapter() {
        let file = GuardFile::default();
        assert!(matches!(
            file.guard_spec(ValidatorKind::External),
            Err(ConfigError::MissingField(_))
        ));
        assert!(file.guard_spec(ValidatorKind::Grammar).is_ok());
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.json");
        fs::write(&path, r#"{"name": "json-guard"}"#).unwrap();

        let file = GuardFile::from_file(&path).unwrap();
        assert_eq!(file.name, "json-guard");
    }
}
