//! Bridge configuration.
//!
//! A `causeway.toml` file (or a programmatically built [`BridgeConfig`])
//! carries the stack sizing policy and the ordered list of proxy libraries
//! the embedder wants initialized. A missing file is not an error; the
//! defaults describe a usable bridge.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::stack::{self, DEFAULT_TRANSLATION_RESERVE};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {file}: {error}")]
    IoError {
        file: PathBuf,
        error: std::io::Error,
    },

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Bridge-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BridgeConfig {
    /// Bytes of host stack reserved for translation frames on guest-created
    /// threads. Guest requests below this are raised to it.
    pub translation_reserve: usize,

    /// Proxy libraries to initialize at startup, in order.
    pub proxy_libraries: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            translation_reserve: DEFAULT_TRANSLATION_RESERVE,
            proxy_libraries: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Loads configuration from a TOML file.
    ///
    /// A missing file yields the defaults; any other I/O failure, syntax
    /// error or unknown field is reported with the offending path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no bridge config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::IoError {
                    file: path.to_path_buf(),
                    error: e,
                })
            }
        };

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in &self.proxy_libraries {
            if name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "proxy_libraries".to_string(),
                    reason: "library names must be non-empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Effective host stack size for a guest thread-creation request under
    /// this configuration.
    pub fn effective_stack_size(&self, requested: usize) -> usize {
        stack::effective_stack_size(requested, self.translation_reserve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.translation_reserve, DEFAULT_TRANSLATION_RESERVE);
        assert!(config.proxy_libraries.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            translation_reserve = 4194304
            proxy_libraries = ["libgfx.so", "libsonic.so", "libthreads.so"]
        "#;

        let config: BridgeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.translation_reserve, 4 * 1024 * 1024);
        assert_eq!(
            config.proxy_libraries,
            vec!["libgfx.so", "libsonic.so", "libthreads.so"]
        );
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let toml_str = r#"
            proxy_libraries = ["libgfx.so"]
        "#;

        let config: BridgeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.translation_reserve, DEFAULT_TRANSLATION_RESERVE);
        assert_eq!(config.proxy_libraries, vec!["libgfx.so"]);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml_str = r#"
            translation_reserve = 1024
            stack_reserve = 2048
        "#;

        let result: Result<BridgeConfig, _> = toml::from_str(toml_str);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_empty_library_name() {
        let config = BridgeConfig {
            proxy_libraries: vec![String::new()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config =
            BridgeConfig::load_from_file(Path::new("/nonexistent/causeway.toml")).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("causeway.toml");
        std::fs::write(
            &path,
            "translation_reserve = 8192\nproxy_libraries = [\"libgfx.so\"]\n",
        )
        .unwrap();

        let config = BridgeConfig::load_from_file(&path).unwrap();
        assert_eq!(config.translation_reserve, 8192);
        assert_eq!(config.proxy_libraries, vec!["libgfx.so"]);
    }

    #[test]
    fn test_load_reports_syntax_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("causeway.toml");
        std::fs::write(&path, "translation_reserve = [").unwrap();

        let err = BridgeConfig::load_from_file(&path).unwrap_err();
        match err {
            ConfigError::TomlParseError { file, .. } => assert_eq!(file, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_effective_stack_size_uses_reserve() {
        let config = BridgeConfig {
            translation_reserve: 1024,
            ..Default::default()
        };
        assert_eq!(config.effective_stack_size(100), 1024);
        assert_eq!(config.effective_stack_size(4096), 4096);
    }
}
