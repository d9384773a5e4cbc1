//! JIT configuration, loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reach of an unconditional `B`: near and far code must both fit inside it
/// so every block can branch to every other block and to the far stubs.
pub const MAX_CODE_SPACE: usize = 128 * 1024 * 1024;

const DEFAULT_CODE_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime configuration for the JIT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JitConfig {
    /// Emit optimistic inline accesses for addresses not known at compile
    /// time. When off every such access calls the slow routine.
    pub fastmem: bool,
    pub block_linking: bool,
    /// When off, blocks flush every guest register after each instruction.
    pub register_cache: bool,
    pub near_code_size: usize,
    pub far_code_size: usize,
    /// Keep code pages either writable or executable, never both.
    pub write_xor_execute: bool,
    pub log_level: String,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            fastmem: true,
            block_linking: true,
            register_cache: true,
            near_code_size: DEFAULT_CODE_SIZE,
            far_code_size: DEFAULT_CODE_SIZE,
            write_xor_execute: cfg!(target_os = "macos"),
            log_level: "warn".to_string(),
        }
    }
}

impl JitConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.near_code_size == 0 || self.far_code_size == 0 {
            return Err(ConfigError::Invalid("code region sizes must be non-zero".to_string()));
        }
        let total = self.near_code_size.checked_add(self.far_code_size);
        if total.is_none_or(|total| total > MAX_CODE_SPACE) {
            return Err(ConfigError::Invalid(format!(
                "near_code_size + far_code_size must not exceed {} bytes",
                MAX_CODE_SPACE
            )));
        }
        if !matches!(
            self.log_level.to_ascii_lowercase().as_str(),
            "off" | "error" | "warn" | "info" | "debug" | "trace"
        ) {
            return Err(ConfigError::Invalid(format!("unknown log level '{}'", self.log_level)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JitConfig::default();
        assert!(config.fastmem);
        assert!(config.block_linking);
        assert_eq!(config.near_code_size, 32 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = JitConfig::from_toml_str("fastmem = false\nlog_level = \"debug\"\n").unwrap();
        assert!(!config.fastmem);
        assert_eq!(config.log_level, "debug");
        assert!(config.register_cache);
    }

    #[test]
    fn test_rejects_oversized_code_space() {
        let err = JitConfig::from_toml_str("near_code_size = 100000000\nfar_code_size = 100000000\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = JitConfig::from_toml_str("turbo = true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = JitConfig { block_linking: false, ..JitConfig::default() };
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("block_linking = false"));
        assert_eq!(JitConfig::from_toml_str(&text).unwrap(), config);
    }
}
