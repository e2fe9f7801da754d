use crate::error::{EngineError, EngineResult};
use crate::sandbox::config::SandboxConfig;
use crate::secrets::DEFAULT_PLACEHOLDER;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Wall-clock limit for one run, in milliseconds.
    pub timeout_ms: u64,
    /// Sentinel marking where generated code expects a credential.
    pub placeholder: String,
    pub sandbox: SandboxConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        log::debug!("loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.timeout_ms == 0 {
            return Err(EngineError::Config("timeout_ms must be positive".to_string()));
        }
        if self.placeholder.trim().is_empty() {
            return Err(EngineError::Config("placeholder must not be empty".to_string()));
        }
        if self.sandbox.interpreter.as_os_str().is_empty() {
            return Err(EngineError::Config("sandbox.interpreter must be set".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxRuntimeType;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn test_empty_file_gives_defaults() {
        assert_eq!(EngineConfig::from_toml_str("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_toml_str(
            r#"
timeout_ms = 5000

[sandbox]
runtime_type = "unjailed"
interpreter = "/opt/node/bin/node"
network_enabled = false
"#,
        )
        .unwrap();
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.placeholder, "YOUR_API_KEY");
        assert_eq!(config.sandbox.runtime_type, SandboxRuntimeType::Unjailed);
        assert_eq!(config.sandbox.interpreter, PathBuf::from("/opt/node/bin/node"));
        assert!(!config.sandbox.network_enabled);
        assert!(config.sandbox.extra_ro_binds.is_empty());
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("timeout_ms = 0"),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("placeholder = \"  \""),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[sandbox]\nruntime_type = \"docker\""),
            Err(EngineError::Toml(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandcell.toml");
        std::fs::write(&path, "placeholder = \"<<KEY>>\"\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.placeholder, "<<KEY>>");

        let missing = EngineConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(EngineError::Config(_))));
    }
}
