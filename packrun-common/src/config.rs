//! Configuration loading and root folder resolution
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority)
//! 2. `PACKRUN_ROOT_FOLDER`, then `PACKRUN_ROOT` environment variables
//! 3. `root_folder` key of the module TOML config file
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing or unreadable TOML file is never fatal: the resolver logs a
//! warning and falls through to the next tier.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable names consulted during resolution
pub const ENV_ROOT_FOLDER: &str = "PACKRUN_ROOT_FOLDER";
pub const ENV_ROOT: &str = "PACKRUN_ROOT";
pub const ENV_API_URL: &str = "PACKRUN_API_URL";
pub const ENV_API_TOKEN: &str = "PACKRUN_API_TOKEN";

/// Database file created inside the root folder
pub const DATABASE_FILE_NAME: &str = "packrun.db";

/// Compiled-in defaults for the current platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        let root_folder = if cfg!(target_os = "windows") {
            // %LOCALAPPDATA%\packrun
            dirs::data_local_dir()
                .map(|d| d.join("packrun"))
                .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\packrun"))
        } else if cfg!(target_os = "macos") {
            // ~/Library/Application Support/packrun
            dirs::data_dir()
                .map(|d| d.join("packrun"))
                .unwrap_or_else(|| PathBuf::from("/Library/Application Support/packrun"))
        } else {
            // ~/.local/share/packrun
            dirs::data_local_dir()
                .map(|d| d.join("packrun"))
                .unwrap_or_else(|| PathBuf::from("./packrun_data"))
        };

        Self {
            root_folder,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Logging section of the TOML config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_file: None,
        }
    }
}

/// `[orchestrator]` tuning overrides
///
/// Every field is optional; unset fields keep the orchestrator's built-in
/// defaults. Durations are in the unit named by the field suffix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorToml {
    pub fast_poll_interval_ms: Option<u64>,
    pub slow_poll_interval_ms: Option<u64>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub backoff_cap_ms: Option<u64>,
    pub max_consecutive_failures: Option<u32>,
    pub extraction_timeout_secs: Option<u64>,
    pub analysis_timeout_secs: Option<u64>,
    pub background_timeout_secs: Option<u64>,
    pub status_request_timeout_secs: Option<u64>,
    pub submission_timeout_secs: Option<u64>,
    pub partial_billing_threshold: Option<u64>,
    pub seconds_per_unit: Option<u64>,
    pub session_debounce_ms: Option<u64>,
}

/// Module TOML configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub root_folder: Option<PathBuf>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorToml,
}

/// Default config file path for a module: `<config_dir>/packrun/<module>.toml`
pub fn default_config_path(module_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("packrun").join(format!("{}.toml", module_name)))
}

/// Parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Load a TOML config, falling back to defaults when the file is missing or invalid
pub fn load_toml_config_or_default(path: &Path) -> TomlConfig {
    if !path.exists() {
        warn!(
            "Config file {} not found, using compiled defaults",
            path.display()
        );
        return TomlConfig::default();
    }

    match load_toml_config(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("{}; using compiled defaults", e);
            TomlConfig::default()
        }
    }
}

/// Write a TOML config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Resolves the root folder for a module
#[derive(Debug, Clone)]
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    config_path: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
            config_path: default_config_path(module_name),
        }
    }

    /// Command-line override (highest priority)
    pub fn with_cli_arg(mut self, cli_arg: Option<PathBuf>) -> Self {
        self.cli_arg = cli_arg;
        self
    }

    /// Use a specific TOML file instead of the platform default location
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            debug!("Root folder from command line: {}", path.display());
            return path.clone();
        }

        for var in [ENV_ROOT_FOLDER, ENV_ROOT] {
            if let Ok(path) = std::env::var(var) {
                if !path.trim().is_empty() {
                    debug!("Root folder from {}: {}", var, path);
                    return PathBuf::from(path);
                }
            }
        }

        if let Some(config_path) = &self.config_path {
            if config_path.exists() {
                match load_toml_config(config_path) {
                    Ok(TomlConfig {
                        root_folder: Some(root),
                        ..
                    }) => {
                        debug!("Root folder from {}: {}", config_path.display(), root.display());
                        return root;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("{}; ignoring config file for root folder", e),
                }
            }
        }

        CompiledDefaults::for_current_platform().root_folder
    }
}

/// Creates the root folder and locates files inside it
#[derive(Debug, Clone)]
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    /// Idempotent
    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_folder).map_err(|e| {
            Error::Config(format!(
                "Cannot create root folder {}: {}",
                self.root_folder.display(),
                e
            ))
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE_NAME)
    }

    pub fn database_exists(&self) -> bool {
        self.database_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_defaults_when_section_missing() {
        let config: TomlConfig = toml::from_str("api_base_url = \"http://localhost:8000\"").unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.log_file.is_none());
        assert_eq!(config.orchestrator, OrchestratorToml::default());
    }

    #[test]
    fn test_orchestrator_section_parses_partial_overrides() {
        let config: TomlConfig = toml::from_str(
            r#"
            [orchestrator]
            fast_poll_interval_ms = 1500
            partial_billing_threshold = 25
            "#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.fast_poll_interval_ms, Some(1500));
        assert_eq!(config.orchestrator.partial_billing_threshold, Some(25));
        assert_eq!(config.orchestrator.slow_poll_interval_ms, None);
    }

    #[test]
    fn test_cli_arg_wins() {
        let resolver = RootFolderResolver::new("packrun-test")
            .with_cli_arg(Some(PathBuf::from("/tmp/packrun-cli-root")));
        assert_eq!(resolver.resolve(), PathBuf::from("/tmp/packrun-cli-root"));
    }

    #[test]
    fn test_database_path_inside_root() {
        let init = RootFolderInitializer::new(PathBuf::from("/tmp/packrun-root"));
        assert_eq!(init.database_path(), PathBuf::from("/tmp/packrun-root/packrun.db"));
    }
}
