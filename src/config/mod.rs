//! Configuration management for casmesh

pub mod schema;

pub use schema::Config;

use crate::error::{MeshError, MeshResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("casmesh")
            .join("config.toml")
    }

    /// Default shared data root when none is configured
    pub fn default_data_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("casmesh")
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub async fn load(&self) -> MeshResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load and validate configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> MeshResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| MeshError::io(format!("reading config from {}", path.display()), e))?;

        let config: Config = toml::from_str(&content).map_err(|e| MeshError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let problems = config.problems();
        if !problems.is_empty() {
            return Err(MeshError::ConfigInvalid {
                path: path.to_path_buf(),
                reason: problems.join("; "),
            });
        }
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> MeshResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            MeshError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> MeshResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| MeshError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

/// Whether `name` can be used as a single path component
///
/// Stamps, service ids and hostnames all become directory or file names
/// under the shared data root.
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

fn machine_root_for(data_root: &Path, host: &str) -> MeshResult<PathBuf> {
    if !is_plain_name(host) {
        return Err(MeshError::MachineIdentity(format!(
            "hostname {:?} cannot name a directory",
            host
        )));
    }
    Ok(data_root.join("machines").join(host))
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Shared data root, configured or default
    pub fn data_root(&self) -> PathBuf {
        self.general
            .data_root
            .clone()
            .unwrap_or_else(ConfigManager::default_data_root)
    }

    /// Location of this machine's content store
    ///
    /// Defaults to `<data_root>/machines/<hostname>`. The location is the
    /// machine's identity in the mesh, so a hostname that cannot name a
    /// directory is an error rather than a shared fallback.
    pub fn machine_root(&self) -> MeshResult<PathBuf> {
        if let Some(machine) = &self.node.machine {
            return Ok(machine.clone());
        }
        let host = gethostname::gethostname().into_string().map_err(|raw| {
            MeshError::MachineIdentity(format!("hostname {:?} is not UTF-8", raw))
        })?;
        machine_root_for(&self.data_root(), &host)
    }

    /// Directory of daily activity telemetry segments
    pub fn activity_log_dir(&self) -> PathBuf {
        self.data_root().join("activity")
    }
}
