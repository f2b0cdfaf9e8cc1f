use std::path::PathBuf;

/// Environment variable naming the vault root directory.
pub const ROOT_VAR: &str = "VAULT_ROOT";

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory holding one subdirectory per owner
    pub root: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `VAULT_ROOT`: Path to the vault root (supports ~ for home directory)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration, preferring an explicit root (from `--root`) over the environment.
    pub fn resolve(root_override: Option<PathBuf>) -> Result<Self, ConfigError> {
        match root_override {
            Some(root) => Ok(Self {
                root: expand_tilde(&root.to_string_lossy()),
            }),
            None => Self::from_env(),
        }
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let root_str = lookup(ROOT_VAR)
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::MissingRoot)?;

        Ok(Self {
            root: expand_tilde(root_str.trim()),
        })
    }
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("VAULT_ROOT environment variable not set (or pass --root)")]
    MissingRoot,
}
