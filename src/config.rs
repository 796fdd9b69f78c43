use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::fs;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the agent socket
    #[serde(default = "default_socket")]
    pub socket: String,
}

fn default_socket() -> String {
    std::env::var("SSH_AUTH_SOCK").unwrap_or_default()
}

impl Config {
    /// Location of the config file, whether or not it exists yet.
    pub fn config_path() -> Result<PathBuf> {
        let base = dirs::config_dir().context("No config directory on this platform")?;
        Ok(base.join("ssh-agent-client").join("config.toml"))
    }

    /// Read the config file, falling back to defaults when there is none.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {:?}", path));
            }
        };
        toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Write the config file, creating its directory on first use.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).with_context(|| format!("Failed to write {:?}", path))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket: default_socket(),
        }
    }
}
