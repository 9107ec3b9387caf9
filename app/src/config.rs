use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Preferences the command-line client keeps between runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliSettings {
    #[serde(default)]
    pub last_conversation: Option<String>,
    #[serde(default = "CliSettings::default_show_timestamps")]
    pub show_timestamps: bool,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            last_conversation: None,
            show_timestamps: CliSettings::default_show_timestamps(),
        }
    }
}

impl CliSettings {
    fn default_show_timestamps() -> bool {
        true
    }
}

pub fn cli_settings_path() -> PathBuf {
    config_dir().join("cli_settings.json")
}

pub async fn load_cli_settings(path: &Path) -> Result<CliSettings> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(settings) => Ok(settings),
            Err(err) => {
                let defaults = CliSettings::default();
                save_cli_settings(path, &defaults).await?;
                warn!(
                    error = ?err,
                    "failed to parse cli_settings.json, resetting to defaults"
                );
                Ok(defaults)
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(CliSettings::default()),
        Err(err) => Err(err).context("failed to read cli_settings.json"),
    }
}

pub async fn save_cli_settings(path: &Path, settings: &CliSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(settings)?;
    tokio::fs::write(path, serialized)
        .await
        .with_context(|| format!("failed to write cli_settings.json at {}", path.display()))
}

fn config_dir() -> PathBuf {
    if let Some(base) = BaseDirs::new() {
        base.config_dir().join("campus")
    } else {
        PathBuf::from(".campus")
    }
}
