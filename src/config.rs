use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::{EndpointPolicy, PolicyTable};
use crate::cache::NamespaceConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  /// Cache partitions; endpoints without one get a default memory namespace
  #[serde(default)]
  pub namespaces: Vec<NamespaceConfig>,
  /// Endpoint -> request policy
  #[serde(default)]
  pub policies: BTreeMap<String, EndpointPolicy>,
  #[serde(default)]
  pub tuning: Tuning,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the admin API, e.g. https://leave.example.com
  pub url: String,
  /// Per-request HTTP timeout
  #[serde(default = "default_timeout_millis")]
  pub timeout_millis: u64,
}

fn default_timeout_millis() -> u64 {
  30_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tuning {
  /// How long a batch collects waiters before it is sent
  pub batch_window_millis: u64,
  /// How long a finished prefetch stays memoized
  pub prefetch_grace_millis: u64,
}

impl Default for Tuning {
  fn default() -> Self {
    Self {
      batch_window_millis: 50,
      prefetch_grace_millis: 5_000,
    }
  }
}

impl Tuning {
  pub fn batch_window(&self) -> Duration {
    Duration::from_millis(self.batch_window_millis)
  }

  pub fn prefetch_grace(&self) -> Duration {
    Duration::from_millis(self.prefetch_grace_millis)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./leavedesk.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/leavedesk/config.yaml
  /// 4. ~/.config/leavedesk/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/leavedesk/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    Self::search_paths().into_iter().find(|p| p.exists())
  }

  /// Candidate config locations, in search order.
  fn search_paths() -> Vec<PathBuf> {
    // Check current directory
    let mut paths = vec![PathBuf::from("leavedesk.yaml")];

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      paths.push(config_dir.join("leavedesk").join("config.yaml"));
    }

    // ~/.config is not the platform config dir on macOS or Windows
    if let Some(home) = dirs::home_dir() {
      let dotconfig = home.join(".config").join("leavedesk").join("config.yaml");
      if !paths.contains(&dotconfig) {
        paths.push(dotconfig);
      }
    }

    paths
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn policy_table(&self) -> PolicyTable {
    self
      .policies
      .iter()
      .map(|(endpoint, policy)| (endpoint.clone(), policy.clone()))
      .collect()
  }

  /// Get the API token from the environment, if one is set.
  ///
  /// Checks LEAVEDESK_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("LEAVEDESK_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
