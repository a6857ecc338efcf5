//! Configuration management for the radio observer.
//!
//! This module handles loading and saving configuration from disk,
//! including the names of the consumed events and BlueZ backend settings.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   error::{RadioError, Result},
   event::EventNames,
};

/// Main configuration structure.
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   #[serde(default)]
   pub events: EventNames,

   #[serde(default)]
   pub bluez: BluezConfig,
}

/// Settings for the BlueZ backend.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BluezConfig {
   /// Adapter to drive, e.g. `hci0`. The default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_discovery_timeout")]
   pub discovery_timeout_sec: u64,
}

const fn default_discovery_timeout() -> u64 {
   12
}

impl Default for BluezConfig {
   fn default() -> Self {
      Self {
         adapter: None,
         discovery_timeout_sec: default_discovery_timeout(),
      }
   }
}

impl BluezConfig {
   pub const fn discovery_timeout(&self) -> Duration {
      Duration::from_secs(self.discovery_timeout_sec)
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing the defaults there if the
   /// file does not exist yet.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("RADIO_OBSERVER_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(RadioError::ConfigDirNotFound);
      };

      Ok(config_dir.join("radio-observer").join("config.toml"))
   }
}
