//! Configuration management for the probe service.
//!
//! This module handles loading and saving configuration from disk: the
//! transport preference, the adapter to scan on and the phase timeouts.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Try the L2CAP connection-oriented channel before the GATT read
   #[serde(default = "default_prefer_l2cap")]
   pub prefer_l2cap: bool,

   /// Adapter name such as `hci1`; the system default when unset
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<String>,

   #[serde(default = "default_scan_timeout")]
   pub scan_timeout_sec: u64,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   #[serde(default = "default_read_timeout")]
   pub read_timeout_sec: u64,
}

const fn default_prefer_l2cap() -> bool {
   true
}

const fn default_scan_timeout() -> u64 {
   20
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_read_timeout() -> u64 {
   10
}

impl Default for Config {
   fn default() -> Self {
      Self {
         prefer_l2cap: default_prefer_l2cap(),
         adapter: None,
         scan_timeout_sec: default_scan_timeout(),
         connect_timeout_sec: default_connect_timeout(),
         read_timeout_sec: default_read_timeout(),
      }
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

   fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }
      fs::write(path, toml::to_string_pretty(self)?)?;
      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("PODPROBE_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(Error::ConfigDirNotFound);
      };

      Ok(config_dir.join("podprobe").join("config.toml"))
   }

   pub const fn scan_timeout(&self) -> Duration {
      Duration::from_secs(self.scan_timeout_sec)
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }

   pub const fn read_timeout(&self) -> Duration {
      Duration::from_secs(self.read_timeout_sec)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_missing_keys_take_defaults() {
      let config: Config = toml::from_str("adapter = \"hci1\"\n").unwrap();
      assert!(config.prefer_l2cap);
      assert_eq!(config.adapter.as_deref(), Some("hci1"));
      assert_eq!(config.scan_timeout(), Duration::from_secs(20));
      assert_eq!(config.read_timeout(), Duration::from_secs(10));
   }

   #[test]
   fn test_load_creates_default_file() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("podprobe").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());
   }

   #[test]
   fn test_save_then_load_keeps_preference() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");

      let config = Config {
         prefer_l2cap: false,
         connect_timeout_sec: 3,
         ..Config::default()
      };
      config.save_to(&path).unwrap();

      let reloaded = Config::load_from(&path).unwrap();
      assert_eq!(reloaded, config);
      assert!(!fs::read_to_string(&path).unwrap().contains("adapter"));
   }

   #[test]
   fn test_rejects_malformed_file() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "prefer_l2cap = \"sometimes\"").unwrap();
      assert!(matches!(Config::load_from(&path), Err(Error::TomlParse(_))));
   }
}
