//! Configuration management for the transport.
//!
//! This module handles loading and saving the configuration file, which
//! describes how to find the robot and which GATT characteristics back each
//! logical channel.

use std::{collections::HashSet, env, fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
   channel::ChannelId,
   error::{Result, TransportError},
   framing::codec::TextEncoding,
};

/// Nordic UART service exposed by the robot firmware.
pub const NUS_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Host-to-robot characteristic of the UART service.
pub const NUS_RX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Robot-to-host characteristic of the UART service.
pub const NUS_TX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Main configuration structure.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
   #[serde(default)]
   pub encoding: TextEncoding,

   #[serde(default = "default_discovery_timeout")]
   pub discovery_timeout_sec: u64,

   #[serde(default)]
   pub device: DeviceFilter,

   #[serde(default = "ChannelConfig::uart")]
   pub services: ChannelConfig,
}

/// How to pick the robot among nearby devices.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeviceFilter {
   #[serde(default = "default_name_prefix")]
   pub name_prefix: String,

   /// Exact address; takes precedence over the name prefix.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub address: Option<String>,
}

/// Ordered service → channel → characteristic mapping.
///
/// Order is significant: channels are resolved at connect time in the order
/// they appear here.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(transparent)]
pub struct ChannelConfig {
   services: Vec<ServiceConfig>,
}

/// One primary service and the channels it carries.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServiceConfig {
   pub uuid: Uuid,
   #[serde(default)]
   pub channels: Vec<ChannelMapping>,
}

/// A logical channel backed by one characteristic.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChannelMapping {
   pub id: ChannelId,
   pub uuid: Uuid,
}

fn default_name_prefix() -> String {
   "TT_".to_string()
}

const fn default_discovery_timeout() -> u64 {
   30
}

impl Default for DeviceFilter {
   fn default() -> Self {
      Self {
         name_prefix: default_name_prefix(),
         address: None,
      }
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         encoding: TextEncoding::default(),
         discovery_timeout_sec: default_discovery_timeout(),
         device: DeviceFilter::default(),
         services: ChannelConfig::uart(),
      }
   }
}

impl ChannelConfig {
   pub const fn new() -> Self {
      Self {
         services: Vec::new(),
      }
   }

   /// UART layout of the line-follower firmware: `UART_RX` for commands,
   /// `UART_TX` for responses.
   pub fn uart() -> Self {
      Self::new().with_service(NUS_SERVICE, [("UART_RX", NUS_RX), ("UART_TX", NUS_TX)])
   }

   /// Appends a service with its channels, preserving order.
   pub fn with_service<I, K>(mut self, uuid: Uuid, channels: I) -> Self
   where
      I: IntoIterator<Item = (K, Uuid)>,
      K: Into<ChannelId>,
   {
      self.services.push(ServiceConfig {
         uuid,
         channels: channels
            .into_iter()
            .map(|(id, uuid)| ChannelMapping {
               id: id.into(),
               uuid,
            })
            .collect(),
      });
      self
   }

   pub fn services(&self) -> &[ServiceConfig] {
      &self.services
   }

   /// All channels, in resolution order.
   pub fn channels(&self) -> impl Iterator<Item = &ChannelMapping> {
      self.services.iter().flat_map(|s| s.channels.iter())
   }

   pub fn channel_count(&self) -> usize {
      self.channels().count()
   }

   pub fn is_empty(&self) -> bool {
      self.channel_count() == 0
   }

   /// Rejects layouts with no channels or with a channel id used twice.
   pub fn validate(&self) -> Result<()> {
      if self.is_empty() {
         return Err(TransportError::InvalidConfig(
            "no channels configured".into(),
         ));
      }
      let mut seen = HashSet::new();
      for channel in self.channels() {
         if !seen.insert(&channel.id) {
            return Err(TransportError::InvalidConfig(format!(
               "channel {} is configured more than once",
               channel.id
            )));
         }
      }
      Ok(())
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing the default there first if
   /// the file does not exist.
   pub fn load_from(path: &Path) -> Result<Self> {
      let config = if path.exists() {
         let contents = fs::read_to_string(path)?;
         toml::from_str::<Self>(&contents)?
      } else {
         let config = Self::default();
         config.save_to(path)?;
         config
      };
      config.services.validate()?;
      Ok(config)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("LFCC_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(TransportError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("lfcc").join("config.toml"))
   }
}
