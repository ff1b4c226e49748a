//! Logical channel identifiers.
//!
//! A channel is the application-facing name of one GATT characteristic.
//! The firmware contract is that ids ending in `TX` are notify channels
//! (robot to host) and every other id is a write channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Suffix marking a notify channel.
pub const NOTIFY_SUFFIX: &str = "TX";

/// Data direction of a channel, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
   Send,
   Receive,
}

/// Logical channel id such as `UART_RX` or `UART_TX`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(SmolStr);

impl ChannelId {
   pub fn new(id: impl Into<SmolStr>) -> Self {
      Self(id.into())
   }

   pub const fn new_static(id: &'static str) -> Self {
      Self(SmolStr::new_static(id))
   }

   pub fn as_str(&self) -> &str {
      self.0.as_str()
   }

   /// Direction implied by the naming convention.
   pub fn direction(&self) -> Direction {
      if self.0.ends_with(NOTIFY_SUFFIX) {
         Direction::Receive
      } else {
         Direction::Send
      }
   }

   pub fn is_notify(&self) -> bool {
      self.direction() == Direction::Receive
   }
}

impl fmt::Display for ChannelId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

impl AsRef<str> for ChannelId {
   fn as_ref(&self) -> &str {
      self.as_str()
   }
}

impl From<&str> for ChannelId {
   fn from(id: &str) -> Self {
      Self::new(id)
   }
}

impl From<String> for ChannelId {
   fn from(id: String) -> Self {
      Self::new(id)
   }
}

impl From<&ChannelId> for ChannelId {
   fn from(id: &ChannelId) -> Self {
      id.clone()
   }
}
