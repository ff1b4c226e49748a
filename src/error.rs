//! Error types for the transport.
//!
//! Every error maps onto one of a small set of [`ErrorKind`]s that callers
//! can branch on, and carries a suggested corrective action for display.

use std::io;

use thiserror::Error;

use crate::{bluetooth::gatt::GattError, channel::ChannelId};

/// Machine-checkable classification of a [`TransportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
   DeviceSelectionFailed,
   ConnectionFailed,
   SubscriptionRejected,
   WriteFailed,
   Configuration,
}

/// Step of `connect` that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConnectStage {
   #[strum(to_string = "link establishment")]
   Link,
   #[strum(to_string = "service resolution")]
   Service,
   #[strum(to_string = "characteristic resolution")]
   Characteristic,
   #[strum(to_string = "notification setup")]
   Notifications,
}

/// Why a subscription was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RejectReason {
   #[strum(to_string = "not connected")]
   NotConnected,
   #[strum(to_string = "channel has no notify characteristic")]
   ChannelNotRegistered,
}

/// Main error type for the transport.
#[derive(Error, Debug)]
pub enum TransportError {
   #[error("Device selection failed: {message}")]
   DeviceSelectionFailed {
      message: String,
      #[source]
      cause: Option<GattError>,
   },

   #[error("Connection failed during {stage}: {message}")]
   ConnectionFailed {
      stage: ConnectStage,
      message: String,
      #[source]
      cause: Option<GattError>,
   },

   #[error("Already connected or connecting")]
   AlreadyConnected,

   #[error("Not connected")]
   NotConnected,

   #[error("Channel not found: {0}")]
   ChannelNotFound(ChannelId),

   #[error("Subscription on {channel} rejected: {reason}")]
   SubscriptionRejected {
      channel: ChannelId,
      reason: RejectReason,
   },

   #[error("Write to {channel} failed: {cause}")]
   WriteFailed {
      channel: ChannelId,
      #[source]
      cause: GattError,
   },

   #[error("Transport has been shut down")]
   TransportShutdown,

   #[error("Invalid configuration: {0}")]
   InvalidConfig(String),

   #[error("I/O error: {0}")]
   Io(#[from] io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl TransportError {
   pub(crate) fn connection(
      stage: ConnectStage,
      message: impl Into<String>,
      cause: Option<GattError>,
   ) -> Self {
      Self::ConnectionFailed {
         stage,
         message: message.into(),
         cause,
      }
   }

   pub(crate) fn selection(message: impl Into<String>, cause: Option<GattError>) -> Self {
      Self::DeviceSelectionFailed {
         message: message.into(),
         cause,
      }
   }

   /// Returns the classification of this error.
   pub fn kind(&self) -> ErrorKind {
      match self {
         Self::DeviceSelectionFailed { .. } => ErrorKind::DeviceSelectionFailed,
         Self::ConnectionFailed { .. }
         | Self::AlreadyConnected
         | Self::NotConnected
         | Self::ChannelNotFound(_)
         | Self::TransportShutdown => ErrorKind::ConnectionFailed,
         Self::SubscriptionRejected { .. } => ErrorKind::SubscriptionRejected,
         Self::WriteFailed { .. } => ErrorKind::WriteFailed,
         Self::InvalidConfig(_)
         | Self::Io(_)
         | Self::ConfigDirNotFound
         | Self::TomlParse(_)
         | Self::TomlSerialize(_) => ErrorKind::Configuration,
      }
   }

   /// Returns a short, user-facing suggestion for recovering from this error.
   pub fn action(&self) -> &'static str {
      match self {
         Self::DeviceSelectionFailed { .. } => {
            "Make sure the robot is powered on and in range, then retry."
         },
         Self::ConnectionFailed { stage, .. } => match stage {
            ConnectStage::Link => "Move closer to the robot and retry the connection.",
            ConnectStage::Service | ConnectStage::Characteristic => {
               "Check that the configured service and characteristic UUIDs match the firmware."
            },
            ConnectStage::Notifications => "Power-cycle the robot and reconnect.",
         },
         Self::AlreadyConnected => "Disconnect before starting a new connection.",
         Self::NotConnected | Self::TransportShutdown => "Connect to a robot first.",
         Self::ChannelNotFound(_) => "Use a channel id listed in the configuration.",
         Self::SubscriptionRejected { reason, .. } => match reason {
            RejectReason::NotConnected => "Connect to a robot before subscribing.",
            RejectReason::ChannelNotRegistered => "Subscribe to a notify channel (id ending in TX).",
         },
         Self::WriteFailed { .. } => "Check the link and send the message again.",
         Self::InvalidConfig(_)
         | Self::Io(_)
         | Self::ConfigDirNotFound
         | Self::TomlParse(_)
         | Self::TomlSerialize(_) => "Fix or remove the configuration file.",
      }
   }
}

/// Convenience type alias for Results with `TransportError`.
pub type Result<T> = std::result::Result<T, TransportError>;
