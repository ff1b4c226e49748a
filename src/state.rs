//! Link state published by the connection manager.

/// Lifecycle state of the link to the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum LinkState {
   #[default]
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

impl LinkState {
   /// True only in [`LinkState::Connected`].
   pub const fn is_connected(self) -> bool {
      matches!(self, Self::Connected)
   }
}
