//! Framed JSON message transport to line-follower robots over BLE GATT.
//!
//! Text goes out as unacknowledged characteristic writes; the robot answers
//! with notifications carrying NUL-terminated JSON messages, which are
//! reassembled per channel and fanned out to subscribers.

pub mod bluetooth;
pub mod channel;
pub mod config;
pub mod error;
pub mod framing;
pub mod state;

pub use bluetooth::{
   bluez::BluezPeripheral,
   discovery::select_device,
   gatt::{Characteristic, GattError, Peripheral, Service},
   manager::{ConnectionManager, Subscription},
   memory::MemoryPeripheral,
   registry::{CharacteristicHandle, CharacteristicRegistry},
};
pub use channel::{ChannelId, Direction};
pub use config::{ChannelConfig, Config};
pub use error::{ErrorKind, Result, TransportError};
pub use framing::{
   assembler::FrameAssembler,
   codec::{Codec, TextEncoding},
   hub::{ObserverHub, Subscriber, SubscriptionId},
};
pub use state::LinkState;
