//! GATT client abstraction.
//!
//! The connection manager only needs a handful of operations from a peer:
//! link up/down, service and characteristic lookup, unacknowledged writes,
//! and notification streams. These traits capture exactly that so BlueZ and
//! the in-memory peer can be driven by the same manager.

use std::future::Future;

use futures::stream::BoxStream;
use smallvec::SmallVec;
use smol_str::SmolStr;
use thiserror::Error;
use uuid::Uuid;

/// One notification payload. BLE notifications rarely exceed the default
/// 20-byte ATT payload, so this stays inline.
pub type Packet = SmallVec<[u8; 32]>;

/// Notifications of one characteristic, in arrival order.
pub type NotificationStream = BoxStream<'static, Packet>;

/// Yields when the link to the peer goes down.
pub type LinkEvents = BoxStream<'static, ()>;

/// Errors raised by a GATT backend.
#[derive(Error, Debug)]
pub enum GattError {
   #[error("BlueZ error: {0}")]
   Bluez(#[from] bluer::Error),

   #[error("Service {0} not found")]
   ServiceNotFound(Uuid),

   #[error("Characteristic {0} not found")]
   CharacteristicNotFound(Uuid),

   #[error("Link closed")]
   LinkClosed,

   #[error("Operation rejected: {0}")]
   Rejected(String),
}

/// A remote device that can be connected to.
pub trait Peripheral: Send + Sync + 'static {
   type Service: Service<Characteristic = Self::Characteristic>;
   type Characteristic: Characteristic;

   /// Identifier used in logs, usually the device address.
   fn id(&self) -> SmolStr;

   /// Brings the link up and waits until services can be looked up.
   fn connect(&self) -> impl Future<Output = Result<(), GattError>> + Send;

   /// Tears the link down.
   fn disconnect(&self) -> impl Future<Output = Result<(), GattError>> + Send;

   /// Stream that fires once the link drops, whoever initiated it.
   fn link_events(&self) -> impl Future<Output = Result<LinkEvents, GattError>> + Send;

   /// Looks up a primary service.
   fn service(&self, uuid: Uuid) -> impl Future<Output = Result<Self::Service, GattError>> + Send;
}

/// A resolved primary service.
pub trait Service: Send + Sync + 'static {
   type Characteristic: Characteristic;

   fn characteristic(
      &self,
      uuid: Uuid,
   ) -> impl Future<Output = Result<Self::Characteristic, GattError>> + Send;
}

/// A resolved characteristic. Cheap to clone.
pub trait Characteristic: Clone + Send + Sync + 'static {
   /// Writes without waiting for an ATT response.
   fn write_without_response(
      &self,
      data: &[u8],
   ) -> impl Future<Output = Result<(), GattError>> + Send;

   /// Arms notifications. Dropping the stream disarms them.
   fn notify(&self) -> impl Future<Output = Result<NotificationStream, GattError>> + Send;
}
