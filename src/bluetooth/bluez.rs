//! BlueZ backend for the GATT client traits.

use bluer::{
   Device, DeviceEvent, DeviceProperty,
   gatt::{
      WriteOp,
      remote::{self, CharacteristicWriteRequest},
   },
};
use futures::StreamExt;
use log::debug;
use smol_str::{SmolStr, ToSmolStr};
use uuid::Uuid;

use crate::bluetooth::gatt::{
   Characteristic, GattError, LinkEvents, NotificationStream, Packet, Peripheral, Service,
};

/// A BlueZ device used as a GATT peripheral.
#[derive(Debug, Clone)]
pub struct BluezPeripheral {
   device: Device,
}

impl BluezPeripheral {
   pub const fn new(device: Device) -> Self {
      Self { device }
   }

   pub fn address(&self) -> bluer::Address {
      self.device.address()
   }

   async fn wait_services_resolved(&self) -> Result<(), GattError> {
      // Subscribe before checking so the transition cannot be missed
      let mut events = self.device.events().await?;
      if self.device.is_services_resolved().await? {
         return Ok(());
      }

      debug!("{}: waiting for service discovery", self.address());
      while let Some(event) = events.next().await {
         match event {
            DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true)) => return Ok(()),
            DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => {
               return Err(GattError::LinkClosed);
            },
            _ => {},
         }
      }
      Err(GattError::LinkClosed)
   }
}

impl Peripheral for BluezPeripheral {
   type Service = BluezService;
   type Characteristic = BluezCharacteristic;

   fn id(&self) -> SmolStr {
      self.device.address().to_smolstr()
   }

   async fn connect(&self) -> Result<(), GattError> {
      if !self.device.is_connected().await? {
         self.device.connect().await?;
      }
      self.wait_services_resolved().await
   }

   async fn disconnect(&self) -> Result<(), GattError> {
      self.device.disconnect().await?;
      Ok(())
   }

   async fn link_events(&self) -> Result<LinkEvents, GattError> {
      let events = self.device.events().await?;
      Ok(events
         .filter_map(|event| async move {
            matches!(
               event,
               DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))
            )
            .then_some(())
         })
         .boxed())
   }

   async fn service(&self, uuid: Uuid) -> Result<BluezService, GattError> {
      for service in self.device.services().await? {
         if service.uuid().await? == uuid {
            return Ok(BluezService { inner: service });
         }
      }
      Err(GattError::ServiceNotFound(uuid))
   }
}

/// A primary service on a BlueZ device.
#[derive(Debug, Clone)]
pub struct BluezService {
   inner: remote::Service,
}

impl Service for BluezService {
   type Characteristic = BluezCharacteristic;

   async fn characteristic(&self, uuid: Uuid) -> Result<BluezCharacteristic, GattError> {
      for characteristic in self.inner.characteristics().await? {
         if characteristic.uuid().await? == uuid {
            return Ok(BluezCharacteristic {
               inner: characteristic,
            });
         }
      }
      Err(GattError::CharacteristicNotFound(uuid))
   }
}

/// A characteristic on a BlueZ device.
#[derive(Debug, Clone)]
pub struct BluezCharacteristic {
   inner: remote::Characteristic,
}

impl Characteristic for BluezCharacteristic {
   async fn write_without_response(&self, data: &[u8]) -> Result<(), GattError> {
      let mut request = CharacteristicWriteRequest::default();
      request.op_type = WriteOp::Command;
      self.inner.write_ext(data, &request).await?;
      Ok(())
   }

   async fn notify(&self) -> Result<NotificationStream, GattError> {
      let stream = self.inner.notify().await?;
      Ok(stream.map(Packet::from_vec).boxed())
   }
}
