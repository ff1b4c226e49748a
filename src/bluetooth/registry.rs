//! Channel id → characteristic lookup for one connection.

use log::debug;
use uuid::Uuid;

use crate::{
   bluetooth::gatt::{Characteristic, Peripheral, Service},
   channel::{ChannelId, Direction},
   config::ChannelConfig,
   error::{ConnectStage, Result, TransportError},
};

/// A resolved channel.
#[derive(Debug, Clone)]
pub struct CharacteristicHandle<C> {
   id: ChannelId,
   direction: Direction,
   service: Uuid,
   uuid: Uuid,
   characteristic: C,
}

impl<C: Characteristic> CharacteristicHandle<C> {
   pub const fn id(&self) -> &ChannelId {
      &self.id
   }

   pub const fn direction(&self) -> Direction {
      self.direction
   }

   pub const fn service(&self) -> Uuid {
      self.service
   }

   pub const fn uuid(&self) -> Uuid {
      self.uuid
   }

   pub const fn characteristic(&self) -> &C {
      &self.characteristic
   }

   /// Writes `bytes` without response.
   pub async fn write(&self, bytes: &[u8]) -> Result<()> {
      self
         .characteristic
         .write_without_response(bytes)
         .await
         .map_err(|cause| TransportError::WriteFailed {
            channel: self.id.clone(),
            cause,
         })
   }
}

/// Every channel of the active connection, in configuration order.
#[derive(Debug)]
pub struct CharacteristicRegistry<C> {
   handles: Vec<CharacteristicHandle<C>>,
}

impl<C> Default for CharacteristicRegistry<C> {
   fn default() -> Self {
      Self {
         handles: Vec::new(),
      }
   }
}

impl<C: Characteristic> CharacteristicRegistry<C> {
   /// Resolves every configured service and characteristic on a connected
   /// peer. Fails on the first one that cannot be found.
   pub async fn resolve<P>(peer: &P, config: &ChannelConfig) -> Result<Self>
   where
      P: Peripheral<Characteristic = C>,
   {
      let mut handles = Vec::with_capacity(config.channel_count());

      for service_config in config.services() {
         let service = peer.service(service_config.uuid).await.map_err(|e| {
            TransportError::connection(
               ConnectStage::Service,
               format!("service {} unavailable", service_config.uuid),
               Some(e),
            )
         })?;

         for mapping in &service_config.channels {
            let characteristic = service.characteristic(mapping.uuid).await.map_err(|e| {
               TransportError::connection(
                  ConnectStage::Characteristic,
                  format!("{} ({}) unavailable", mapping.id, mapping.uuid),
                  Some(e),
               )
            })?;

            debug!("{}: resolved {} -> {}", peer.id(), mapping.id, mapping.uuid);
            handles.push(CharacteristicHandle {
               id: mapping.id.clone(),
               direction: mapping.id.direction(),
               service: service_config.uuid,
               uuid: mapping.uuid,
               characteristic,
            });
         }
      }

      Ok(Self { handles })
   }

   pub fn get(&self, id: &ChannelId) -> Option<&CharacteristicHandle<C>> {
      self.handles.iter().find(|h| &h.id == id)
   }

   /// Handle for writing to `id`. Any resolved channel can be written,
   /// whatever its direction.
   pub fn writer(&self, id: &ChannelId) -> Result<CharacteristicHandle<C>> {
      self
         .get(id)
         .cloned()
         .ok_or_else(|| TransportError::ChannelNotFound(id.clone()))
   }

   pub async fn write(&self, id: &ChannelId, bytes: &[u8]) -> Result<()> {
      let handle = self
         .get(id)
         .ok_or_else(|| TransportError::ChannelNotFound(id.clone()))?;
      handle.write(bytes).await
   }

   /// Channels the peer notifies on.
   pub fn receivers(&self) -> impl Iterator<Item = &CharacteristicHandle<C>> {
      self
         .handles
         .iter()
         .filter(|h| h.direction == Direction::Receive)
   }

   pub fn iter(&self) -> impl Iterator<Item = &CharacteristicHandle<C>> {
      self.handles.iter()
   }

   pub fn len(&self) -> usize {
      self.handles.len()
   }

   pub fn is_empty(&self) -> bool {
      self.handles.is_empty()
   }

   pub fn clear(&mut self) {
      self.handles.clear();
   }
}
