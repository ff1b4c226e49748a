//! In-process GATT peripheral.
//!
//! Stands in for a robot in simulations and tests: it serves a fixed set of
//! services, records every write, pushes notifications on demand and can be
//! told to fail at any stage of a connection.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
};

use futures::{
   StreamExt,
   channel::mpsc::{self, UnboundedSender},
};
use log::debug;
use parking_lot::Mutex;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   bluetooth::gatt::{
      Characteristic, GattError, LinkEvents, NotificationStream, Packet, Peripheral, Service,
   },
   config::ChannelConfig,
};

#[derive(Debug, Default)]
struct PeerState {
   services: Vec<(Uuid, Vec<Uuid>)>,
   connected: bool,
   refuse_connections: bool,
   fail_writes: bool,
   broken_notifications: HashSet<Uuid>,
   notifiers: HashMap<Uuid, UnboundedSender<Packet>>,
   link_watchers: Vec<UnboundedSender<()>>,
   writes: Vec<(Uuid, Vec<u8>)>,
   connections: u32,
   disconnections: u32,
}

impl PeerState {
   fn close_link(&mut self) {
      self.connected = false;
      self.notifiers.clear();
      for watcher in self.link_watchers.drain(..) {
         let _ = watcher.unbounded_send(());
      }
   }
}

#[derive(Debug)]
struct PeerInner {
   name: SmolStr,
   state: Mutex<PeerState>,
}

/// Scriptable in-memory peripheral. Clones share the same peer.
#[derive(Debug, Clone)]
pub struct MemoryPeripheral(Arc<PeerInner>);

impl MemoryPeripheral {
   pub fn new(name: impl Into<SmolStr>) -> Self {
      Self(Arc::new(PeerInner {
         name: name.into(),
         state: Mutex::default(),
      }))
   }

   /// Peer serving every service and characteristic named in `config`.
   pub fn from_config(name: impl Into<SmolStr>, config: &ChannelConfig) -> Self {
      config.services().iter().fold(Self::new(name), |peer, service| {
         peer.with_service(service.uuid, service.channels.iter().map(|c| c.uuid))
      })
   }

   pub fn with_service(self, uuid: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
      self
         .0
         .state
         .lock()
         .services
         .push((uuid, characteristics.into_iter().collect()));
      self
   }

   pub fn refuse_connections(&self, refuse: bool) {
      self.0.state.lock().refuse_connections = refuse;
   }

   pub fn fail_writes(&self, fail: bool) {
      self.0.state.lock().fail_writes = fail;
   }

   /// Makes arming notifications on `characteristic` fail.
   pub fn break_notifications(&self, characteristic: Uuid) {
      self
         .0
         .state
         .lock()
         .broken_notifications
         .insert(characteristic);
   }

   /// Pushes one notification. Returns false if nobody has notifications
   /// armed on `characteristic`.
   pub fn notify(&self, characteristic: Uuid, bytes: &[u8]) -> bool {
      let state = self.0.state.lock();
      state
         .notifiers
         .get(&characteristic)
         .is_some_and(|tx| tx.unbounded_send(Packet::from_slice(bytes)).is_ok())
   }

   /// Simulates the robot dropping the link.
   pub fn drop_link(&self) {
      debug!("{}: dropping link", self.0.name);
      self.0.state.lock().close_link();
   }

   pub fn is_connected(&self) -> bool {
      self.0.state.lock().connected
   }

   /// Every write received so far, oldest first.
   pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
      self.0.state.lock().writes.clone()
   }

   pub fn connection_count(&self) -> u32 {
      self.0.state.lock().connections
   }

   pub fn disconnection_count(&self) -> u32 {
      self.0.state.lock().disconnections
   }
}

impl Peripheral for MemoryPeripheral {
   type Service = MemoryService;
   type Characteristic = MemoryCharacteristic;

   fn id(&self) -> SmolStr {
      self.0.name.clone()
   }

   async fn connect(&self) -> Result<(), GattError> {
      let mut state = self.0.state.lock();
      if state.refuse_connections {
         return Err(GattError::Rejected("connection refused".into()));
      }
      state.connected = true;
      state.connections += 1;
      Ok(())
   }

   async fn disconnect(&self) -> Result<(), GattError> {
      let mut state = self.0.state.lock();
      if state.connected {
         state.disconnections += 1;
         state.close_link();
      }
      Ok(())
   }

   async fn link_events(&self) -> Result<LinkEvents, GattError> {
      let (tx, rx) = mpsc::unbounded();
      self.0.state.lock().link_watchers.push(tx);
      Ok(rx.boxed())
   }

   async fn service(&self, uuid: Uuid) -> Result<MemoryService, GattError> {
      let state = self.0.state.lock();
      if !state.connected {
         return Err(GattError::LinkClosed);
      }
      state
         .services
         .iter()
         .find(|(service, _)| *service == uuid)
         .map(|(_, characteristics)| MemoryService {
            peer: self.0.clone(),
            characteristics: characteristics.clone(),
         })
         .ok_or(GattError::ServiceNotFound(uuid))
   }
}

/// A service of a [`MemoryPeripheral`].
#[derive(Debug)]
pub struct MemoryService {
   peer: Arc<PeerInner>,
   characteristics: Vec<Uuid>,
}

impl Service for MemoryService {
   type Characteristic = MemoryCharacteristic;

   async fn characteristic(&self, uuid: Uuid) -> Result<MemoryCharacteristic, GattError> {
      if self.characteristics.contains(&uuid) {
         Ok(MemoryCharacteristic {
            peer: self.peer.clone(),
            uuid,
         })
      } else {
         Err(GattError::CharacteristicNotFound(uuid))
      }
   }
}

/// A characteristic of a [`MemoryPeripheral`].
#[derive(Debug, Clone)]
pub struct MemoryCharacteristic {
   peer: Arc<PeerInner>,
   uuid: Uuid,
}

impl Characteristic for MemoryCharacteristic {
   async fn write_without_response(&self, data: &[u8]) -> Result<(), GattError> {
      let mut state = self.peer.state.lock();
      if !state.connected {
         return Err(GattError::LinkClosed);
      }
      if state.fail_writes {
         return Err(GattError::Rejected("write rejected".into()));
      }
      state.writes.push((self.uuid, data.to_vec()));
      Ok(())
   }

   async fn notify(&self) -> Result<NotificationStream, GattError> {
      let mut state = self.peer.state.lock();
      if !state.connected {
         return Err(GattError::LinkClosed);
      }
      if state.broken_notifications.contains(&self.uuid) {
         return Err(GattError::Rejected("notifications unavailable".into()));
      }
      let (tx, rx) = mpsc::unbounded();
      state.notifiers.insert(self.uuid, tx);
      Ok(rx.boxed())
   }
}
