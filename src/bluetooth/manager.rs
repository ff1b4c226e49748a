//! Connection manager for a single GATT peer.
//!
//! A [`ConnectionManager`] is a cheap handle to an actor task that owns every
//! per-connection table: the characteristic registry, one frame assembler
//! per notify channel and the subscription hub. Notification pumps and the
//! link watcher run as separate tasks and feed the actor through a loopback
//! channel, so packets, lifecycle transitions and subscriber callbacks are
//! all handled one at a time, in arrival order.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use tokio::{
   select,
   sync::{mpsc, oneshot, watch},
   task::JoinSet,
   time,
};

use crate::{
   bluetooth::{
      gatt::{Characteristic, LinkEvents, NotificationStream, Packet, Peripheral},
      registry::{CharacteristicHandle, CharacteristicRegistry},
   },
   channel::ChannelId,
   config::ChannelConfig,
   error::{ConnectStage, RejectReason, Result, TransportError},
   framing::{
      assembler::FrameAssembler,
      codec::Codec,
      hub::{ObserverHub, Subscriber, SubscriptionId},
   },
   state::LinkState,
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;
/// Maximum time to wait for the link to drop when the manager shuts down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// === Commands ===

enum ManagerCommand<P: Peripheral> {
   Connect {
      device: P,
      config: ChannelConfig,
      reply: oneshot::Sender<Result<()>>,
   },
   Disconnect(oneshot::Sender<()>),
   Writer(
      ChannelId,
      oneshot::Sender<Result<CharacteristicHandle<P::Characteristic>>>,
   ),
   Subscribe {
      channel: ChannelId,
      id: Option<SubscriptionId>,
      subscriber: Subscriber,
      reply: oneshot::Sender<Result<SubscriptionId>>,
   },
   Unsubscribe {
      channel: ChannelId,
      id: SubscriptionId,
      reply: oneshot::Sender<bool>,
   },
   CountSubscriptions(ChannelId, oneshot::Sender<usize>),
}

/// Events produced by tasks the actor spawned. Each carries the generation
/// of the connection attempt it belongs to.
enum ManagerEvent<P: Peripheral> {
   Established {
      generation: u64,
      link: Link<P>,
      reply: oneshot::Sender<Result<()>>,
   },
   EstablishFailed {
      generation: u64,
      error: TransportError,
      reply: oneshot::Sender<Result<()>>,
   },
   Notification {
      generation: u64,
      channel: ChannelId,
      packet: Packet,
   },
   PeerDisconnected {
      generation: u64,
   },
   TeardownComplete {
      generation: u64,
   },
}

/// A fully prepared link, handed from the connect task to the actor.
struct Link<P: Peripheral> {
   device: Arc<P>,
   registry: CharacteristicRegistry<P::Characteristic>,
   streams: Vec<(ChannelId, NotificationStream)>,
   link_events: LinkEvents,
}

/// Per-connection tables. Dropping this aborts every pump task.
struct Connection<P: Peripheral> {
   device: Arc<P>,
   registry: CharacteristicRegistry<P::Characteristic>,
   assemblers: HashMap<ChannelId, FrameAssembler>,
   hub: ObserverHub,
   tasks: JoinSet<()>,
}

// === Main Manager ===

/// Handle to the connection actor.
///
/// Clones share the same actor; the actor stops, disconnecting the peer if
/// needed, once every handle is dropped.
pub struct ConnectionManager<P: Peripheral> {
   inbox: mpsc::Sender<ManagerCommand<P>>,
   state: watch::Receiver<LinkState>,
   codec: Codec,
}

impl<P: Peripheral> Clone for ConnectionManager<P> {
   fn clone(&self) -> Self {
      Self {
         inbox: self.inbox.clone(),
         state: self.state.clone(),
         codec: self.codec,
      }
   }
}

impl<P: Peripheral> fmt::Debug for ConnectionManager<P> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ConnectionManager")
         .field("state", &*self.state.borrow())
         .field("codec", &self.codec)
         .finish_non_exhaustive()
   }
}

impl<P: Peripheral> ConnectionManager<P> {
   /// Spawns the actor on the current tokio runtime.
   pub fn new(codec: Codec) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
      tokio::spawn(ManagerActor::new(codec, command_rx, state_tx).run());
      Self {
         inbox: command_tx,
         state: state_rx,
         codec,
      }
   }

   pub const fn codec(&self) -> Codec {
      self.codec
   }

   /// Connects to `device` and prepares every channel in `config`.
   ///
   /// Resolves once all characteristics are found and every notify channel
   /// has notifications armed. On failure nothing is left behind and the
   /// manager is back in [`LinkState::Disconnected`]. A config with no
   /// channels or a repeated channel id is refused before the device is
   /// touched.
   pub async fn connect(&self, device: P, config: ChannelConfig) -> Result<()> {
      config.validate()?;
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Connect {
            device,
            config,
            reply: tx,
         })
         .await
         .map_err(|_| TransportError::TransportShutdown)?;
      rx.await.map_err(|_| TransportError::TransportShutdown)?
   }

   /// Tears the link down and drops every subscription. Does nothing when
   /// already disconnected.
   pub async fn disconnect(&self) {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::Disconnect(tx))
         .await
         .is_err()
      {
         return;
      }
      let _ = rx.await;
   }

   pub fn connected(&self) -> bool {
      self.state().is_connected()
   }

   pub fn state(&self) -> LinkState {
      *self.state.borrow()
   }

   /// Receiver that observes every link state change.
   pub fn watch_state(&self) -> watch::Receiver<LinkState> {
      self.state.clone()
   }

   /// Encodes `text` and writes it to `channel` without response.
   pub async fn send(&self, channel: impl Into<ChannelId>, text: &str) -> Result<()> {
      let channel = channel.into();
      let handle = self.writer(channel).await?;
      let bytes = self.codec.encode(text);
      debug!("→ {}: {}", handle.id(), hex::encode(&bytes));
      handle.write(&bytes).await
   }

   async fn writer(&self, channel: ChannelId) -> Result<CharacteristicHandle<P::Characteristic>> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Writer(channel, tx))
         .await
         .map_err(|_| TransportError::TransportShutdown)?;
      rx.await.map_err(|_| TransportError::TransportShutdown)?
   }

   /// Subscribes `callback` to JSON messages on a notify channel.
   ///
   /// Passing an `id` already in use on the channel replaces that
   /// subscription's callback.
   pub async fn add_subscription<T, F>(
      &self,
      channel: impl Into<ChannelId>,
      callback: F,
      id: Option<SubscriptionId>,
   ) -> Result<Subscription<P>>
   where
      T: DeserializeOwned,
      F: FnMut(T) + Send + 'static,
   {
      self.subscribe_with(channel, Subscriber::json(callback), id).await
   }

   /// Like [`add_subscription`](Self::add_subscription) with a prebuilt
   /// [`Subscriber`].
   pub async fn subscribe_with(
      &self,
      channel: impl Into<ChannelId>,
      subscriber: Subscriber,
      id: Option<SubscriptionId>,
   ) -> Result<Subscription<P>> {
      let channel = channel.into();
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Subscribe {
            channel: channel.clone(),
            id,
            subscriber,
            reply: tx,
         })
         .await
         .map_err(|_| TransportError::TransportShutdown)?;
      let id = rx.await.map_err(|_| TransportError::TransportShutdown)??;
      Ok(Subscription {
         id,
         channel,
         manager: self.clone(),
      })
   }

   /// Removes a subscription. Returns whether it existed.
   pub async fn remove_subscription(&self, id: &SubscriptionId, channel: &ChannelId) -> bool {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::Unsubscribe {
            channel: channel.clone(),
            id: id.clone(),
            reply: tx,
         })
         .await
         .is_err()
      {
         return false;
      }
      rx.await.unwrap_or_default()
   }

   /// Number of live subscriptions on `channel`.
   pub async fn subscription_count(&self, channel: &ChannelId) -> usize {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::CountSubscriptions(channel.clone(), tx))
         .await
         .is_err()
      {
         return 0;
      }
      rx.await.unwrap_or_default()
   }
}

/// Receipt for an active subscription.
///
/// Dropping it leaves the subscription in place; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription<P: Peripheral> {
   id: SubscriptionId,
   channel: ChannelId,
   manager: ConnectionManager<P>,
}

impl<P: Peripheral> Subscription<P> {
   pub const fn id(&self) -> &SubscriptionId {
      &self.id
   }

   pub const fn channel(&self) -> &ChannelId {
      &self.channel
   }

   pub async fn unsubscribe(self) -> bool {
      self.manager.remove_subscription(&self.id, &self.channel).await
   }
}

impl<P: Peripheral> fmt::Debug for Subscription<P> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Subscription")
         .field("id", &self.id)
         .field("channel", &self.channel)
         .finish()
   }
}

// === Connect Task ===

async fn establish<P: Peripheral>(device: Arc<P>, config: ChannelConfig) -> Result<Link<P>> {
   device.connect().await.map_err(|e| {
      TransportError::connection(
         ConnectStage::Link,
         format!("could not connect to {}", device.id()),
         Some(e),
      )
   })?;

   match prepare(&device, &config).await {
      Ok(link) => Ok(link),
      Err(e) => {
         // Roll back the half-built connection
         if let Err(err) = device.disconnect().await {
            warn!("{}: disconnect after failed setup: {err}", device.id());
         }
         Err(e)
      },
   }
}

async fn prepare<P: Peripheral>(device: &Arc<P>, config: &ChannelConfig) -> Result<Link<P>> {
   let link_events = device.link_events().await.map_err(|e| {
      TransportError::connection(ConnectStage::Link, "could not watch link state", Some(e))
   })?;

   let registry = CharacteristicRegistry::resolve(device.as_ref(), config).await?;

   let mut streams = Vec::new();
   for handle in registry.receivers() {
      let stream = handle.characteristic().notify().await.map_err(|e| {
         TransportError::connection(
            ConnectStage::Notifications,
            format!("could not enable notifications on {}", handle.id()),
            Some(e),
         )
      })?;
      streams.push((handle.id().clone(), stream));
   }

   Ok(Link {
      device: device.clone(),
      registry,
      streams,
      link_events,
   })
}

// === Manager Actor ===

struct ManagerActor<P: Peripheral> {
   codec: Codec,
   command_rx: mpsc::Receiver<ManagerCommand<P>>,
   loopback_rx: mpsc::Receiver<ManagerEvent<P>>,
   loopback_tx: mpsc::Sender<ManagerEvent<P>>,
   state_tx: watch::Sender<LinkState>,

   // State
   generation: u64,
   connection: Option<Connection<P>>,
   disconnect_waiters: Vec<oneshot::Sender<()>>,
}

impl<P: Peripheral> ManagerActor<P> {
   fn new(
      codec: Codec,
      command_rx: mpsc::Receiver<ManagerCommand<P>>,
      state_tx: watch::Sender<LinkState>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         codec,
         command_rx,
         loopback_rx,
         loopback_tx,
         state_tx,
         generation: 0,
         connection: None,
         disconnect_waiters: Vec::new(),
      }
   }

   async fn run(mut self) {
      debug!("Connection manager starting up");

      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  debug!("Connection manager shutting down");
                  break;
               };
               self.handle_command(cmd);
            }
            Some(event) = self.loopback_rx.recv() => {
               self.handle_event(event);
            }
         }
      }

      self.cleanup().await;
   }

   fn state(&self) -> LinkState {
      *self.state_tx.borrow()
   }

   fn set_state(&self, state: LinkState) {
      self.state_tx.send_if_modified(|current| {
         if *current == state {
            return false;
         }
         debug!("Link state: {current} -> {state}");
         *current = state;
         true
      });
   }

   fn handle_command(&mut self, cmd: ManagerCommand<P>) {
      match cmd {
         ManagerCommand::Connect {
            device,
            config,
            reply,
         } => {
            self.handle_connect(device, config, reply);
         },
         ManagerCommand::Disconnect(reply) => {
            self.handle_disconnect(reply);
         },
         ManagerCommand::Writer(channel, reply) => {
            let result = match &self.connection {
               Some(connection) if self.state() == LinkState::Connected => {
                  connection.registry.writer(&channel)
               },
               _ => Err(TransportError::NotConnected),
            };
            let _ = reply.send(result);
         },
         ManagerCommand::Subscribe {
            channel,
            id,
            subscriber,
            reply,
         } => {
            let connected = self.state() == LinkState::Connected;
            let result = match &mut self.connection {
               Some(connection) if connected => {
                  connection.hub.subscribe(&channel, id, subscriber)
               },
               _ => Err(TransportError::SubscriptionRejected {
                  channel,
                  reason: RejectReason::NotConnected,
               }),
            };
            let _ = reply.send(result);
         },
         ManagerCommand::Unsubscribe { channel, id, reply } => {
            let removed = self
               .connection
               .as_mut()
               .is_some_and(|c| c.hub.unsubscribe(&id, &channel));
            let _ = reply.send(removed);
         },
         ManagerCommand::CountSubscriptions(channel, reply) => {
            let count = self
               .connection
               .as_ref()
               .map_or(0, |c| c.hub.subscription_count(&channel));
            let _ = reply.send(count);
         },
      }
   }

   fn handle_event(&mut self, event: ManagerEvent<P>) {
      match event {
         ManagerEvent::Established {
            generation,
            link,
            reply,
         } => {
            self.handle_established(generation, link, reply);
         },
         ManagerEvent::EstablishFailed {
            generation,
            error,
            reply,
         } => {
            if generation == self.generation {
               error!("Connection failed: {error}");
               self.settle_disconnected();
            }
            let _ = reply.send(Err(error));
         },
         ManagerEvent::Notification {
            generation,
            channel,
            packet,
         } => {
            self.handle_notification(generation, &channel, &packet);
         },
         ManagerEvent::PeerDisconnected { generation } => {
            if generation == self.generation && self.state() == LinkState::Connected {
               warn!("Peer closed the link");
               self.settle_disconnected();
            }
         },
         ManagerEvent::TeardownComplete { generation } => {
            if generation == self.generation && self.state() == LinkState::Disconnecting {
               info!("Disconnected");
               self.settle_disconnected();
            }
         },
      }
   }

   fn handle_connect(
      &mut self,
      device: P,
      config: ChannelConfig,
      reply: oneshot::Sender<Result<()>>,
   ) {
      if self.state() != LinkState::Disconnected {
         let _ = reply.send(Err(TransportError::AlreadyConnected));
         return;
      }

      self.generation += 1;
      self.set_state(LinkState::Connecting);
      info!("Connecting to {}", device.id());

      let generation = self.generation;
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let event = match establish(Arc::new(device), config).await {
            Ok(link) => ManagerEvent::Established {
               generation,
               link,
               reply,
            },
            Err(error) => ManagerEvent::EstablishFailed {
               generation,
               error,
               reply,
            },
         };
         if loopback.send(event).await.is_err() {
            warn!("Connection manager gone before connect completed");
         }
      });
   }

   fn handle_established(
      &mut self,
      generation: u64,
      link: Link<P>,
      reply: oneshot::Sender<Result<()>>,
   ) {
      if generation != self.generation || self.state() != LinkState::Connecting {
         // Disconnect was requested while the link was coming up
         info!("Connect to {} cancelled", link.device.id());
         self.spawn_teardown(generation, link.device);
         let _ = reply.send(Err(TransportError::connection(
            ConnectStage::Link,
            "cancelled by disconnect",
            None,
         )));
         return;
      }

      let Link {
         device,
         registry,
         streams,
         mut link_events,
      } = link;

      let mut connection = Connection {
         device,
         registry,
         assemblers: HashMap::new(),
         hub: ObserverHub::new(),
         tasks: JoinSet::new(),
      };

      for (channel, mut stream) in streams {
         connection
            .assemblers
            .insert(channel.clone(), FrameAssembler::new());
         connection.hub.register_channel(channel.clone());

         let loopback = self.loopback_tx.clone();
         connection.tasks.spawn(async move {
            while let Some(packet) = stream.next().await {
               let event = ManagerEvent::Notification {
                  generation,
                  channel: channel.clone(),
                  packet,
               };
               if loopback.send(event).await.is_err() {
                  return;
               }
            }
            debug!("{channel}: notification stream ended");
         });
      }

      let loopback = self.loopback_tx.clone();
      connection.tasks.spawn(async move {
         // Either an explicit event or the end of the stream means the link is gone
         let _ = link_events.next().await;
         let _ = loopback
            .send(ManagerEvent::PeerDisconnected { generation })
            .await;
      });

      info!(
         "Connected to {} ({} channels)",
         connection.device.id(),
         connection.registry.len()
      );
      self.connection = Some(connection);
      self.set_state(LinkState::Connected);
      let _ = reply.send(Ok(()));
   }

   fn handle_notification(&mut self, generation: u64, channel: &ChannelId, packet: &[u8]) {
      if generation != self.generation || self.state() != LinkState::Connected {
         debug!("{channel}: dropping stale notification");
         return;
      }
      let Some(connection) = self.connection.as_mut() else {
         return;
      };

      debug!("← {channel}: {}", hex::encode(packet));
      let text = self.codec.decode(packet);
      let Some(assembler) = connection.assemblers.get_mut(channel) else {
         warn!("{channel}: notification on unknown channel");
         return;
      };
      if let Some(message) = assembler.feed(&text) {
         let delivered = connection.hub.deliver(channel, &message);
         debug!("{channel}: message delivered to {delivered} subscriber(s)");
      }
   }

   fn handle_disconnect(&mut self, reply: oneshot::Sender<()>) {
      match self.state() {
         LinkState::Disconnected => {
            let _ = reply.send(());
         },
         LinkState::Connecting => {
            // Completion of the connect task finishes the teardown
            self.set_state(LinkState::Disconnecting);
            self.disconnect_waiters.push(reply);
         },
         LinkState::Connected => {
            self.set_state(LinkState::Disconnecting);
            self.disconnect_waiters.push(reply);
            if let Some(connection) = self.connection.take() {
               info!("Disconnecting from {}", connection.device.id());
               self.spawn_teardown(self.generation, connection.device.clone());
            } else {
               self.settle_disconnected();
            }
         },
         LinkState::Disconnecting => {
            self.disconnect_waiters.push(reply);
         },
      }
   }

   fn spawn_teardown(&self, generation: u64, device: Arc<P>) {
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         if let Err(e) = device.disconnect().await {
            warn!("{}: disconnect failed: {e}", device.id());
         }
         let _ = loopback
            .send(ManagerEvent::TeardownComplete { generation })
            .await;
      });
   }

   /// Drops every per-connection table and wakes pending `disconnect` calls.
   fn settle_disconnected(&mut self) {
      self.connection = None;
      self.set_state(LinkState::Disconnected);
      for waiter in self.disconnect_waiters.drain(..) {
         let _ = waiter.send(());
      }
   }

   async fn cleanup(&mut self) {
      debug!("Cleaning up connection manager");
      if let Some(connection) = self.connection.take() {
         let device = connection.device.clone();
         drop(connection);
         match time::timeout(SHUTDOWN_TIMEOUT, device.disconnect()).await {
            Ok(Err(e)) => warn!("{}: disconnect on shutdown failed: {e}", device.id()),
            Err(_) => warn!("{}: disconnect on shutdown timed out", device.id()),
            Ok(Ok(())) => {},
         }
      }
      self.settle_disconnected();
   }
}

#[cfg(test)]
mod tests {
   use parking_lot::Mutex;
   use serde_json::{Value, json};
   use uuid::Uuid;

   use super::*;
   use crate::{
      bluetooth::memory::MemoryPeripheral,
      config::{NUS_RX, NUS_SERVICE, NUS_TX},
      error::ErrorKind,
   };

   const WAIT: Duration = Duration::from_secs(2);

   type Log = Arc<Mutex<Vec<Value>>>;

   fn uart_peer() -> MemoryPeripheral {
      MemoryPeripheral::from_config("TT_test", &ChannelConfig::uart())
   }

   async fn connected() -> (ConnectionManager<MemoryPeripheral>, MemoryPeripheral) {
      let peer = uart_peer();
      let manager = ConnectionManager::new(Codec::default());
      manager
         .connect(peer.clone(), ChannelConfig::uart())
         .await
         .unwrap();
      (manager, peer)
   }

   async fn wait_for_state(manager: &ConnectionManager<MemoryPeripheral>, state: LinkState) {
      let mut rx = manager.watch_state();
      time::timeout(WAIT, rx.wait_for(|s| *s == state))
         .await
         .expect("state change timed out")
         .unwrap();
   }

   async fn wait_for_len(log: &Log, len: usize) {
      time::timeout(WAIT, async {
         while log.lock().len() < len {
            time::sleep(Duration::from_millis(5)).await;
         }
      })
      .await
      .expect("messages not delivered in time");
   }

   async fn record(manager: &ConnectionManager<MemoryPeripheral>) -> (Subscription<MemoryPeripheral>, Log) {
      let log: Log = Arc::default();
      let sink = log.clone();
      let subscription = manager
         .add_subscription("UART_TX", move |value: Value| sink.lock().push(value), None)
         .await
         .unwrap();
      (subscription, log)
   }

   #[tokio::test]
   async fn test_connect_then_send() {
      let (manager, peer) = connected().await;
      assert!(manager.connected());
      assert_eq!(manager.state(), LinkState::Connected);

      manager.send("UART_RX", "PING").await.unwrap();
      assert_eq!(peer.writes(), vec![(NUS_RX, b"PING".to_vec())]);
   }

   #[tokio::test]
   async fn test_send_to_unknown_channel_writes_nothing() {
      let (manager, peer) = connected().await;
      let err = manager.send("NOPE_RX", "PING").await.unwrap_err();
      assert!(matches!(err, TransportError::ChannelNotFound(_)));
      assert!(peer.writes().is_empty());
   }

   #[tokio::test]
   async fn test_send_requires_connection() {
      let manager = ConnectionManager::<MemoryPeripheral>::new(Codec::default());
      let err = manager.send("UART_RX", "PING").await.unwrap_err();
      assert!(matches!(err, TransportError::NotConnected));
      assert!(!manager.connected());
   }

   #[tokio::test]
   async fn test_write_failure_is_reported() {
      let (manager, peer) = connected().await;
      peer.fail_writes(true);
      let err = manager.send("UART_RX", "PING").await.unwrap_err();
      assert_eq!(err.kind(), ErrorKind::WriteFailed);
      assert!(manager.connected());
   }

   #[tokio::test]
   async fn test_message_split_across_packets_reaches_all_subscribers() {
      let (manager, peer) = connected().await;
      let (_first, first) = record(&manager).await;
      let (_second, second) = record(&manager).await;

      assert!(peer.notify(NUS_TX, br#"{"a":1"#));
      assert!(peer.notify(NUS_TX, b"}\0"));

      wait_for_len(&first, 1).await;
      wait_for_len(&second, 1).await;
      assert_eq!(*first.lock(), vec![json!({"a": 1})]);
      assert_eq!(*second.lock(), vec![json!({"a": 1})]);
   }

   #[tokio::test]
   async fn test_messages_arrive_in_order() {
      let (manager, peer) = connected().await;
      let (_subscription, log) = record(&manager).await;

      peer.notify(NUS_TX, b"1\0");
      peer.notify(NUS_TX, b"2\0");
      peer.notify(NUS_TX, b"3\0");

      wait_for_len(&log, 3).await;
      assert_eq!(*log.lock(), vec![json!(1), json!(2), json!(3)]);
   }

   #[tokio::test]
   async fn test_subscribe_before_connect_is_rejected() {
      let manager = ConnectionManager::<MemoryPeripheral>::new(Codec::default());
      let err = manager
         .add_subscription("UART_TX", |_: Value| {}, None)
         .await
         .unwrap_err();
      assert!(matches!(
         err,
         TransportError::SubscriptionRejected {
            reason: RejectReason::NotConnected,
            ..
         }
      ));
   }

   #[tokio::test]
   async fn test_subscribe_to_write_channel_is_rejected() {
      let (manager, _peer) = connected().await;
      let err = manager
         .add_subscription("UART_RX", |_: Value| {}, None)
         .await
         .unwrap_err();
      assert!(matches!(
         err,
         TransportError::SubscriptionRejected {
            reason: RejectReason::ChannelNotRegistered,
            ..
         }
      ));
   }

   #[tokio::test]
   async fn test_unsubscribe_stops_delivery() {
      let (manager, peer) = connected().await;
      let (subscription, log) = record(&manager).await;
      let (id, channel) = (subscription.id().clone(), subscription.channel().clone());

      assert!(subscription.unsubscribe().await);
      assert!(!manager.remove_subscription(&id, &channel).await);
      assert_eq!(manager.subscription_count(&channel).await, 0);

      peer.notify(NUS_TX, b"1\0");
      time::sleep(Duration::from_millis(50)).await;
      assert!(log.lock().is_empty());
   }

   #[tokio::test]
   async fn test_explicit_id_replaces_subscription() {
      let (manager, peer) = connected().await;
      let old: Log = Arc::default();
      let new: Log = Arc::default();
      let id = SubscriptionId::from("telemetry");

      let sink = old.clone();
      manager
         .add_subscription("UART_TX", move |v: Value| sink.lock().push(v), Some(id.clone()))
         .await
         .unwrap();
      let sink = new.clone();
      let subscription = manager
         .add_subscription("UART_TX", move |v: Value| sink.lock().push(v), Some(id.clone()))
         .await
         .unwrap();
      assert_eq!(subscription.id(), &id);
      assert_eq!(manager.subscription_count(&ChannelId::from("UART_TX")).await, 1);

      peer.notify(NUS_TX, b"true\0");
      wait_for_len(&new, 1).await;
      assert!(old.lock().is_empty());
   }

   #[tokio::test]
   async fn test_peer_drop_discards_partial_message() {
      let (manager, peer) = connected().await;
      let (_subscription, log) = record(&manager).await;

      peer.notify(NUS_TX, br#"{"stale":"#);
      peer.drop_link();
      wait_for_state(&manager, LinkState::Disconnected).await;
      assert_eq!(manager.subscription_count(&ChannelId::from("UART_TX")).await, 0);

      manager
         .connect(peer.clone(), ChannelConfig::uart())
         .await
         .unwrap();
      let (_subscription, log2) = record(&manager).await;
      peer.notify(NUS_TX, b"{\"fresh\":true}\0");

      wait_for_len(&log2, 1).await;
      assert_eq!(*log2.lock(), vec![json!({"fresh": true})]);
      assert!(log.lock().is_empty());
   }

   #[tokio::test]
   async fn test_disconnect_discards_partial_message() {
      let (manager, peer) = connected().await;
      let (_subscription, log) = record(&manager).await;

      peer.notify(NUS_TX, br#"{"stale":"#);
      manager.disconnect().await;
      assert_eq!(manager.state(), LinkState::Disconnected);

      manager
         .connect(peer.clone(), ChannelConfig::uart())
         .await
         .unwrap();
      let (_subscription, fresh) = record(&manager).await;
      peer.notify(NUS_TX, b"{\"fresh\":true}\0");

      wait_for_len(&fresh, 1).await;
      assert_eq!(*fresh.lock(), vec![json!({"fresh": true})]);
      assert!(log.lock().is_empty());
   }

   #[tokio::test]
   async fn test_duplicate_channel_ids_are_refused() {
      let second_service = Uuid::from_u128(0x3a8328fc_3768_46d2_b371_b34864ce8025);
      let second_tx = Uuid::from_u128(0x3a8328fd_3768_46d2_b371_b34864ce8025);
      let config = ChannelConfig::uart().with_service(second_service, [("UART_TX", second_tx)]);
      let peer = MemoryPeripheral::from_config("TT_test", &config);
      let manager = ConnectionManager::new(Codec::default());

      let err = manager.connect(peer.clone(), config).await.unwrap_err();
      assert!(matches!(err, TransportError::InvalidConfig(_)));
      assert_eq!(manager.state(), LinkState::Disconnected);
      assert_eq!(peer.connection_count(), 0);
   }

   #[tokio::test]
   async fn test_panicking_subscriber_keeps_link_usable() {
      let (manager, peer) = connected().await;
      manager
         .subscribe_with("UART_TX", Subscriber::raw(|_| panic!("subscriber bug")), None)
         .await
         .unwrap();
      let (_subscription, log) = record(&manager).await;

      peer.notify(NUS_TX, b"1\0");
      wait_for_len(&log, 1).await;
      assert!(manager.connected());

      manager.send("UART_RX", "PING").await.unwrap();
      assert_eq!(peer.writes(), vec![(NUS_RX, b"PING".to_vec())]);

      manager.disconnect().await;
      assert!(!manager.connected());
      assert!(!peer.is_connected());
   }

   #[tokio::test]
   async fn test_disconnect_is_idempotent() {
      let (manager, peer) = connected().await;
      manager.disconnect().await;
      assert_eq!(manager.state(), LinkState::Disconnected);
      assert!(!peer.is_connected());

      manager.disconnect().await;
      assert_eq!(manager.state(), LinkState::Disconnected);
      assert_eq!(peer.disconnection_count(), 1);

      let err = manager.send("UART_RX", "PING").await.unwrap_err();
      assert!(matches!(err, TransportError::NotConnected));
   }

   #[tokio::test]
   async fn test_disconnect_never_connected_is_noop() {
      let manager = ConnectionManager::<MemoryPeripheral>::new(Codec::default());
      manager.disconnect().await;
      assert_eq!(manager.state(), LinkState::Disconnected);
   }

   #[tokio::test]
   async fn test_missing_characteristic_rolls_back() {
      let peer = MemoryPeripheral::new("TT_test").with_service(NUS_SERVICE, [NUS_RX]);
      let manager = ConnectionManager::new(Codec::default());

      let err = manager
         .connect(peer.clone(), ChannelConfig::uart())
         .await
         .unwrap_err();
      assert!(matches!(
         err,
         TransportError::ConnectionFailed {
            stage: ConnectStage::Characteristic,
            ..
         }
      ));
      assert_eq!(manager.state(), LinkState::Disconnected);
      assert!(!peer.is_connected());
   }

   #[tokio::test]
   async fn test_notification_failure_names_stage() {
      let peer = uart_peer();
      peer.break_notifications(NUS_TX);
      let manager = ConnectionManager::new(Codec::default());

      let err = manager
         .connect(peer.clone(), ChannelConfig::uart())
         .await
         .unwrap_err();
      assert!(matches!(
         err,
         TransportError::ConnectionFailed {
            stage: ConnectStage::Notifications,
            ..
         }
      ));
      assert!(!manager.connected());
      assert!(!peer.is_connected());
   }

   #[tokio::test]
   async fn test_refused_link_names_stage() {
      let peer = uart_peer();
      peer.refuse_connections(true);
      let manager = ConnectionManager::new(Codec::default());

      let err = manager.connect(peer, ChannelConfig::uart()).await.unwrap_err();
      assert!(matches!(
         err,
         TransportError::ConnectionFailed {
            stage: ConnectStage::Link,
            ..
         }
      ));
      assert_eq!(manager.state(), LinkState::Disconnected);
   }

   #[tokio::test]
   async fn test_second_connect_is_rejected() {
      let (manager, _peer) = connected().await;
      let err = manager
         .connect(uart_peer(), ChannelConfig::uart())
         .await
         .unwrap_err();
      assert!(matches!(err, TransportError::AlreadyConnected));
      assert!(manager.connected());
   }

   #[tokio::test]
   async fn test_latin1_manager_decodes_bytes_as_chars() {
      let peer = uart_peer();
      let manager = ConnectionManager::new(Codec::new(crate::framing::codec::TextEncoding::Latin1));
      manager
         .connect(peer.clone(), ChannelConfig::uart())
         .await
         .unwrap();

      let received: Arc<Mutex<Vec<String>>> = Arc::default();
      let sink = received.clone();
      manager
         .subscribe_with(
            "UART_TX",
            Subscriber::raw(move |m| sink.lock().push(m.to_owned())),
            None,
         )
         .await
         .unwrap();

      peer.notify(NUS_TX, b"caf\xe9\0");
      time::timeout(WAIT, async {
         while received.lock().is_empty() {
            time::sleep(Duration::from_millis(5)).await;
         }
      })
      .await
      .unwrap();
      assert_eq!(*received.lock(), vec!["café".to_string()]);
   }
}
