//! Per-channel subscription table and message fan-out.
//!
//! Every completed message is queued for each subscription present at
//! delivery time and then flushed in registration order. The hub is only
//! mutated by its owner, so subscriptions added or removed from inside a
//! callback take effect after the current flush. A panicking callback is
//! logged and does not stop delivery to the others.

use std::{
   any::Any,
   collections::{HashMap, VecDeque},
   fmt,
   panic::{self, AssertUnwindSafe},
};

use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use smol_str::{SmolStr, ToSmolStr};
use uuid::Uuid;

use crate::{
   channel::ChannelId,
   error::{RejectReason, Result, TransportError},
};

/// Identifier of a subscription, unique per channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(SmolStr);

impl SubscriptionId {
   pub fn new(id: impl Into<SmolStr>) -> Self {
      Self(id.into())
   }

   /// Random v4 UUID id.
   pub fn generate() -> Self {
      Self(Uuid::new_v4().to_smolstr())
   }

   pub fn as_str(&self) -> &str {
      self.0.as_str()
   }
}

impl fmt::Display for SubscriptionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

impl From<&str> for SubscriptionId {
   fn from(id: &str) -> Self {
      Self::new(id)
   }
}

impl From<String> for SubscriptionId {
   fn from(id: String) -> Self {
      Self::new(id)
   }
}

type Callback = Box<dyn FnMut(&str) -> serde_json::Result<()> + Send>;

/// A message consumer.
///
/// Messages are self-describing JSON values; [`Subscriber::json`]
/// deserializes each one before invoking the callback.
pub struct Subscriber {
   callback: Callback,
}

impl Subscriber {
   /// Deserializes each message into `T` before calling `callback`.
   /// Messages that fail to deserialize are logged and skipped.
   pub fn json<T, F>(mut callback: F) -> Self
   where
      T: DeserializeOwned,
      F: FnMut(T) + Send + 'static,
   {
      Self {
         callback: Box::new(move |message: &str| {
            let value = serde_json::from_str(message)?;
            callback(value);
            Ok(())
         }),
      }
   }

   /// Receives the decoded message text as-is.
   pub fn raw<F>(mut callback: F) -> Self
   where
      F: FnMut(&str) + Send + 'static,
   {
      Self {
         callback: Box::new(move |message: &str| {
            callback(message);
            Ok(())
         }),
      }
   }

   fn invoke(&mut self, message: &str) -> serde_json::Result<()> {
      (self.callback)(message)
   }
}

impl fmt::Debug for Subscriber {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Subscriber").finish_non_exhaustive()
   }
}

#[derive(Debug)]
struct Entry {
   id: SubscriptionId,
   subscriber: Subscriber,
   pending: VecDeque<String>,
}

/// Subscriptions of one channel, in registration order.
#[derive(Debug, Default)]
struct ChannelSubscriptions {
   entries: Vec<Entry>,
}

impl ChannelSubscriptions {
   fn position(&self, id: &SubscriptionId) -> Option<usize> {
      self.entries.iter().position(|e| &e.id == id)
   }

   fn fresh_id(&self) -> SubscriptionId {
      loop {
         let id = SubscriptionId::generate();
         if self.position(&id).is_none() {
            return id;
         }
      }
   }
}

/// Fan-out registry for completed messages.
#[derive(Debug, Default)]
pub struct ObserverHub {
   channels: HashMap<ChannelId, ChannelSubscriptions>,
}

impl ObserverHub {
   pub fn new() -> Self {
      Self::default()
   }

   /// Makes `channel` accept subscriptions.
   pub fn register_channel(&mut self, channel: ChannelId) {
      self.channels.entry(channel).or_default();
   }

   pub fn has_channel(&self, channel: &ChannelId) -> bool {
      self.channels.contains_key(channel)
   }

   /// Number of subscriptions on `channel`.
   pub fn subscription_count(&self, channel: &ChannelId) -> usize {
      self.channels.get(channel).map_or(0, |c| c.entries.len())
   }

   /// Adds a subscription, generating an id when none is given.
   ///
   /// Reusing an existing id replaces that subscription's callback while
   /// keeping its position and pending messages.
   pub fn subscribe(
      &mut self,
      channel: &ChannelId,
      id: Option<SubscriptionId>,
      subscriber: Subscriber,
   ) -> Result<SubscriptionId> {
      let Some(subscriptions) = self.channels.get_mut(channel) else {
         return Err(TransportError::SubscriptionRejected {
            channel: channel.clone(),
            reason: RejectReason::ChannelNotRegistered,
         });
      };

      let id = id.unwrap_or_else(|| subscriptions.fresh_id());
      if let Some(pos) = subscriptions.position(&id) {
         debug!("{channel}: replacing subscriber {id}");
         subscriptions.entries[pos].subscriber = subscriber;
      } else {
         debug!("{channel}: added subscriber {id}");
         subscriptions.entries.push(Entry {
            id: id.clone(),
            subscriber,
            pending: VecDeque::new(),
         });
      }
      Ok(id)
   }

   /// Removes a subscription and its pending messages. Returns whether it
   /// existed.
   pub fn unsubscribe(&mut self, id: &SubscriptionId, channel: &ChannelId) -> bool {
      let Some(subscriptions) = self.channels.get_mut(channel) else {
         return false;
      };
      let Some(pos) = subscriptions.position(id) else {
         return false;
      };
      subscriptions.entries.remove(pos);
      debug!("{channel}: removed subscriber {id}");
      true
   }

   /// Queues `message` for every current subscription on `channel` and
   /// flushes. Returns the number of callbacks that accepted a message.
   pub fn deliver(&mut self, channel: &ChannelId, message: &str) -> usize {
      let Some(subscriptions) = self.channels.get_mut(channel) else {
         warn!("{channel}: dropping message for unregistered channel");
         return 0;
      };
      for entry in &mut subscriptions.entries {
         entry.pending.push_back(message.to_owned());
      }
      self.flush(channel)
   }

   fn flush(&mut self, channel: &ChannelId) -> usize {
      let Some(subscriptions) = self.channels.get_mut(channel) else {
         return 0;
      };

      let mut delivered = 0;
      for entry in &mut subscriptions.entries {
         let id = &entry.id;
         while let Some(message) = entry.pending.pop_front() {
            let subscriber = &mut entry.subscriber;
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber.invoke(&message))) {
               Ok(Ok(())) => delivered += 1,
               Ok(Err(e)) => warn!("{channel}: subscriber {id} could not decode message: {e}"),
               Err(payload) => error!(
                  "{channel}: subscriber {id} panicked: {}",
                  panic_message(payload.as_ref())
               ),
            }
         }
      }
      delivered
   }

   /// Drops every channel, subscription and pending message.
   pub fn clear(&mut self) {
      self.channels.clear();
   }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
   if let Some(message) = payload.downcast_ref::<&str>() {
      *message
   } else if let Some(message) = payload.downcast_ref::<String>() {
      message.as_str()
   } else {
      "non-string payload"
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use parking_lot::Mutex;
   use serde_json::{Value, json};

   use super::*;

   fn hub() -> (ObserverHub, ChannelId) {
      let channel = ChannelId::new_static("UART_TX");
      let mut hub = ObserverHub::new();
      hub.register_channel(channel.clone());
      (hub, channel)
   }

   fn recorder(log: &Arc<Mutex<Vec<(&'static str, Value)>>>, name: &'static str) -> Subscriber {
      let log = log.clone();
      Subscriber::json(move |value: Value| log.lock().push((name, value)))
   }

   #[test]
   fn test_fan_out_in_registration_order() {
      let (mut hub, channel) = hub();
      let log = Arc::new(Mutex::new(Vec::new()));
      hub.subscribe(&channel, None, recorder(&log, "first")).unwrap();
      hub.subscribe(&channel, None, recorder(&log, "second")).unwrap();

      assert_eq!(hub.deliver(&channel, r#"{"a":1}"#), 2);

      let log = log.lock();
      assert_eq!(
         *log,
         vec![("first", json!({"a": 1})), ("second", json!({"a": 1}))]
      );
   }

   #[test]
   fn test_unsubscribe_reports_once() {
      let (mut hub, channel) = hub();
      let id = hub
         .subscribe(&channel, None, Subscriber::raw(|_| {}))
         .unwrap();

      assert!(hub.unsubscribe(&id, &channel));
      assert!(!hub.unsubscribe(&id, &channel));
      assert!(!hub.unsubscribe(&SubscriptionId::from("unknown"), &channel));
      assert!(!hub.unsubscribe(&id, &ChannelId::from("OTHER_TX")));
      assert_eq!(hub.deliver(&channel, "{}"), 0);
   }

   #[test]
   fn test_late_subscriber_misses_earlier_messages() {
      let (mut hub, channel) = hub();
      let log = Arc::new(Mutex::new(Vec::new()));
      hub.subscribe(&channel, None, recorder(&log, "early")).unwrap();
      hub.deliver(&channel, "1");
      hub.subscribe(&channel, None, recorder(&log, "late")).unwrap();
      hub.deliver(&channel, "2");

      let log = log.lock();
      assert_eq!(
         *log,
         vec![("early", json!(1)), ("early", json!(2)), ("late", json!(2))]
      );
   }

   #[test]
   fn test_undecodable_message_is_skipped_per_subscriber() {
      let (mut hub, channel) = hub();
      let raw = Arc::new(Mutex::new(Vec::new()));
      let typed = Arc::new(Mutex::new(Vec::new()));

      let raw_log = raw.clone();
      hub.subscribe(
         &channel,
         None,
         Subscriber::raw(move |m| raw_log.lock().push(m.to_owned())),
      )
      .unwrap();
      hub.subscribe(&channel, None, recorder(&typed, "typed")).unwrap();

      assert_eq!(hub.deliver(&channel, "{\"a\":"), 1);
      assert_eq!(*raw.lock(), vec!["{\"a\":".to_string()]);
      assert!(typed.lock().is_empty());
   }

   #[test]
   fn test_explicit_id_replaces_in_place() {
      let (mut hub, channel) = hub();
      let log = Arc::new(Mutex::new(Vec::new()));
      let id = SubscriptionId::from("plot");
      hub.subscribe(&channel, Some(id.clone()), recorder(&log, "old")).unwrap();
      hub.subscribe(&channel, None, recorder(&log, "other")).unwrap();
      let again = hub
         .subscribe(&channel, Some(id.clone()), recorder(&log, "new"))
         .unwrap();

      assert_eq!(again, id);
      assert_eq!(hub.subscription_count(&channel), 2);
      hub.deliver(&channel, "true");
      let names: Vec<_> = log.lock().iter().map(|(name, _)| *name).collect();
      assert_eq!(names, vec!["new", "other"]);
   }

   #[test]
   fn test_unregistered_channel_is_rejected() {
      let mut hub = ObserverHub::new();
      let err = hub
         .subscribe(&ChannelId::from("UART_RX"), None, Subscriber::raw(|_| {}))
         .unwrap_err();
      assert!(matches!(
         err,
         TransportError::SubscriptionRejected {
            reason: RejectReason::ChannelNotRegistered,
            ..
         }
      ));
   }

   #[test]
   fn test_generated_ids_are_unique() {
      let (mut hub, channel) = hub();
      let a = hub.subscribe(&channel, None, Subscriber::raw(|_| {})).unwrap();
      let b = hub.subscribe(&channel, None, Subscriber::raw(|_| {})).unwrap();
      assert_ne!(a, b);
      assert_eq!(hub.subscription_count(&channel), 2);
   }

   #[test]
   fn test_panicking_subscriber_does_not_stop_delivery() {
      let (mut hub, channel) = hub();
      let log = Arc::new(Mutex::new(Vec::new()));
      hub.subscribe(&channel, None, Subscriber::raw(|_| panic!("subscriber bug")))
         .unwrap();
      hub.subscribe(&channel, None, recorder(&log, "after")).unwrap();

      assert_eq!(hub.deliver(&channel, "1"), 1);
      assert_eq!(hub.deliver(&channel, "2"), 1);
      assert_eq!(*log.lock(), vec![("after", json!(1)), ("after", json!(2))]);
      assert_eq!(hub.subscription_count(&channel), 2);
   }

   #[test]
   fn test_clear_drops_everything() {
      let (mut hub, channel) = hub();
      hub.subscribe(&channel, None, Subscriber::raw(|_| {})).unwrap();
      hub.clear();
      assert!(!hub.has_channel(&channel));
      assert_eq!(hub.deliver(&channel, "{}"), 0);
   }
}
