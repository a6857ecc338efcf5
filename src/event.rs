//! Event bus plumbing between radio drivers and sessions.
//!
//! Drivers publish named [`Event`]s through [`EventBus`]; sessions receive
//! them through [`EventSource`] subscriptions filtered by event name.
//! [`EventHub`] is the in-process bus that implements both sides.

use std::{
   mem,
   pin::Pin,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
   task::{Context, Poll},
};

use futures::Stream;
use log::{debug, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::{
   error::{RadioError, Result},
   radio::{BondState, DiscoveredDevice, DiscoveryPhase, PowerState},
};

/// Payload field holding a power state code.
pub const FIELD_STATE: &str = "state";
/// Payload field holding a device record.
pub const FIELD_DEVICE: &str = "device";
/// Payload field holding a bond state code.
pub const FIELD_BOND_STATE: &str = "bond_state";

/// A named notification with an attached payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
   pub name: SmolStr,
   pub payload: Value,
}

impl Event {
   pub fn new(name: impl Into<SmolStr>) -> Self {
      Self {
         name: name.into(),
         payload: Value::Null,
      }
   }

   pub fn with_payload(name: impl Into<SmolStr>, payload: Value) -> Self {
      Self {
         name: name.into(),
         payload,
      }
   }

   /// Decodes a typed field from the payload.
   pub fn field<T: DeserializeOwned>(&self, field: &'static str) -> Result<T> {
      let value = self
         .payload
         .get(field)
         .ok_or_else(|| RadioError::MissingField {
            event: self.name.clone(),
            field,
         })?;
      T::deserialize(value).map_err(|e| RadioError::InvalidField {
         event: self.name.clone(),
         field,
         reason: e.to_string(),
      })
   }
}

/// Set of event names a subscription is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
   names: SmallVec<[SmolStr; 2]>,
}

impl EventFilter {
   pub fn new<I, S>(names: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<SmolStr>,
   {
      Self {
         names: names.into_iter().map(Into::into).collect(),
      }
   }

   pub fn single(name: impl Into<SmolStr>) -> Self {
      Self::new([name])
   }

   pub fn matches(&self, name: &str) -> bool {
      self.names.iter().any(|n| n == name)
   }

   pub fn names(&self) -> &[SmolStr] {
      &self.names
   }
}

/// Names of the events consumed by the sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventNames {
   #[serde(default = "default_state_changed")]
   pub state_changed: SmolStr,

   #[serde(default = "default_discovery_started")]
   pub discovery_started: SmolStr,

   #[serde(default = "default_discovery_finished")]
   pub discovery_finished: SmolStr,

   #[serde(default = "default_device_found")]
   pub device_found: SmolStr,

   #[serde(default = "default_bond_state_changed")]
   pub bond_state_changed: SmolStr,

   #[serde(default = "default_acl_connected")]
   pub acl_connected: SmolStr,

   #[serde(default = "default_acl_disconnected")]
   pub acl_disconnected: SmolStr,
}

const fn default_state_changed() -> SmolStr {
   SmolStr::new_static("adapter.state_changed")
}

const fn default_discovery_started() -> SmolStr {
   SmolStr::new_static("adapter.discovery_started")
}

const fn default_discovery_finished() -> SmolStr {
   SmolStr::new_static("adapter.discovery_finished")
}

const fn default_device_found() -> SmolStr {
   SmolStr::new_static("device.found")
}

const fn default_bond_state_changed() -> SmolStr {
   SmolStr::new_static("device.bond_state_changed")
}

const fn default_acl_connected() -> SmolStr {
   SmolStr::new_static("device.acl_connected")
}

const fn default_acl_disconnected() -> SmolStr {
   SmolStr::new_static("device.acl_disconnected")
}

impl Default for EventNames {
   fn default() -> Self {
      Self {
         state_changed: default_state_changed(),
         discovery_started: default_discovery_started(),
         discovery_finished: default_discovery_finished(),
         device_found: default_device_found(),
         bond_state_changed: default_bond_state_changed(),
         acl_connected: default_acl_connected(),
         acl_disconnected: default_acl_disconnected(),
      }
   }
}

impl EventNames {
   /// Power state change notification.
   pub fn power_event(&self, state: PowerState) -> Event {
      Event::with_payload(
         self.state_changed.clone(),
         object([(FIELD_STATE, state.code().into())]),
      )
   }

   /// Discovery round start or end notification.
   pub fn phase_event(&self, phase: DiscoveryPhase) -> Event {
      Event::new(match phase {
         DiscoveryPhase::Started => self.discovery_started.clone(),
         DiscoveryPhase::Finished => self.discovery_finished.clone(),
      })
   }

   /// Device found during discovery.
   pub fn found_event(&self, device: &DiscoveredDevice) -> Event {
      Event::with_payload(
         self.device_found.clone(),
         object([(FIELD_DEVICE, device.to_json())]),
      )
   }

   /// Bond state change of a device.
   pub fn bond_event(&self, device: &DiscoveredDevice, state: BondState) -> Event {
      Event::with_payload(
         self.bond_state_changed.clone(),
         object([
            (FIELD_DEVICE, device.to_json()),
            (FIELD_BOND_STATE, state.code().into()),
         ]),
      )
   }

   /// ACL link of a device came up or went down.
   pub fn link_event(&self, device: &DiscoveredDevice, connected: bool) -> Event {
      let name = if connected {
         &self.acl_connected
      } else {
         &self.acl_disconnected
      };
      Event::with_payload(name.clone(), object([(FIELD_DEVICE, device.to_json())]))
   }
}

fn object<const N: usize>(fields: [(&str, Value); N]) -> Value {
   Value::Object(
      fields
         .into_iter()
         .map(|(key, value)| (key.to_string(), value))
         .collect::<Map<_, _>>(),
   )
}

/// Live registration on an event source.
///
/// Yields matching events in the order the source delivered them. Dropping
/// the subscription unregisters it from the source.
pub struct Subscription {
   rx: mpsc::UnboundedReceiver<Event>,
   release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
   pub fn new<F>(rx: mpsc::UnboundedReceiver<Event>, release: F) -> Self
   where
      F: FnOnce() + Send + 'static,
   {
      Self {
         rx,
         release: Some(Box::new(release)),
      }
   }

   /// A subscription with nothing to release on drop.
   pub fn detached(rx: mpsc::UnboundedReceiver<Event>) -> Self {
      Self { rx, release: None }
   }
}

impl Stream for Subscription {
   type Item = Event;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
      self.rx.poll_recv(cx)
   }
}

impl Drop for Subscription {
   fn drop(&mut self) {
      self.rx.close();
      if let Some(release) = self.release.take() {
         release();
      }
   }
}

/// Trait for implementing event subscription.
pub trait EventSource: Send + Sync {
   /// Registers a listener for the events named by `filter`.
   ///
   /// The listener is live when this returns: every event emitted after
   /// the call is delivered to the returned subscription.
   fn subscribe(&self, filter: EventFilter) -> Subscription;
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: Event);
}

/// Type alias for a shared event source.
pub type SharedSource = Arc<dyn EventSource>;

struct Listener {
   id: u64,
   filter: EventFilter,
   tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct HubInner {
   listeners: Mutex<Vec<Listener>>,
   next_id: AtomicU64,
   shut_down: AtomicBool,
}

/// In-process broadcast bus.
///
/// This type is cheaply cloneable. Emitting never blocks; each listener
/// has its own unbounded queue. Open subscriptions end when the hub is
/// shut down or every handle is dropped.
#[derive(Clone, Default)]
pub struct EventHub(Arc<HubInner>);

impl EventHub {
   pub fn new() -> Self {
      Self::default()
   }

   /// Number of live listeners.
   pub fn listener_count(&self) -> usize {
      let mut listeners = self.0.listeners.lock();
      listeners.retain(|l| !l.tx.is_closed());
      listeners.len()
   }

   /// Ends every open subscription. Later subscriptions end immediately.
   pub fn shutdown(&self) {
      self.0.shut_down.store(true, Ordering::Release);
      let listeners = mem::take(&mut *self.0.listeners.lock());
      debug!("Event hub shut down with {} listeners", listeners.len());
   }

   pub fn is_shut_down(&self) -> bool {
      self.0.shut_down.load(Ordering::Acquire)
   }

   /// Emits an event built from a name and payload.
   pub fn publish(&self, name: impl Into<SmolStr>, payload: Value) {
      self.emit(Event::with_payload(name, payload));
   }
}

impl EventSource for EventHub {
   fn subscribe(&self, filter: EventFilter) -> Subscription {
      let (tx, rx) = mpsc::unbounded_channel();
      let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
      {
         let mut listeners = self.0.listeners.lock();
         if self.is_shut_down() {
            return Subscription::detached(rx);
         }
         trace!("Listener {id} subscribed to {:?}", filter.names());
         listeners.push(Listener { id, filter, tx });
      }

      let hub = Arc::downgrade(&self.0);
      Subscription::new(rx, move || {
         if let Some(hub) = hub.upgrade() {
            hub.listeners.lock().retain(|l| l.id != id);
            trace!("Listener {id} released");
         }
      })
   }
}

impl EventBus for EventHub {
   fn emit(&self, event: Event) {
      trace!("Emitting {}", event.name);
      self.0.listeners.lock().retain(|l| {
         if l.filter.matches(&event.name) {
            l.tx.send(event.clone()).is_ok()
         } else {
            !l.tx.is_closed()
         }
      });
   }
}

#[cfg(test)]
mod tests {
   use futures::{FutureExt, StreamExt};
   use serde_json::json;

   use super::*;

   #[test]
   fn test_event_field_decoding() {
      let event = Event::with_payload("adapter.state_changed", json!({ "state": 12 }));
      assert_eq!(event.field::<PowerState>(FIELD_STATE).unwrap(), PowerState::On);

      let missing = event.field::<PowerState>(FIELD_BOND_STATE).unwrap_err();
      assert!(matches!(missing, RadioError::MissingField { field: "bond_state", .. }));

      let bad = Event::with_payload("adapter.state_changed", json!({ "state": "on" }));
      assert!(matches!(
         bad.field::<PowerState>(FIELD_STATE),
         Err(RadioError::InvalidField { .. })
      ));
   }

   #[test]
   fn test_filter_matches_names() {
      let filter = EventFilter::new(["a", "b"]);
      assert!(filter.matches("a"));
      assert!(filter.matches("b"));
      assert!(!filter.matches("c"));
      assert_eq!(EventFilter::single("a").names().len(), 1);
   }

   #[tokio::test]
   async fn test_hub_delivers_in_emit_order() {
      let hub = EventHub::new();
      let mut sub = hub.subscribe(EventFilter::new(["x", "y"]));

      hub.emit(Event::new("x"));
      hub.emit(Event::new("ignored"));
      hub.emit(Event::new("y"));
      hub.emit(Event::new("x"));

      let names: Vec<_> = (&mut sub).take(3).map(|e| e.name).collect().await;
      assert_eq!(names, ["x", "y", "x"]);
      assert!(sub.next().now_or_never().is_none());
   }

   #[tokio::test]
   async fn test_hub_fans_out_to_every_listener() {
      let hub = EventHub::new();
      let mut first = hub.subscribe(EventFilter::single("x"));
      let mut second = hub.subscribe(EventFilter::single("x"));

      hub.emit(Event::new("x"));

      assert_eq!(first.next().await.unwrap().name, "x");
      assert_eq!(second.next().await.unwrap().name, "x");
   }

   #[test]
   fn test_dropping_subscription_releases_listener() {
      let hub = EventHub::new();
      let sub = hub.subscribe(EventFilter::single("x"));
      let other = hub.subscribe(EventFilter::single("y"));
      assert_eq!(hub.listener_count(), 2);

      drop(sub);
      assert_eq!(hub.listener_count(), 1);
      drop(other);
      assert_eq!(hub.listener_count(), 0);
   }

   #[tokio::test]
   async fn test_subscription_ends_when_hub_dropped() {
      let hub = EventHub::new();
      let mut sub = hub.subscribe(EventFilter::single("x"));
      hub.emit(Event::new("x"));
      drop(hub);

      assert!(sub.next().await.is_some());
      assert!(sub.next().await.is_none());
   }

   #[tokio::test]
   async fn test_shutdown_ends_subscriptions() {
      let hub = EventHub::new();
      let mut open = hub.subscribe(EventFilter::single("x"));
      hub.shutdown();
      assert!(hub.is_shut_down());
      assert_eq!(hub.listener_count(), 0);
      assert!(open.next().await.is_none());

      let mut late = hub.subscribe(EventFilter::single("x"));
      hub.emit(Event::new("x"));
      assert!(late.next().await.is_none());
   }

   #[test]
   fn test_built_events_decode() {
      let names = EventNames::default();
      let device = DiscoveredDevice::new("AA:BB").with_name("Keyboard");

      let power = names.power_event(PowerState::TurningOn);
      assert_eq!(power.name, names.state_changed);
      assert_eq!(power.field::<PowerState>(FIELD_STATE).unwrap(), PowerState::TurningOn);

      let bond = names.bond_event(&device, BondState::Bonding);
      assert_eq!(bond.field::<DiscoveredDevice>(FIELD_DEVICE).unwrap(), device);
      assert_eq!(bond.field::<BondState>(FIELD_BOND_STATE).unwrap(), BondState::Bonding);

      assert_eq!(names.phase_event(DiscoveryPhase::Finished).name, names.discovery_finished);
      assert_eq!(names.link_event(&device, false).name, names.acl_disconnected);
   }

   #[test]
   fn test_event_names_defaults() {
      let names = EventNames::default();
      assert_eq!(names.state_changed, "adapter.state_changed");
      assert_eq!(names.device_found, "device.found");
      assert_ne!(names.discovery_started, names.discovery_finished);
   }
}
