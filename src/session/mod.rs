//! Sessions over the radio's notification bus.
//!
//! Each session type turns the shared, broadcast-style bus into its own
//! independent streams. Composing operations (power toggles, discovery,
//! bonding) register their listeners before issuing the driver command and
//! release them as soon as the stream reaches its terminal signal or is
//! dropped. An `Err` item is always the last item of a stream.

use std::sync::Arc;

use crate::{
   error::Result,
   event::{Event, EventFilter, EventNames, SharedSource},
   radio::SharedRadio,
   stream::{StateStream, subscribe_typed},
};

pub mod bonding;
pub mod connection;
pub mod discovery;
pub mod power;

pub use bonding::{Bonding, BondingProgress, BondingSession};
pub use connection::ConnectionObserver;
pub use discovery::{
   DiscoveredDevices, Discovery, DiscoveryFinish, DiscoverySession, DiscoveryWindow,
};
pub use power::{AdapterPowerController, PowerDirection, PowerTransition, SettledStates};

/// Driver, bus and event names shared by every session.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct RadioContext {
   radio: SharedRadio,
   source: SharedSource,
   names: Arc<EventNames>,
}

impl RadioContext {
   pub fn new(radio: SharedRadio, source: SharedSource) -> Self {
      Self {
         radio,
         source,
         names: Arc::default(),
      }
   }

   /// Overrides the names of the consumed events.
   #[must_use]
   pub fn with_names(mut self, names: EventNames) -> Self {
      self.names = Arc::new(names);
      self
   }

   pub const fn radio(&self) -> &SharedRadio {
      &self.radio
   }

   pub const fn source(&self) -> &SharedSource {
      &self.source
   }

   pub fn names(&self) -> &EventNames {
      &self.names
   }

   pub fn power(&self) -> AdapterPowerController {
      AdapterPowerController::new(self.clone())
   }

   pub fn discovery(&self) -> DiscoverySession {
      DiscoverySession::new(self.clone())
   }

   pub fn bonding(&self) -> BondingSession {
      BondingSession::new(self.clone())
   }

   pub fn connections(&self) -> ConnectionObserver {
      ConnectionObserver::new(self.clone())
   }

   pub(crate) fn typed<T, F>(&self, filter: EventFilter, extract: F) -> StateStream<T>
   where
      F: Fn(&Event) -> Result<T> + Send + Sync + 'static,
   {
      subscribe_typed(self.source.clone(), filter, extract)
   }
}
