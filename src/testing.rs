//! Recording radio double and event builders for unit tests.

use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{
   error::{RadioError, Result},
   event::{Event, EventBus, EventHub, EventNames},
   radio::{BondState, DiscoveredDevice, DiscoveryPhase, PowerState, RadioControl},
   session::RadioContext,
};

/// A command received by [`FakeRadio`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
   Enable,
   Disable,
   StartDiscovery,
   CreateBond(SmolStr),
}

/// Radio double that records commands and can emit scripted events
/// synchronously from inside a command.
pub struct FakeRadio {
   hub: EventHub,
   enabled: AtomicCell<bool>,
   accept_power: AtomicCell<bool>,
   discovery_error: Mutex<Option<String>>,
   bond_error: Mutex<Option<String>>,
   bond_states: Mutex<Vec<(SmolStr, BondState)>>,
   calls: Mutex<Vec<Call>>,
   scripts: Mutex<Vec<(Call, Vec<Event>)>>,
}

impl FakeRadio {
   pub fn new(hub: &EventHub) -> Arc<Self> {
      Arc::new(Self {
         hub: hub.clone(),
         enabled: AtomicCell::new(false),
         accept_power: AtomicCell::new(true),
         discovery_error: Mutex::new(None),
         bond_error: Mutex::new(None),
         bond_states: Mutex::new(Vec::new()),
         calls: Mutex::new(Vec::new()),
         scripts: Mutex::new(Vec::new()),
      })
   }

   pub fn set_enabled(&self, enabled: bool) {
      self.enabled.store(enabled);
   }

   pub fn reject_power_commands(&self) {
      self.accept_power.store(false);
   }

   pub fn fail_discovery(&self, reason: &str) {
      *self.discovery_error.lock() = Some(reason.to_string());
   }

   pub fn fail_bonding(&self, reason: &str) {
      *self.bond_error.lock() = Some(reason.to_string());
   }

   pub fn set_bond_state(&self, address: &str, state: BondState) {
      let mut states = self.bond_states.lock();
      states.retain(|(a, _)| a != address);
      states.push((address.into(), state));
   }

   /// Emits `events` on the bus, in order, when `call` is received.
   pub fn on(&self, call: Call, events: Vec<Event>) {
      self.scripts.lock().push((call, events));
   }

   pub fn calls(&self) -> Vec<Call> {
      self.calls.lock().clone()
   }

   fn record(&self, call: Call) {
      self.calls.lock().push(call.clone());
      let events: Vec<Event> = self
         .scripts
         .lock()
         .iter()
         .filter(|(c, _)| *c == call)
         .flat_map(|(_, events)| events.iter().cloned())
         .collect();
      for event in events {
         self.hub.emit(event);
      }
   }
}

impl RadioControl for FakeRadio {
   fn is_enabled(&self) -> bool {
      self.enabled.load()
   }

   fn enable(&self) -> bool {
      self.record(Call::Enable);
      self.accept_power.load()
   }

   fn disable(&self) -> bool {
      self.record(Call::Disable);
      self.accept_power.load()
   }

   fn start_discovery(&self) -> Result<()> {
      self.record(Call::StartDiscovery);
      match self.discovery_error.lock().clone() {
         Some(reason) => Err(RadioError::DiscoveryFailed(reason)),
         None => Ok(()),
      }
   }

   fn bond_state(&self, address: &str) -> BondState {
      self
         .bond_states
         .lock()
         .iter()
         .find(|(a, _)| a == address)
         .map_or(BondState::None, |(_, state)| *state)
   }

   fn create_bond(&self, address: &str) -> Result<()> {
      self.record(Call::CreateBond(address.into()));
      match self.bond_error.lock().clone() {
         Some(reason) => Err(RadioError::BondFailed {
            address: address.into(),
            reason,
         }),
         None => Ok(()),
      }
   }
}

/// Hub, radio double and context wired together.
pub fn fixture() -> (EventHub, Arc<FakeRadio>, RadioContext) {
   let _ = env_logger::builder().is_test(true).try_init();
   let hub = EventHub::new();
   let radio = FakeRadio::new(&hub);
   let context = RadioContext::new(radio.clone(), Arc::new(hub.clone()));
   (hub, radio, context)
}

pub fn power_event(state: PowerState) -> Event {
   EventNames::default().power_event(state)
}

pub fn found_event(address: &str) -> Event {
   EventNames::default().found_event(&DiscoveredDevice::new(address))
}

pub fn started_event() -> Event {
   EventNames::default().phase_event(DiscoveryPhase::Started)
}

pub fn finished_event() -> Event {
   EventNames::default().phase_event(DiscoveryPhase::Finished)
}

pub fn bond_event(address: &str, state: BondState) -> Event {
   EventNames::default().bond_event(&DiscoveredDevice::new(address), state)
}
