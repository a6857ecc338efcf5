//! BlueZ backend.
//!
//! [`BluezRadio`] drives one BlueZ adapter through `bluer` and republishes
//! what the adapter reports into an [`EventHub`]: power changes, discovery
//! rounds, devices found, link changes and bonding results. Commands are
//! submitted to the tokio runtime the radio was created on and return
//! immediately.

use std::{
   collections::HashMap,
   str::FromStr,
   sync::Arc,
   time::Duration,
};

use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty, Session};
use crossbeam::atomic::AtomicCell;
use futures::{Stream, StreamExt, pin_mut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   runtime::Handle,
   select,
   task::{AbortHandle, JoinHandle, JoinSet},
   time,
};

use crate::{
   config::Config,
   error::{RadioError, Result},
   event::{EventBus, EventHub, EventNames},
   radio::{BondState, DiscoveredDevice, DiscoveryPhase, PowerState, RadioControl},
   session::RadioContext,
};

/// State shared between the radio and its background tasks.
struct Shared {
   adapter: Adapter,
   hub: EventHub,
   names: EventNames,
   powered: AtomicCell<bool>,
   bonds: Mutex<HashMap<SmolStr, BondState>>,
}

impl Shared {
   fn set_bond(&self, address: &SmolStr, state: BondState) {
      self.bonds.lock().insert(address.clone(), state);
   }

   async fn describe(&self, address: Address) -> DiscoveredDevice {
      let mut record = DiscoveredDevice::new(address.to_smolstr());
      if let Some(state) = self.bonds.lock().get(&record.address) {
         record.bond_state = *state;
      }
      if let Ok(device) = self.adapter.device(address)
         && let Ok(Some(name)) = device.name().await
      {
         record = record.with_name(name);
      }
      record
   }
}

/// [`RadioControl`] over a BlueZ adapter.
pub struct BluezRadio {
   shared: Arc<Shared>,
   runtime: Handle,
   discovery_timeout: Duration,
   monitor: JoinHandle<()>,
   discovery: Mutex<Option<JoinHandle<()>>>,
}

impl BluezRadio {
   /// Opens the configured adapter (or the default one) and starts
   /// republishing its notifications into `hub`.
   pub async fn new(hub: EventHub, config: &Config) -> Result<Arc<Self>> {
      let session = Session::new().await?;
      let adapter = match &config.bluez.adapter {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      info!("Using adapter {}", adapter.name());

      let powered = adapter.is_powered().await?;
      let mut bonds = HashMap::new();
      for address in adapter.device_addresses().await? {
         if let Ok(device) = adapter.device(address)
            && device.is_paired().await.unwrap_or(false)
         {
            bonds.insert(address.to_smolstr(), BondState::Bonded);
         }
      }
      debug!("Adapter powered: {powered}, {} bonded devices", bonds.len());

      let shared = Arc::new(Shared {
         adapter,
         hub,
         names: config.events.clone(),
         powered: AtomicCell::new(powered),
         bonds: Mutex::new(bonds),
      });
      let monitor = tokio::spawn(monitor_adapter(shared.clone()));

      Ok(Arc::new(Self {
         shared,
         runtime: Handle::current(),
         discovery_timeout: config.bluez.discovery_timeout(),
         monitor,
         discovery: Mutex::new(None),
      }))
   }

   /// Sessions bound to this radio, its hub and its event names.
   pub fn context(self: &Arc<Self>) -> RadioContext {
      RadioContext::new(self.clone(), Arc::new(self.shared.hub.clone()))
         .with_names(self.shared.names.clone())
   }

   pub fn adapter_name(&self) -> &str {
      self.shared.adapter.name()
   }

   fn set_powered(&self, on: bool) -> bool {
      let shared = self.shared.clone();
      let transitional = if on {
         PowerState::TurningOn
      } else {
         PowerState::TurningOff
      };
      shared.hub.emit(shared.names.power_event(transitional));

      self.runtime.spawn(async move {
         if let Err(e) = shared.adapter.set_powered(on).await {
            let direction = if on { "on" } else { "off" };
            warn!("Failed to power {direction} adapter {}: {e}", shared.adapter.name());
            // Settle back where the adapter was
            let state = if shared.powered.load() {
               PowerState::On
            } else {
               PowerState::Off
            };
            shared.hub.emit(shared.names.power_event(state));
         }
      });
      true
   }
}

impl RadioControl for BluezRadio {
   fn is_enabled(&self) -> bool {
      self.shared.powered.load()
   }

   fn enable(&self) -> bool {
      self.set_powered(true)
   }

   fn disable(&self) -> bool {
      self.set_powered(false)
   }

   fn start_discovery(&self) -> Result<()> {
      let mut current = self.discovery.lock();
      if current.as_ref().is_some_and(|handle| !handle.is_finished()) {
         return Err(RadioError::DiscoveryFailed(
            "a discovery round is already running".to_string(),
         ));
      }
      *current = Some(
         self
            .runtime
            .spawn(run_discovery(self.shared.clone(), self.discovery_timeout)),
      );
      Ok(())
   }

   fn bond_state(&self, address: &str) -> BondState {
      self
         .shared
         .bonds
         .lock()
         .get(address)
         .copied()
         .unwrap_or_default()
   }

   fn create_bond(&self, address: &str) -> Result<()> {
      let parsed = Address::from_str(address).map_err(|e| RadioError::BondFailed {
         address: address.into(),
         reason: e.to_string(),
      })?;
      let device = self.shared.adapter.device(parsed)?;
      let shared = self.shared.clone();

      self.runtime.spawn(async move {
         let mut record = shared.describe(parsed).await;
         shared.set_bond(&record.address, BondState::Bonding);
         shared
            .hub
            .emit(shared.names.bond_event(&record, BondState::Bonding));

         let state = match device.pair().await {
            Ok(()) => BondState::Bonded,
            Err(e) => {
               warn!("Pairing with {parsed} failed: {e}");
               BondState::None
            },
         };
         shared.set_bond(&record.address, state);
         record.bond_state = state;
         shared.hub.emit(shared.names.bond_event(&record, state));
      });
      Ok(())
   }
}

impl Drop for BluezRadio {
   fn drop(&mut self) {
      self.monitor.abort();
      if let Some(handle) = self.discovery.lock().take() {
         handle.abort();
      }
   }
}

/// Republishes adapter power changes and watches every known device.
async fn monitor_adapter(shared: Arc<Shared>) {
   let name = shared.adapter.name().to_smolstr();
   let mut watchers = JoinSet::new();
   let mut watched: HashMap<Address, AbortHandle> = HashMap::new();

   if let Ok(addresses) = shared.adapter.device_addresses().await {
      for address in addresses {
         watched.insert(address, watchers.spawn(watch_device(shared.clone(), address)));
      }
   }

   let Ok(events) = shared.adapter.events().await else {
      warn!("Failed to get adapter events for {name}");
      return;
   };
   pin_mut!(events);

   loop {
      select! {
         event = events.next() => match event {
            Some(AdapterEvent::PropertyChanged(AdapterProperty::Powered(on))) => {
               debug!("Adapter {name} powered: {on}");
               shared.powered.store(on);
               let state = if on { PowerState::On } else { PowerState::Off };
               shared.hub.emit(shared.names.power_event(state));
            },
            Some(AdapterEvent::DeviceAdded(address)) => {
               if watched.get(&address).is_none_or(AbortHandle::is_finished) {
                  watched.insert(address, watchers.spawn(watch_device(shared.clone(), address)));
               }
            },
            Some(AdapterEvent::DeviceRemoved(address)) => {
               debug!("Device removed on {name}: {address}");
               if let Some(watcher) = watched.remove(&address) {
                  watcher.abort();
               }
               shared.bonds.lock().remove(&address.to_smolstr());
            },
            Some(_) => {},
            None => break,
         },
         Some(done) = watchers.join_next() => {
            // A watcher whose device stream ended; aborted ones are already gone
            if let Ok(address) = done
               && watched.get(&address).is_some_and(AbortHandle::is_finished)
            {
               watched.remove(&address);
            }
         },
      }
   }

   warn!("Event stream of adapter {name} ended");
}

/// Republishes link changes of one device and tracks its pairing.
async fn watch_device(shared: Arc<Shared>, address: Address) -> Address {
   let Ok(device) = shared.adapter.device(address) else {
      return address;
   };
   let Ok(events) = device.events().await else {
      return address;
   };
   pin_mut!(events);

   while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
      match property {
         DeviceProperty::Connected(connected) => {
            let record = shared.describe(address).await;
            debug!("Device {address} connected: {connected}");
            shared.hub.emit(shared.names.link_event(&record, connected));
         },
         DeviceProperty::Paired(paired) => {
            let state = if paired {
               BondState::Bonded
            } else {
               BondState::None
            };
            shared.set_bond(&address.to_smolstr(), state);
         },
         _ => {},
      }
   }
   address
}

/// Runs one discovery round bounded by `timeout`.
async fn run_discovery(shared: Arc<Shared>, timeout: Duration) {
   let events = match shared.adapter.discover_devices().await {
      Ok(events) => events,
      Err(e) => {
         warn!("Failed to start discovery on {}: {e}", shared.adapter.name());
         shared
            .hub
            .emit(shared.names.phase_event(DiscoveryPhase::Finished));
         return;
      },
   };

   shared
      .hub
      .emit(shared.names.phase_event(DiscoveryPhase::Started));
   info!("Discovery started for {timeout:?}");

   // The scan stops once the discovery stream is dropped
   scan(&shared, events, timeout).await;

   shared
      .hub
      .emit(shared.names.phase_event(DiscoveryPhase::Finished));
   info!("Discovery finished");
}

/// Publishes devices found on `events` until `timeout` elapses or the
/// stream ends. Consumes the stream.
async fn scan(shared: &Shared, events: impl Stream<Item = AdapterEvent>, timeout: Duration) {
   pin_mut!(events);
   let deadline = time::sleep(timeout);
   pin_mut!(deadline);
   loop {
      select! {
         _ = &mut deadline => break,
         event = events.next() => match event {
            Some(AdapterEvent::DeviceAdded(address)) => {
               let record = shared.describe(address).await;
               debug!("Found {} ({address})", record.display_name());
               shared.hub.emit(shared.names.found_event(&record));
            },
            Some(_) => {},
            None => break,
         },
      }
   }
}
