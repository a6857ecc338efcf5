//! Radio driver capability.
//!
//! Sessions never talk to hardware directly. They issue commands through
//! [`RadioControl`], which a driver backend (or a test double) implements,
//! and observe the results on the event bus.

use std::sync::Arc;

use crate::error::Result;

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod state;

pub use state::{BondState, DiscoveredDevice, DiscoveryPhase, PowerState, UnknownCode};

/// Commands and state queries exposed by the radio driver.
///
/// Every command only submits the request and reports whether the driver
/// accepted it; progress is reported later through the event bus.
pub trait RadioControl: Send + Sync {
   /// Whether the adapter currently reports ON.
   fn is_enabled(&self) -> bool;

   /// Requests power on. Returns `false` if the driver refused.
   fn enable(&self) -> bool;

   /// Requests power off. Returns `false` if the driver refused.
   fn disable(&self) -> bool;

   /// Starts a discovery round.
   fn start_discovery(&self) -> Result<()>;

   /// Current bond state of the device with the given address.
   fn bond_state(&self, address: &str) -> BondState;

   /// Starts bonding with the device with the given address.
   fn create_bond(&self, address: &str) -> Result<()>;
}

/// Type alias for a shared radio driver handle.
pub type SharedRadio = Arc<dyn RadioControl>;
