//! Adapter and device state definitions.
//!
//! This module contains the state enums carried in event payloads and the
//! device record surfaced by discovery, connection and bonding events.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// A state code in a payload that does not map to any known state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unknown state code {0}")]
pub struct UnknownCode(pub i32);

/// Power state of the adapter.
#[repr(i32)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
#[serde(try_from = "i32", into = "i32")]
pub enum PowerState {
   #[strum(serialize = "off")]
   Off = 10,
   #[strum(serialize = "turning_on")]
   TurningOn = 11,
   #[strum(serialize = "on")]
   On = 12,
   #[strum(serialize = "turning_off")]
   TurningOff = 13,
}

impl PowerState {
   /// ON and OFF end a power transition; the other states are in flight.
   pub const fn is_settled(self) -> bool {
      matches!(self, Self::On | Self::Off)
   }

   pub const fn code(self) -> i32 {
      self as i32
   }
}

impl TryFrom<i32> for PowerState {
   type Error = UnknownCode;

   fn try_from(code: i32) -> Result<Self, Self::Error> {
      Self::from_repr(code).ok_or(UnknownCode(code))
   }
}

impl From<PowerState> for i32 {
   fn from(state: PowerState) -> Self {
      state.code()
   }
}

/// Bonding (pairing) state of a remote device.
#[repr(i32)]
#[derive(
   Debug,
   Default,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
#[serde(try_from = "i32", into = "i32")]
pub enum BondState {
   #[default]
   #[strum(serialize = "none")]
   None = 10,
   #[strum(serialize = "bonding")]
   Bonding = 11,
   #[strum(serialize = "bonded")]
   Bonded = 12,
}

impl BondState {
   /// BONDED and NONE end a bonding attempt.
   pub const fn is_settled(self) -> bool {
      matches!(self, Self::Bonded | Self::None)
   }

   pub const fn code(self) -> i32 {
      self as i32
   }
}

impl TryFrom<i32> for BondState {
   type Error = UnknownCode;

   fn try_from(code: i32) -> Result<Self, Self::Error> {
      Self::from_repr(code).ok_or(UnknownCode(code))
   }
}

impl From<BondState> for i32 {
   fn from(state: BondState) -> Self {
      state.code()
   }
}

/// Lifecycle signal of a discovery round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum DiscoveryPhase {
   #[strum(serialize = "started")]
   Started,
   #[strum(serialize = "finished")]
   Finished,
}

/// A remote device as reported by discovery, connection and bonding
/// events. The address is the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
   pub address: SmolStr,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub name: Option<SmolStr>,
   #[serde(default)]
   pub bond_state: BondState,
}

impl DiscoveredDevice {
   pub fn new(address: impl Into<SmolStr>) -> Self {
      Self {
         address: address.into(),
         name: None,
         bond_state: BondState::None,
      }
   }

   #[must_use]
   pub fn with_name(mut self, name: impl Into<SmolStr>) -> Self {
      self.name = Some(name.into());
      self
   }

   #[must_use]
   pub const fn with_bond_state(mut self, bond_state: BondState) -> Self {
      self.bond_state = bond_state;
      self
   }

   /// Name to show for the device, falling back to its address.
   pub fn display_name(&self) -> &str {
      self.name.as_deref().unwrap_or(&self.address)
   }

   pub fn to_json(&self) -> serde_json::Value {
      // Strings and an integer code; serialization cannot fail
      serde_json::to_value(self).unwrap_or_default()
   }
}
