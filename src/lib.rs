//! Terminating, race-free streams over radio adapter notifications.
//!
//! A radio adapter reports what it is doing through broadcast
//! notifications: power state changes, discovery rounds starting and
//! finishing, devices found, bond state changes. This crate turns those
//! into [`futures::Stream`]s that subscribe lazily, end on their own when
//! the observed process settles, and release their listener when they end
//! or are dropped.
//!
//! - [`event`] holds the notification model and the in-process
//!   [`EventHub`] that delivers notifications to listeners.
//! - [`stream::StateStream`] is the lazy typed subscription everything
//!   else is built on.
//! - [`session`] holds the operations: power control, discovery, bonding
//!   and link observation, all reached through a [`RadioContext`].
//! - [`radio`] defines the [`RadioControl`] driver seam, the state
//!   vocabulary and (with the `bluez` feature) a BlueZ backend.

pub mod config;
pub mod error;
pub mod event;
pub mod radio;
pub mod session;
pub mod stream;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{RadioError, Result};
pub use event::{Event, EventBus, EventFilter, EventHub, EventNames, EventSource};
pub use radio::{BondState, DiscoveredDevice, DiscoveryPhase, PowerState, RadioControl};
pub use session::{
   AdapterPowerController, BondingSession, ConnectionObserver, DiscoverySession, RadioContext,
};
pub use stream::StateStream;
