//! Error types for the radio observer.
//!
//! Every failure a session can produce travels through its stream as an
//! `Err` item: precondition violations, command rejections by the driver,
//! and malformed event payloads. Configuration and backend errors share
//! the same enum.

use smol_str::SmolStr;
use thiserror::Error;

/// Main error type for the radio observer.
#[derive(Error, Debug)]
pub enum RadioError {
   #[error("Bluetooth is already enabled")]
   AlreadyEnabled,

   #[error("Bluetooth is already disabled")]
   AlreadyDisabled,

   #[error("Cannot enable Bluetooth (maybe airplane mode is on?)")]
   EnableRejected,

   #[error("Cannot disable Bluetooth")]
   DisableRejected,

   #[error("Device {0} is already bonded")]
   AlreadyBonded(SmolStr),

   #[error("Device {0} is already in the process of bonding")]
   AlreadyBonding(SmolStr),

   #[error("Bonding with {address} failed: {reason}")]
   BondFailed { address: SmolStr, reason: String },

   #[error("Discovery could not be started: {0}")]
   DiscoveryFailed(String),

   #[error("Event `{event}` is missing field `{field}`")]
   MissingField { event: SmolStr, field: &'static str },

   #[error("Event `{event}` has malformed field `{field}`: {reason}")]
   InvalidField {
      event: SmolStr,
      field: &'static str,
      reason: String,
   },

   #[error("Event source closed")]
   SourceClosed,

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[cfg(feature = "bluez")]
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),
}

impl RadioError {
   /// Whether the error was raised before any command was issued because
   /// the adapter or device was already in the requested state.
   pub const fn is_precondition(&self) -> bool {
      matches!(
         self,
         Self::AlreadyEnabled
            | Self::AlreadyDisabled
            | Self::AlreadyBonded(_)
            | Self::AlreadyBonding(_)
      )
   }
}

/// Convenience type alias for Results with `RadioError`.
pub type Result<T> = std::result::Result<T, RadioError>;
