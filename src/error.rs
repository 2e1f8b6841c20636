//! Error types for the BLE access layer.
//!
//! Platform backends and the CoC negotiator recover every native failure
//! into a [`BleError`]; everything above them (session, config, service)
//! reports through the crate-wide [`Error`].

use thiserror::Error;

/// Failure categories shared by every platform backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum BleErrorKind {
   #[strum(serialize = "device not found")]
   DeviceNotFound,
   #[strum(serialize = "service not found")]
   ServiceNotFound,
   #[strum(serialize = "characteristic not found")]
   CharacteristicNotFound,
   #[strum(serialize = "read failed")]
   ReadFailed,
   #[strum(serialize = "bus connect failed")]
   BusConnectFailed,
   #[strum(serialize = "bus call failed")]
   BusCallFailed,
   #[strum(serialize = "CoC unsupported")]
   CocUnsupported,
   #[strum(serialize = "CoC connect failed")]
   CocConnectFailed,
   #[strum(serialize = "malformed reply")]
   MalformedReply,
}

/// Recovered backend failure with an optional human-readable detail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}{}", detail(.message))]
pub struct BleError {
   pub kind: BleErrorKind,
   pub message: Option<String>,
}

impl BleError {
   pub const fn new(kind: BleErrorKind) -> Self {
      Self {
         kind,
         message: None,
      }
   }

   pub fn with_message(kind: BleErrorKind, message: impl Into<String>) -> Self {
      Self {
         kind,
         message: Some(message.into()),
      }
   }
}

fn detail(message: &Option<String>) -> String {
   message.as_deref().map(|m| format!(": {m}")).unwrap_or_default()
}

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
   #[error("BLE error: {0}")]
   Ble(#[from] BleError),

   #[cfg(target_os = "linux")]
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[cfg(target_os = "linux")]
   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[cfg(target_os = "linux")]
   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("No advertising device found before the scan timed out")]
   ScanTimeout,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Device disconnected")]
   Disconnected,

   #[error("Session already terminated")]
   SessionTerminated,

   #[error("Prober has shut down")]
   ProberShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl Error {
   /// Returns the backend failure kind, if this error came from a backend.
   pub const fn ble_kind(&self) -> Option<BleErrorKind> {
      match self {
         Self::Ble(e) => Some(e.kind),
         _ => None,
      }
   }
}

/// Convenience type alias for Results with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_ble_error_display() {
      let bare = BleError::new(BleErrorKind::ServiceNotFound);
      assert_eq!(bare.to_string(), "service not found");

      let detailed = BleError::with_message(BleErrorKind::BusCallFailed, "ReadValue timed out");
      assert_eq!(detailed.to_string(), "bus call failed: ReadValue timed out");
   }

   #[test]
   fn test_ble_kind_passthrough() {
      let err: Error = BleError::new(BleErrorKind::CocConnectFailed).into();
      assert_eq!(err.ble_kind(), Some(BleErrorKind::CocConnectFailed));
      assert_eq!(Error::Disconnected.ble_kind(), None);
   }
}
