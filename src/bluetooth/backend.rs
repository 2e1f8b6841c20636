//! Backend-neutral characteristic reads.
//!
//! Exactly one [`BleBackend`] implementation is compiled in per target:
//! the BlueZ system-bus backend on Linux, the WinRT backend on Windows.
//! [`PlatformBackend`] names it so callers never branch on the platform.

use std::{fmt, future::Future};

use smol_str::{SmolStr, format_smolstr};
use uuid::Uuid;

use crate::{config::Config, error::BleError};

/// LE address kind of a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressKind {
   #[default]
   Public,
   Random,
}

/// Platform-specific device identifier.
///
/// On BlueZ this is the device object path, on Windows the device
/// interface id handed out by the OS.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId {
   id: SmolStr,
   kind: AddressKind,
}

impl DeviceId {
   pub fn new(id: impl Into<SmolStr>) -> Self {
      Self {
         id: id.into(),
         kind: AddressKind::Public,
      }
   }

   /// Builds the BlueZ object path of `mac` on `adapter`.
   pub fn bluez(adapter: &str, mac: [u8; 6], kind: AddressKind) -> Self {
      let [a, b, c, d, e, f] = mac;
      Self {
         id: format_smolstr!(
            "/org/bluez/{adapter}/dev_{a:02X}_{b:02X}_{c:02X}_{d:02X}_{e:02X}_{f:02X}"
         ),
         kind,
      }
   }

   pub const fn with_address_kind(mut self, kind: AddressKind) -> Self {
      self.kind = kind;
      self
   }

   pub fn as_str(&self) -> &str {
      &self.id
   }

   pub const fn address_kind(&self) -> AddressKind {
      self.kind
   }

   /// Recovers the MAC address from a BlueZ device path.
   pub fn mac(&self) -> Option<[u8; 6]> {
      let node = self.id.rsplit('/').next()?.strip_prefix("dev_")?;
      let mut mac = [0u8; 6];
      let mut parts = node.split('_');
      for byte in &mut mac {
         *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
      }
      parts.next().is_none().then_some(mac)
   }
}

impl fmt::Display for DeviceId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.id)
   }
}

/// Identifies one GATT characteristic on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicAddress {
   pub device: DeviceId,
   pub service: Uuid,
   pub characteristic: Uuid,
}

impl CharacteristicAddress {
   pub const fn new(device: DeviceId, service: Uuid, characteristic: Uuid) -> Self {
      Self {
         device,
         service,
         characteristic,
      }
   }
}

impl fmt::Display for CharacteristicAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{} [{} / {}]", self.device, self.service, self.characteristic)
   }
}

/// A platform BLE stack able to read one characteristic value.
///
/// Implementations resolve device, service and characteristic in that
/// order, taking the first match at each level, and convert every native
/// failure into a [`BleError`].
pub trait BleBackend: Send + Sync {
   fn read_characteristic(
      &self,
      addr: &CharacteristicAddress,
   ) -> impl Future<Output = Result<Vec<u8>, BleError>> + Send;
}

#[cfg(target_os = "linux")]
pub type PlatformBackend = super::bluez::BluezBackend;

#[cfg(windows)]
pub type PlatformBackend = super::winrt::WinRtBackend;

#[cfg(not(any(target_os = "linux", windows)))]
pub type PlatformBackend = UnsupportedBackend;

/// Returns the backend compiled in for this target.
pub fn platform_backend(config: &Config) -> PlatformBackend {
   PlatformBackend::from_config(config)
}

/// Backend for targets without a supported BLE stack.
#[cfg(not(any(target_os = "linux", windows)))]
#[derive(Debug, Default)]
pub struct UnsupportedBackend;

#[cfg(not(any(target_os = "linux", windows)))]
impl UnsupportedBackend {
   pub const fn from_config(_config: &Config) -> Self {
      Self
   }
}

#[cfg(not(any(target_os = "linux", windows)))]
impl BleBackend for UnsupportedBackend {
   async fn read_characteristic(&self, addr: &CharacteristicAddress) -> Result<Vec<u8>, BleError> {
      log::warn!("No BLE backend available to read {addr}");
      Err(BleError::with_message(
         crate::error::BleErrorKind::ReadFailed,
         "no BLE backend for this platform",
      ))
   }
}
