//! BLE access layer for identifying `AirPods` accessories.
//!
//! A [`session::DeviceSession`] scans for the vendor service, connects,
//! tries an L2CAP connection-oriented channel when the platform allows it
//! and falls back to a plain GATT read once. The read itself goes through
//! whichever [`bluetooth::backend::BleBackend`] the target compiles in.

pub mod airpods;
pub mod bluetooth;
pub mod config;
#[cfg(target_os = "linux")]
pub mod dbus;
pub mod error;
pub mod ffi;
#[cfg(target_os = "linux")]
pub mod prober;
pub mod session;

pub use airpods::model::{AccessoryModel, DisplayName, identify};
pub use error::{BleError, BleErrorKind, Error, Result};
