//! Bluetooth access for `AirPods` identification.
//!
//! This module provides the per-platform characteristic backends, the
//! L2CAP channel negotiator and the link used to scan and connect.

pub mod backend;
#[cfg(target_os = "linux")]
pub mod bluez;
pub mod l2cap;
pub mod link;
#[cfg(windows)]
pub mod winrt;
