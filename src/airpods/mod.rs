//! `AirPods` payload decoding and GATT contract.
//!
//! This module contains the model table, the identifier decoder and the
//! protocol constants shared by every transport.

pub mod model;
pub mod protocol;
