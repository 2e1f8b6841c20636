//! GATT contract and channel framing for `AirPods` identity exchange.
//!
//! This module contains the well-known UUIDs, the identity request frame
//! sent over a connection-oriented channel, and the decoder for the
//! channel-descriptor payload.

use uuid::Uuid;

use crate::error::{BleError, BleErrorKind};

/// Primary vendor service exposing the identity characteristic.
pub const PRIMARY_SERVICE: Uuid = Uuid::from_u128(0xd0611e78_bbb4_4591_a5f8_487910ae4366);
/// Identity characteristic carrying the model identifier.
pub const PRIMARY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x8667556c_9a37_4c91_84ed_54ee27d90049);
/// Channel descriptor characteristic carrying the CoC PSM.
pub const CHANNEL_DESCRIPTOR: Uuid = Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb);

/// Identity request frame: opcode 0x01, reserved byte.
pub const PKT_IDENTITY_REQUEST: &[u8] = &[0x01, 0x00];

/// Decodes the little-endian PSM carried by the channel descriptor.
pub fn decode_psm(payload: &[u8]) -> Result<u16, BleError> {
   let Some(head) = payload.get(..2) else {
      return Err(BleError::with_message(
         BleErrorKind::MalformedReply,
         format!("channel descriptor too short: {} bytes", payload.len()),
      ));
   };
   match u16::from_le_bytes([head[0], head[1]]) {
      0 => Err(BleError::with_message(
         BleErrorKind::MalformedReply,
         "channel descriptor carries PSM 0",
      )),
      psm => Ok(psm),
   }
}
