//! Model identification for `AirPods` identity payloads.
//!
//! The first two bytes of the identity payload carry a little-endian
//! model identifier. [`identify`] maps them to a display name without
//! allocating.

use std::fmt;

/// Known `AirPods` models, keyed by their raw identifier.
#[repr(u16)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
   strum::EnumIter,
)]
pub enum AccessoryModel {
   #[strum(serialize = "AirPods (Unknown model)")]
   Unknown = 0x0000,
   #[strum(serialize = "AirPods (1st gen)")]
   AirPods1 = 0x2002,
   #[strum(serialize = "AirPods (2nd gen)")]
   AirPods2 = 0x2008,
   #[strum(serialize = "AirPods (3rd gen)")]
   AirPods3 = 0x2015,
   #[strum(serialize = "AirPods 4")]
   AirPods4 = 0x2019,
   #[strum(serialize = "AirPods 4 (ANC)")]
   AirPods4Anc = 0x201B,
   #[strum(serialize = "AirPods Pro")]
   AirPodsPro = 0x2101,
   #[strum(serialize = "AirPods Pro (2nd gen)")]
   AirPodsPro2 = 0x2201,
   #[strum(serialize = "AirPods Max")]
   AirPodsMax = 0x2301,
}

impl AccessoryModel {
   /// Looks up a raw identifier. `Unknown` is never a hit.
   pub fn from_id(raw: u16) -> Option<Self> {
      Self::from_repr(raw).filter(|m| *m != Self::Unknown)
   }

   pub const fn id(self) -> u16 {
      self as u16
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Result of decoding an identity payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayName {
   /// Payload shorter than two bytes.
   Unknown,
   Known(AccessoryModel),
   /// Identifier not present in the model table.
   Unrecognized(u16),
}

impl DisplayName {
   pub const fn model(self) -> Option<AccessoryModel> {
      match self {
         Self::Known(model) => Some(model),
         _ => None,
      }
   }
}

impl fmt::Display for DisplayName {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Unknown => f.write_str(AccessoryModel::Unknown.to_str()),
         Self::Known(model) => f.write_str(model.to_str()),
         Self::Unrecognized(raw) => write!(f, "AirPods (0x{raw:04X})"),
      }
   }
}

/// Reads the little-endian identifier from the head of `bytes`.
pub fn raw_identifier(bytes: &[u8]) -> Option<u16> {
   let head: [u8; 2] = bytes.get(..2)?.try_into().ok()?;
   Some(u16::from_le_bytes(head))
}

/// Decodes an identity payload into a display name.
pub fn identify(bytes: &[u8]) -> DisplayName {
   match raw_identifier(bytes) {
      None => DisplayName::Unknown,
      Some(raw) => {
         AccessoryModel::from_id(raw).map_or(DisplayName::Unrecognized(raw), DisplayName::Known)
      },
   }
}
