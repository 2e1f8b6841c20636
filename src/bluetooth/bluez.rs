//! BlueZ system-bus backend.
//!
//! Resolves a characteristic through `org.freedesktop.DBus.ObjectManager`
//! and reads it with `org.bluez.GattCharacteristic1.ReadValue`. Every read
//! opens its own system-bus connection and drops it once the reply has been
//! drained.

use std::{collections::HashMap, time::Duration};

use log::{debug, warn};
use tokio::time;
use uuid::Uuid;
use zbus::{Connection, fdo::ObjectManagerProxy, zvariant::Value};

use crate::{
   bluetooth::backend::{BleBackend, CharacteristicAddress},
   config::Config,
   error::{BleError, BleErrorKind},
};

const BLUEZ_SERVICE: &str = "org.bluez";
const IFACE_DEVICE: &str = "org.bluez.Device1";
const IFACE_SERVICE: &str = "org.bluez.GattService1";
const IFACE_CHARACTERISTIC: &str = "org.bluez.GattCharacteristic1";

/// Wait budget for every bus round-trip.
const BUS_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum GattNode {
   Device,
   Service(Uuid),
   Characteristic(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GattObject {
   path: String,
   node: GattNode,
}

/// System-bus backend talking to `bluetoothd`.
#[derive(Debug, Clone)]
pub struct BluezBackend {
   call_timeout: Duration,
}

impl Default for BluezBackend {
   fn default() -> Self {
      Self {
         call_timeout: BUS_CALL_TIMEOUT,
      }
   }
}

impl BluezBackend {
   pub fn from_config(_config: &Config) -> Self {
      Self::default()
   }

   async fn connect(&self) -> Result<Connection, BleError> {
      time::timeout(self.call_timeout, Connection::system())
         .await
         .map_err(|_| {
            BleError::with_message(BleErrorKind::BusConnectFailed, "system bus connect timed out")
         })?
         .map_err(|e| BleError::with_message(BleErrorKind::BusConnectFailed, e.to_string()))
   }

   async fn gatt_objects(&self, conn: &Connection) -> Result<Vec<GattObject>, BleError> {
      let fetch = async {
         let proxy = ObjectManagerProxy::builder(conn)
            .destination(BLUEZ_SERVICE)?
            .path("/")?
            .build()
            .await?;
         proxy.get_managed_objects().await.map_err(zbus::Error::from)
      };
      let objects = time::timeout(self.call_timeout, fetch)
         .await
         .map_err(|_| {
            BleError::with_message(BleErrorKind::BusCallFailed, "GetManagedObjects timed out")
         })?
         .map_err(|e| BleError::with_message(BleErrorKind::BusCallFailed, e.to_string()))?;

      let mut nodes = Vec::new();
      for (path, interfaces) in objects {
         for (iface, props) in interfaces {
            let uuid = || {
               props
                  .get("UUID")
                  .and_then(|v| v.downcast_ref::<String>().ok())
                  .and_then(|s| Uuid::parse_str(&s).ok())
            };
            let node = match iface.as_str() {
               IFACE_DEVICE => Some(GattNode::Device),
               IFACE_SERVICE => uuid().map(GattNode::Service),
               IFACE_CHARACTERISTIC => uuid().map(GattNode::Characteristic),
               _ => None,
            };
            if let Some(node) = node {
               nodes.push(GattObject {
                  path: path.as_str().to_owned(),
                  node,
               });
            }
         }
      }
      Ok(nodes)
   }

   async fn read_value(&self, conn: &Connection, path: &str) -> Result<Vec<u8>, BleError> {
      let options: HashMap<&str, Value<'_>> = HashMap::new();
      let reply = time::timeout(
         self.call_timeout,
         conn.call_method(
            Some(BLUEZ_SERVICE),
            path,
            Some(IFACE_CHARACTERISTIC),
            "ReadValue",
            &(options,),
         ),
      )
      .await
      .map_err(|_| BleError::with_message(BleErrorKind::BusCallFailed, "ReadValue timed out"))?
      .map_err(|e| BleError::with_message(BleErrorKind::BusCallFailed, e.to_string()))?;

      let body = reply.body();
      body
         .deserialize::<Vec<u8>>()
         .map_err(|e| BleError::with_message(BleErrorKind::MalformedReply, e.to_string()))
   }
}

impl BleBackend for BluezBackend {
   async fn read_characteristic(&self, addr: &CharacteristicAddress) -> Result<Vec<u8>, BleError> {
      let conn = self.connect().await?;
      let objects = self.gatt_objects(&conn).await?;
      let path = resolve_characteristic(&objects, addr)?;
      debug!("Reading {addr} via {path}");

      let value = self.read_value(&conn, &path).await.inspect_err(|e| {
         warn!("ReadValue on {path} failed: {e}");
      })?;
      debug!("← {path}: {}", hex::encode(&value));
      Ok(value)
   }
}

/// Picks the characteristic object path for `addr`. The lowest object path
/// wins when several services or characteristics share a UUID.
fn resolve_characteristic(
   objects: &[GattObject],
   addr: &CharacteristicAddress,
) -> Result<String, BleError> {
   let device = addr.device.as_str();
   if !objects
      .iter()
      .any(|o| o.path == device && o.node == GattNode::Device)
   {
      return Err(BleError::with_message(BleErrorKind::DeviceNotFound, device));
   }

   let service = first_child(objects, device, &GattNode::Service(addr.service)).ok_or_else(|| {
      BleError::with_message(BleErrorKind::ServiceNotFound, addr.service.to_string())
   })?;

   let characteristic = first_child(
      objects,
      service,
      &GattNode::Characteristic(addr.characteristic),
   )
   .ok_or_else(|| {
      BleError::with_message(
         BleErrorKind::CharacteristicNotFound,
         addr.characteristic.to_string(),
      )
   })?;

   Ok(characteristic.to_owned())
}

fn first_child<'a>(objects: &'a [GattObject], parent: &str, node: &GattNode) -> Option<&'a str> {
   objects
      .iter()
      .filter(|o| &o.node == node)
      .filter(|o| {
         o.path
            .strip_prefix(parent)
            .is_some_and(|rest| rest.starts_with('/'))
      })
      .map(|o| o.path.as_str())
      .min()
}
