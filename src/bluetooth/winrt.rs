//! WinRT component-object backend.
//!
//! Uses `Windows.Devices.Bluetooth` to resolve the device, the first
//! matching service and characteristic, then reads the value uncached.
//! The WinRT calls block a worker thread; the caller awaits the worker
//! under an explicit timeout instead of inheriting the stack's own.

use std::time::Duration;

use log::{debug, warn};
use tokio::{task, time};
use uuid::Uuid;
use windows::{
   Devices::Bluetooth::{
      BluetoothCacheMode, BluetoothLEDevice,
      GenericAttributeProfile::{GattCharacteristic, GattCommunicationStatus},
   },
   Storage::Streams::DataReader,
   Win32::System::Com::{COINIT_MULTITHREADED, CoInitializeEx},
   core::{GUID, HSTRING},
};

use crate::{
   bluetooth::backend::{BleBackend, CharacteristicAddress},
   config::Config,
   error::{BleError, BleErrorKind},
};

/// Component-object backend.
#[derive(Debug, Clone)]
pub struct WinRtBackend {
   read_timeout: Duration,
}

impl WinRtBackend {
   pub fn from_config(config: &Config) -> Self {
      Self {
         read_timeout: config.read_timeout(),
      }
   }
}

impl BleBackend for WinRtBackend {
   async fn read_characteristic(&self, addr: &CharacteristicAddress) -> Result<Vec<u8>, BleError> {
      let device_id = HSTRING::from(addr.device.as_str());
      let service = guid(addr.service);
      let characteristic = guid(addr.characteristic);

      let worker = task::spawn_blocking(move || read_blocking(&device_id, service, characteristic));
      let value = time::timeout(self.read_timeout, worker)
         .await
         .map_err(|_| {
            warn!("WinRT read of {addr} exceeded {:?}", self.read_timeout);
            BleError::with_message(BleErrorKind::ReadFailed, "read timed out")
         })?
         .map_err(|e| BleError::with_message(BleErrorKind::ReadFailed, e.to_string()))??;

      debug!("← {addr}: {}", hex::encode(&value));
      Ok(value)
   }
}

fn guid(uuid: Uuid) -> GUID {
   GUID::from_u128(uuid.as_u128())
}

fn native(kind: BleErrorKind) -> impl FnOnce(windows::core::Error) -> BleError {
   move |e| BleError::with_message(kind, e.message().to_string())
}

fn read_blocking(
   device_id: &HSTRING,
   service_uuid: GUID,
   characteristic_uuid: GUID,
) -> Result<Vec<u8>, BleError> {
   // Already-initialized apartments report S_FALSE or RPC_E_CHANGED_MODE; both are usable.
   let _ = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };

   let device = BluetoothLEDevice::FromIdAsync(device_id)
      .and_then(|op| op.get())
      .map_err(native(BleErrorKind::DeviceNotFound))?;

   let result = read_from_device(&device, service_uuid, characteristic_uuid);
   if let Err(e) = device.Close() {
      warn!("Failed to close BluetoothLEDevice: {}", e.message());
   }
   result
}

fn read_from_device(
   device: &BluetoothLEDevice,
   service_uuid: GUID,
   characteristic_uuid: GUID,
) -> Result<Vec<u8>, BleError> {
   let services = device
      .GetGattServicesForUuidAsync(service_uuid)
      .and_then(|op| op.get())
      .map_err(native(BleErrorKind::ServiceNotFound))?;
   if services.Status().ok() != Some(GattCommunicationStatus::Success) {
      return Err(BleError::with_message(
         BleErrorKind::ServiceNotFound,
         "service query did not succeed",
      ));
   }
   let service = services
      .Services()
      .and_then(|list| list.GetAt(0))
      .map_err(|_| BleError::new(BleErrorKind::ServiceNotFound))?;

   let characteristics = service
      .GetCharacteristicsForUuidAsync(characteristic_uuid)
      .and_then(|op| op.get())
      .map_err(native(BleErrorKind::CharacteristicNotFound))?;
   if characteristics.Status().ok() != Some(GattCommunicationStatus::Success) {
      return Err(BleError::with_message(
         BleErrorKind::CharacteristicNotFound,
         "characteristic query did not succeed",
      ));
   }
   let characteristic: GattCharacteristic = characteristics
      .Characteristics()
      .and_then(|list| list.GetAt(0))
      .map_err(|_| BleError::new(BleErrorKind::CharacteristicNotFound))?;

   let read = characteristic
      .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)
      .and_then(|op| op.get())
      .map_err(native(BleErrorKind::ReadFailed))?;
   let status = read.Status().map_err(native(BleErrorKind::ReadFailed))?;
   if status != GattCommunicationStatus::Success {
      return Err(BleError::with_message(
         BleErrorKind::ReadFailed,
         format!("GATT status {}", status.0),
      ));
   }

   let buffer = read.Value().map_err(native(BleErrorKind::ReadFailed))?;
   let reader = DataReader::FromBuffer(&buffer).map_err(native(BleErrorKind::ReadFailed))?;
   let len = reader
      .UnconsumedBufferLength()
      .map_err(native(BleErrorKind::ReadFailed))?;
   let mut value = vec![0u8; len as usize];
   reader
      .ReadBytes(&mut value)
      .map_err(native(BleErrorKind::ReadFailed))?;
   Ok(value)
}
