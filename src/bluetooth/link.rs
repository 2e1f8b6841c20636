//! Platform link to a single accessory.
//!
//! A [`Peripheral`] performs the connection-level phases a session drives:
//! scanning with a single service-UUID filter, connecting, discovering the
//! target service and releasing the connection. Link loss is reported
//! through a `watch` channel, so duplicate or late notifications collapse
//! into the latest [`LinkState`].

use std::future::Future;

use tokio::sync::watch;
use uuid::Uuid;

use crate::{bluetooth::backend::DeviceId, error::Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
   Idle,
   Connected,
   Disconnected,
}

/// Characteristics found on the discovered target service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLayout {
   pub service: Uuid,
   pub characteristics: Vec<Uuid>,
}

impl ServiceLayout {
   pub fn contains(&self, characteristic: Uuid) -> bool {
      self.characteristics.contains(&characteristic)
   }
}

pub trait Peripheral: Send {
   /// Subscribes to link-state changes.
   fn link_state(&self) -> watch::Receiver<LinkState>;

   /// Finds the first device advertising `service`.
   fn scan(&mut self, service: Uuid) -> impl Future<Output = Result<DeviceId>> + Send;

   fn connect(&mut self, device: &DeviceId) -> impl Future<Output = Result<()>> + Send;

   /// Resolves services and returns the layout of the first `service` match.
   fn discover(
      &mut self,
      device: &DeviceId,
      service: Uuid,
   ) -> impl Future<Output = Result<ServiceLayout>> + Send;

   /// Releases the connection handle. Must be idempotent.
   fn release(&mut self) -> impl Future<Output = ()> + Send;
}

#[cfg(target_os = "linux")]
pub use bluez_link::BluerPeripheral;

#[cfg(target_os = "linux")]
mod bluez_link {
   use std::{collections::HashSet, pin::pin, time::Duration};

   use bluer::{
      Adapter, AdapterEvent, AddressType, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
      DiscoveryTransport, Session,
   };
   use futures::{Stream, StreamExt};
   use log::{debug, info, warn};
   use tokio::{sync::watch, task::JoinHandle, time};
   use uuid::Uuid;

   use super::{LinkState, Peripheral, ServiceLayout};
   use crate::{
      bluetooth::backend::{AddressKind, DeviceId},
      config::Config,
      error::{BleError, BleErrorKind, Error, Result},
   };

   /// Interval between service-resolution checks after connecting
   const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);

   /// BlueZ-backed link driven through `bluer`.
   pub struct BluerPeripheral {
      adapter: Adapter,
      scan_timeout: Duration,
      connect_timeout: Duration,
      device: Option<Device>,
      /// Whether this link brought the connection up (and must tear it down)
      connected_here: bool,
      link_tx: watch::Sender<LinkState>,
      monitor: Option<JoinHandle<()>>,
   }

   impl BluerPeripheral {
      pub async fn new(session: &Session, config: &Config) -> Result<Self> {
         let adapter = match config.adapter.as_deref() {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
         };

         if let Ok(powered) = adapter.is_powered().await
            && !powered
         {
            adapter.set_powered(true).await?;
            info!("Powered on adapter: {}", adapter.name());
         }

         let (link_tx, _) = watch::channel(LinkState::Idle);
         Ok(Self {
            adapter,
            scan_timeout: config.scan_timeout(),
            connect_timeout: config.connect_timeout(),
            device: None,
            connected_here: false,
            link_tx,
            monitor: None,
         })
      }

      fn device(&self) -> Result<&Device> {
         self
            .device
            .as_ref()
            .ok_or_else(|| BleError::new(BleErrorKind::DeviceNotFound).into())
      }

      async fn wait_services_resolved(&self) -> Result<()> {
         let device = self.device()?;
         let poll = async {
            while !device.is_services_resolved().await? {
               time::sleep(SERVICES_POLL_INTERVAL).await;
            }
            Ok::<_, Error>(())
         };
         time::timeout(self.connect_timeout, poll)
            .await
            .map_err(|_| Error::RequestTimeout)?
      }
   }

   async fn first_advertiser(
      adapter: &Adapter,
      events: impl Stream<Item = AdapterEvent>,
      service: Uuid,
   ) -> Option<Device> {
      let mut events = pin!(events);
      while let Some(event) = events.next().await {
         let AdapterEvent::DeviceAdded(addr) = event else {
            continue;
         };
         let Ok(device) = adapter.device(addr) else {
            continue;
         };
         if let Ok(Some(uuids)) = device.uuids().await
            && uuids.contains(&service)
         {
            return Some(device);
         }
         debug!("Skipping {addr}: does not advertise {service}");
      }
      None
   }

   fn spawn_link_monitor(
      device: Device,
      events: impl Stream<Item = DeviceEvent> + Send + 'static,
      link: watch::Sender<LinkState>,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let mut events = pin!(events);
         while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
               warn!("Link to {} lost", device.address());
               link.send_replace(LinkState::Disconnected);
               return;
            }
         }
      })
   }

   impl Peripheral for BluerPeripheral {
      fn link_state(&self) -> watch::Receiver<LinkState> {
         self.link_tx.subscribe()
      }

      async fn scan(&mut self, service: Uuid) -> Result<DeviceId> {
         let mut filter = DiscoveryFilter::default();
         filter.uuids = HashSet::from([service]);
         filter.transport = DiscoveryTransport::Le;
         self.adapter.set_discovery_filter(filter).await?;

         info!("Scanning on {} for {service}", self.adapter.name());
         let events = self.adapter.discover_devices().await?;
         let device = time::timeout(
            self.scan_timeout,
            first_advertiser(&self.adapter, events, service),
         )
         .await
         .map_err(|_| Error::ScanTimeout)?
         .ok_or_else(|| BleError::with_message(BleErrorKind::DeviceNotFound, "discovery ended"))?;

         let kind = match device.address_type().await? {
            AddressType::LeRandom => AddressKind::Random,
            _ => AddressKind::Public,
         };
         let id = DeviceId::bluez(self.adapter.name(), device.address().0, kind);
         info!("Found {} at {id}", device.address());
         self.device = Some(device);
         Ok(id)
      }

      async fn connect(&mut self, id: &DeviceId) -> Result<()> {
         let device = self.device()?.clone();
         if device.is_connected().await? {
            debug!("{id} already connected by the system");
         } else {
            debug!("Connecting to {id}");
            time::timeout(self.connect_timeout, device.connect())
               .await
               .map_err(|_| Error::RequestTimeout)??;
            self.connected_here = true;
         }

         let events = device.events().await?;
         self.link_tx.send_replace(LinkState::Connected);
         self.monitor = Some(spawn_link_monitor(device, events, self.link_tx.clone()));
         Ok(())
      }

      async fn discover(&mut self, id: &DeviceId, service: Uuid) -> Result<ServiceLayout> {
         self.wait_services_resolved().await?;

         let mut services = self.device()?.services().await?;
         services.sort_by_key(bluer::gatt::remote::Service::id);
         for candidate in services {
            if candidate.uuid().await? != service {
               continue;
            }
            let mut characteristics = candidate.characteristics().await?;
            characteristics.sort_by_key(bluer::gatt::remote::Characteristic::id);

            let mut uuids = Vec::with_capacity(characteristics.len());
            for characteristic in characteristics {
               uuids.push(characteristic.uuid().await?);
            }
            debug!("{id}: service {service} exposes {uuids:?}");
            return Ok(ServiceLayout {
               service,
               characteristics: uuids,
            });
         }

         Err(BleError::with_message(BleErrorKind::ServiceNotFound, service.to_string()).into())
      }

      async fn release(&mut self) {
         if let Some(handle) = self.monitor.take() {
            handle.abort();
         }
         if let Some(device) = self.device.take()
            && std::mem::take(&mut self.connected_here)
         {
            match device.disconnect().await {
               Ok(()) => info!("Disconnected from {}", device.address()),
               Err(e) => warn!("Failed to disconnect {}: {e}", device.address()),
            }
         }
         self.link_tx.send_replace(LinkState::Idle);
      }
   }
}
