//! `podprobe` service
//!
//! On Linux this exposes a D-Bus interface for identifying nearby `AirPods`
//! and runs one probe at startup. Elsewhere it reads the identity
//! characteristic of the device id given on the command line.

use log::info;

use podprobe::{config::Config, error::Result};

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<()> {
   use log::warn;
   use podprobe::{
      dbus::{self, ProbeService},
      prober::Prober,
   };
   use tokio::signal;
   use zbus::connection;

   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting podprobe D-Bus service...");

   let config = Config::load()?;
   info!(
      "Loaded configuration (prefer_l2cap: {}, adapter: {})",
      config.prefer_l2cap,
      config.adapter.as_deref().unwrap_or("default")
   );

   let prober = Prober::new(config);
   let service = ProbeService::new(prober.clone());

   let connection = connection::Builder::session()?
      .name(dbus::SERVICE_NAME)?
      .serve_at(dbus::OBJECT_PATH, service)?
      .build()
      .await?;

   info!("podprobe D-Bus service started at {}", dbus::SERVICE_NAME);

   let iface = connection
      .object_server()
      .interface::<_, ProbeService>(dbus::OBJECT_PATH)
      .await?;
   tokio::spawn(async move {
      let report = prober.probe().await;
      info!("Startup probe: {}", report.to_json());
      let announced = iface.get().await.announce(iface.signal_emitter(), &report).await;
      if let Err(e) = announced {
         warn!("Error announcing startup probe: {e}");
      }
   });

   signal::ctrl_c().await?;
   info!("Shutting down podprobe service...");

   Ok(())
}

#[cfg(not(target_os = "linux"))]
#[tokio::main]
async fn main() -> Result<()> {
   use podprobe::{
      BleError, BleErrorKind,
      airpods::protocol::{PRIMARY_CHARACTERISTIC, PRIMARY_SERVICE},
      bluetooth::backend::{BleBackend, CharacteristicAddress, DeviceId, platform_backend},
      identify,
   };

   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   let Some(device) = std::env::args().nth(1) else {
      log::error!("usage: podprobed <device-id>");
      return Ok(());
   };

   let config = Config::load()?;
   let backend = platform_backend(&config);
   let addr = CharacteristicAddress::new(
      DeviceId::new(device),
      PRIMARY_SERVICE,
      PRIMARY_CHARACTERISTIC,
   );
   info!("Reading {addr}");

   let payload = backend.read_characteristic(&addr).await?;
   if payload.is_empty() {
      return Err(
         BleError::with_message(BleErrorKind::MalformedReply, "empty identity payload").into(),
      );
   }
   println!("{}", identify(&payload));
   Ok(())
}
