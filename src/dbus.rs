use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{bluetooth::backend::DeviceId, prober::Prober, session::SessionReport};

pub const SERVICE_NAME: &str = "org.podprobe";
pub const OBJECT_PATH: &str = "/org/podprobe/probe";

pub struct ProbeService {
   prober: Prober,
}

impl ProbeService {
   pub const fn new(prober: Prober) -> Self {
      Self { prober }
   }

   /// Emits the signals matching a finished probe.
   pub async fn announce(
      &self,
      emitter: &SignalEmitter<'_>,
      report: &SessionReport,
   ) -> zbus::Result<()> {
      match report.model {
         Some(model) => {
            let device = report.device.as_ref().map_or("", DeviceId::as_str);
            Self::device_identified(emitter, device, &model.to_string()).await?;
            self.model_changed(emitter).await
         },
         None => {
            let error = report
               .error
               .as_ref()
               .map_or_else(|| "unknown error".to_owned(), ToString::to_string);
            Self::probe_failed(emitter, &error).await
         },
      }
   }
}

#[interface(name = "org.podprobe.Probe")]
impl ProbeService {
   async fn probe(
      &self,
      #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
   ) -> zbus::fdo::Result<String> {
      info!("Probe requested over D-Bus");
      let report = self.prober.probe().await;
      self.announce(&emitter, &report).await?;
      Ok(report.to_json().to_string())
   }

   #[zbus(property)]
   async fn model(&self) -> String {
      self
         .prober
         .model()
         .map(|m| m.to_string())
         .unwrap_or_default()
   }

   #[zbus(property)]
   async fn prefer_l2cap(&self) -> bool {
      self.prober.prefer_l2cap()
   }

   #[zbus(property)]
   async fn set_prefer_l2cap(&self, prefer: bool) -> zbus::fdo::Result<()> {
      self
         .prober
         .set_prefer_l2cap(prefer)
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   #[zbus(signal)]
   pub async fn device_identified(
      emitter: &SignalEmitter<'_>,
      device: &str,
      model: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn probe_failed(emitter: &SignalEmitter<'_>, error: &str) -> zbus::Result<()>;
}
