//! Serialized probe runner.
//!
//! Probes share one adapter, so they never overlap: every request is queued
//! to a single actor that owns the `bluer` session and runs one
//! [`DeviceSession`] at a time.

use std::sync::Arc;

use bluer::Session;
use log::{error, info};
use parking_lot::Mutex;
use smol_str::{SmolStr, ToSmolStr};
use tokio::sync::{mpsc, oneshot};

use crate::{
   bluetooth::{
      backend::{PlatformBackend, platform_backend},
      l2cap::L2capNegotiator,
      link::BluerPeripheral,
   },
   config::Config,
   error::{Error, Result},
   session::{ConnectionPreference, DeviceSession, SessionReport},
};

/// Pending probe requests beyond which callers wait
const CHANNEL_BUFFER_SIZE: usize = 16;

#[derive(Debug)]
enum ProbeCommand {
   Probe(oneshot::Sender<SessionReport>),
}

struct Shared {
   config: Mutex<Config>,
   last_model: Mutex<Option<SmolStr>>,
}

/// Handle to the probe actor. Cheap to clone.
#[derive(Clone)]
pub struct Prober {
   inbox: mpsc::Sender<ProbeCommand>,
   shared: Arc<Shared>,
}

impl Prober {
   pub fn new(config: Config) -> Self {
      let shared = Arc::new(Shared {
         config: Mutex::new(config),
         last_model: Mutex::new(None),
      });
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ProbeActor::new(shared.clone(), command_rx).run());
      Self {
         inbox: command_tx,
         shared,
      }
   }

   /// Runs one identification session and waits for its report.
   pub async fn probe(&self) -> SessionReport {
      let (tx, rx) = oneshot::channel();
      if self.inbox.send(ProbeCommand::Probe(tx)).await.is_err() {
         return SessionReport::failed(None, Error::ProberShutdown);
      }
      rx.await
         .unwrap_or_else(|_| SessionReport::failed(None, Error::ProberShutdown))
   }

   /// Display name from the last successful probe.
   pub fn model(&self) -> Option<SmolStr> {
      self.shared.last_model.lock().clone()
   }

   pub fn prefer_l2cap(&self) -> bool {
      self.shared.config.lock().prefer_l2cap
   }

   /// Updates the persisted transport preference for later probes.
   pub fn set_prefer_l2cap(&self, prefer: bool) -> Result<()> {
      let mut config = self.shared.config.lock();
      config.prefer_l2cap = prefer;
      config.save()?;
      info!("Set prefer_l2cap to {prefer}");
      Ok(())
   }
}

struct ProbeActor {
   shared: Arc<Shared>,
   command_rx: mpsc::Receiver<ProbeCommand>,
   session: Option<Session>,
}

impl ProbeActor {
   const fn new(shared: Arc<Shared>, command_rx: mpsc::Receiver<ProbeCommand>) -> Self {
      Self {
         shared,
         command_rx,
         session: None,
      }
   }

   async fn run(mut self) {
      info!("Prober starting up");
      while let Some(command) = self.command_rx.recv().await {
         match command {
            ProbeCommand::Probe(reply) => {
               let report = self.probe_once().await;
               let _ = reply.send(report);
            },
         }
      }
      info!("Prober shutting down");
   }

   async fn probe_once(&mut self) -> SessionReport {
      let config = self.shared.config.lock().clone();
      let report = match self.start_session(&config).await {
         Ok(mut session) => session.run().await,
         Err(e) => {
            error!("Failed to set up probe: {e}");
            SessionReport::failed(None, e)
         },
      };
      if let Some(model) = report.model {
         *self.shared.last_model.lock() = Some(model.to_smolstr());
      }
      report
   }

   async fn start_session(
      &mut self,
      config: &Config,
   ) -> Result<DeviceSession<BluerPeripheral, PlatformBackend, L2capNegotiator>> {
      let bluer = self.bluer_session().await?;
      let peripheral = BluerPeripheral::new(&bluer, config).await?;
      Ok(DeviceSession::new(
         peripheral,
         platform_backend(config),
         L2capNegotiator::new(),
         ConnectionPreference::from(config),
      ))
   }

   async fn bluer_session(&mut self) -> Result<Session> {
      if let Some(session) = &self.session {
         return Ok(session.clone());
      }
      let session = Session::new().await?;
      self.session = Some(session.clone());
      Ok(session)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test]
   async fn test_preference_write_bypasses_probe_queue() {
      let dir = tempfile::tempdir().unwrap();
      // SAFETY: no other test reads or writes this variable
      unsafe { std::env::set_var("PODPROBE_HOME", dir.path()) };

      let prober = Prober::new(Config::default());
      assert!(prober.prefer_l2cap());
      assert_eq!(prober.model(), None);

      prober.set_prefer_l2cap(false).unwrap();
      assert!(!prober.prefer_l2cap());
      assert!(!Config::load().unwrap().prefer_l2cap);
   }
}
