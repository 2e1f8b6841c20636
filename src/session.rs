//! Per-device session state machine.
//!
//! A [`DeviceSession`] drives one identification attempt end to end:
//!
//! ```text
//! Idle → Scanning → Connecting → DiscoveringServices
//!      → {AttemptingCoc | ReadingCharacteristic} → Decoding → Terminated
//! ```
//!
//! The connection-oriented channel is tried at most once per session. Any
//! failure on that path falls back to the GATT read and clears the
//! in-memory preference, so the fallback happens exactly once. Link loss
//! observed during any phase terminates the session as a failure.

use std::future::{self, Future};

use futures::TryFutureExt;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::{select, sync::watch};

use crate::{
   airpods::{
      model::{DisplayName, identify},
      protocol::{
         CHANNEL_DESCRIPTOR, PKT_IDENTITY_REQUEST, PRIMARY_CHARACTERISTIC, PRIMARY_SERVICE,
         decode_psm,
      },
   },
   bluetooth::{
      backend::{BleBackend, CharacteristicAddress, DeviceId},
      l2cap::{CocCapability, CocNegotiator},
      link::{LinkState, Peripheral, ServiceLayout},
   },
   config::Config,
   error::{BleError, BleErrorKind, Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Outcome {
   Success,
   Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
   Idle,
   Scanning,
   Connecting,
   DiscoveringServices,
   AttemptingCoc,
   ReadingCharacteristic,
   Decoding,
   Terminated(Outcome),
}

/// Transport the identity payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Transport {
   Gatt,
   L2cap,
}

/// Whether a session should try the connection-oriented channel first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionPreference(bool);

impl ConnectionPreference {
   pub const fn new(prefer_coc: bool) -> Self {
      Self(prefer_coc)
   }

   pub const fn prefers_coc(self) -> bool {
      self.0
   }
}

impl From<&Config> for ConnectionPreference {
   fn from(config: &Config) -> Self {
      Self(config.prefer_l2cap)
   }
}

/// What a finished session produced.
#[derive(Debug)]
pub struct SessionReport {
   pub outcome: Outcome,
   pub device: Option<DeviceId>,
   pub transport: Option<Transport>,
   pub model: Option<DisplayName>,
   pub error: Option<Error>,
}

impl SessionReport {
   pub(crate) const fn failed(device: Option<DeviceId>, error: Error) -> Self {
      Self {
         outcome: Outcome::Failure,
         device,
         transport: None,
         model: None,
         error: Some(error),
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "outcome": <&'static str>::from(self.outcome),
         "device": self.device.as_ref().map(DeviceId::as_str),
         "transport": self.transport.map(<&'static str>::from),
         "model": self.model.map(|m| m.to_string()),
         "error": self.error.as_ref().map(ToString::to_string),
      })
   }
}

/// One identification attempt against one accessory.
pub struct DeviceSession<P, B, N> {
   peripheral: P,
   backend: B,
   negotiator: N,
   capability: CocCapability,
   prefer_coc: bool,
   coc_attempts: u32,
   state: SessionState,
}

impl<P, B, N> DeviceSession<P, B, N>
where
   P: Peripheral,
   B: BleBackend,
   N: CocNegotiator,
{
   /// Creates a session in `Idle`. The CoC capability is resolved here,
   /// once, and never re-probed.
   pub fn new(peripheral: P, backend: B, negotiator: N, preference: ConnectionPreference) -> Self {
      let capability = negotiator.capability();
      debug!("CoC capability: {capability:?}, preference: {preference:?}");
      Self {
         peripheral,
         backend,
         negotiator,
         capability,
         prefer_coc: preference.prefers_coc(),
         coc_attempts: 0,
         state: SessionState::Idle,
      }
   }

   pub const fn state(&self) -> SessionState {
      self.state
   }

   /// In-memory CoC preference; cleared after a failed CoC attempt.
   pub const fn prefers_coc(&self) -> bool {
      self.prefer_coc
   }

   pub const fn coc_attempts(&self) -> u32 {
      self.coc_attempts
   }

   pub const fn is_terminated(&self) -> bool {
      matches!(self.state, SessionState::Terminated(_))
   }

   /// Runs the session to `Terminated` and reports what it found.
   ///
   /// A terminated session accepts no further work: calling this again
   /// returns a failure report without touching the platform.
   pub async fn run(&mut self) -> SessionReport {
      if self.is_terminated() {
         warn!("Ignoring run on a terminated session");
         return SessionReport::failed(None, Error::SessionTerminated);
      }

      let mut link = self.peripheral.link_state();
      let mut device = None;
      let result = self.drive(&mut link, &mut device).await;
      self.terminate(device, result).await
   }

   async fn drive(
      &mut self,
      link: &mut watch::Receiver<LinkState>,
      found: &mut Option<DeviceId>,
   ) -> Result<(DisplayName, Transport)> {
      self.transition(SessionState::Scanning);
      let device = guarded(link, self.peripheral.scan(PRIMARY_SERVICE)).await?;
      *found = Some(device.clone());

      self.transition(SessionState::Connecting);
      guarded(link, self.peripheral.connect(&device)).await?;

      self.transition(SessionState::DiscoveringServices);
      let layout = guarded(link, self.peripheral.discover(&device, PRIMARY_SERVICE)).await?;

      let (payload, transport) = match self.try_coc(link, &device, &layout).await? {
         Some(payload) => (payload, Transport::L2cap),
         None => {
            self.transition(SessionState::ReadingCharacteristic);
            let addr =
               CharacteristicAddress::new(device.clone(), PRIMARY_SERVICE, PRIMARY_CHARACTERISTIC);
            let read = self.backend.read_characteristic(&addr).map_err(Error::from);
            (guarded(link, read).await?, Transport::Gatt)
         },
      };

      self.transition(SessionState::Decoding);
      debug!("Identity payload via {transport}: {}", hex::encode(&payload));
      if payload.is_empty() {
         return Err(
            BleError::with_message(BleErrorKind::MalformedReply, "empty identity payload").into(),
         );
      }
      Ok((identify(&payload), transport))
   }

   /// Attempts the CoC exchange if it is allowed. `Ok(None)` means the
   /// caller should read over GATT.
   async fn try_coc(
      &mut self,
      link: &mut watch::Receiver<LinkState>,
      device: &DeviceId,
      layout: &ServiceLayout,
   ) -> Result<Option<Vec<u8>>> {
      if !self.should_attempt_coc(layout) {
         return Ok(None);
      }

      self.transition(SessionState::AttemptingCoc);
      self.coc_attempts += 1;
      let exchange = exchange_over_coc(&self.backend, &self.negotiator, device);
      match guarded(link, exchange).await {
         Ok(payload) => Ok(Some(payload)),
         Err(Error::Disconnected) => Err(Error::Disconnected),
         Err(e) => {
            warn!("CoC exchange with {device} failed, falling back to GATT: {e}");
            self.prefer_coc = false;
            Ok(None)
         },
      }
   }

   fn should_attempt_coc(&self, layout: &ServiceLayout) -> bool {
      if self.coc_attempts > 0 {
         return false;
      }
      if !layout.contains(CHANNEL_DESCRIPTOR) {
         debug!("No channel descriptor on {}", layout.service);
         return false;
      }
      if !self.capability.is_available() {
         debug!("CoC not available on this platform");
         return false;
      }
      if !self.prefer_coc {
         debug!("CoC disabled by preference");
         return false;
      }
      true
   }

   async fn terminate(
      &mut self,
      device: Option<DeviceId>,
      result: Result<(DisplayName, Transport)>,
   ) -> SessionReport {
      self.peripheral.release().await;

      match result {
         Ok((model, transport)) => {
            self.transition(SessionState::Terminated(Outcome::Success));
            match &device {
               Some(id) => info!("Identified {id} as {model} via {transport}"),
               None => info!("Identified {model} via {transport}"),
            }
            SessionReport {
               outcome: Outcome::Success,
               device,
               transport: Some(transport),
               model: Some(model),
               error: None,
            }
         },
         Err(e) => {
            self.transition(SessionState::Terminated(Outcome::Failure));
            error!("Session failed: {e}");
            SessionReport::failed(device, e)
         },
      }
   }

   fn transition(&mut self, next: SessionState) {
      debug!("Session {:?} -> {next:?}", self.state);
      self.state = next;
   }
}

/// Reads the PSM, opens the channel and performs one identity exchange.
async fn exchange_over_coc<B, N>(backend: &B, negotiator: &N, device: &DeviceId) -> Result<Vec<u8>>
where
   B: BleBackend,
   N: CocNegotiator,
{
   let addr = CharacteristicAddress::new(device.clone(), PRIMARY_SERVICE, CHANNEL_DESCRIPTOR);
   let descriptor = backend.read_characteristic(&addr).await?;
   let psm = decode_psm(&descriptor)?;
   debug!("{device} advertises PSM {psm:#06x}");

   let mut channel = negotiator.connect(device, psm).await?;
   let response = channel.exchange(PKT_IDENTITY_REQUEST).await;
   channel.close().await;
   Ok(response?.to_vec())
}

/// Runs `op` unless the link drops first.
async fn guarded<T>(
   link: &mut watch::Receiver<LinkState>,
   op: impl Future<Output = Result<T>>,
) -> Result<T> {
   select! {
      biased;
      () = link_lost(link) => Err(Error::Disconnected),
      result = op => result,
   }
}

/// Resolves once the link reports `Disconnected`. A closed channel never
/// resolves, since no further link events can arrive.
async fn link_lost(link: &mut watch::Receiver<LinkState>) {
   let closed = link
      .wait_for(|state| *state == LinkState::Disconnected)
      .await
      .is_err();
   if closed {
      future::pending::<()>().await;
   }
}

#[cfg(test)]
mod tests {
   use std::{
      collections::HashMap,
      sync::{
         Arc,
         atomic::{AtomicU32, Ordering},
      },
   };

   use parking_lot::Mutex;
   use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
   use uuid::Uuid;

   use super::*;
   use crate::bluetooth::{backend::AddressKind, l2cap::Channel};

   const MAC: [u8; 6] = [0x58, 0x6F, 0x1A, 0x22, 0x03, 0x9C];

   type Log = Arc<Mutex<Vec<&'static str>>>;

   struct FakePeripheral {
      /// `None` makes discovery fail with `ServiceNotFound`
      characteristics: Option<Vec<Uuid>>,
      link: Arc<watch::Sender<LinkState>>,
      log: Log,
   }

   impl Peripheral for FakePeripheral {
      fn link_state(&self) -> watch::Receiver<LinkState> {
         self.link.subscribe()
      }

      async fn scan(&mut self, _service: Uuid) -> Result<DeviceId> {
         self.log.lock().push("scan");
         Ok(DeviceId::bluez("hci0", MAC, AddressKind::Public))
      }

      async fn connect(&mut self, _device: &DeviceId) -> Result<()> {
         self.log.lock().push("connect");
         self.link.send_replace(LinkState::Connected);
         Ok(())
      }

      async fn discover(&mut self, _device: &DeviceId, service: Uuid) -> Result<ServiceLayout> {
         self.log.lock().push("discover");
         match &self.characteristics {
            Some(characteristics) => Ok(ServiceLayout {
               service,
               characteristics: characteristics.clone(),
            }),
            None => Err(BleError::new(BleErrorKind::ServiceNotFound).into()),
         }
      }

      async fn release(&mut self) {
         self.log.lock().push("release");
         self.link.send_replace(LinkState::Idle);
      }
   }

   struct FakeBackend {
      values: HashMap<Uuid, std::result::Result<Vec<u8>, BleError>>,
      reads: Arc<Mutex<Vec<Uuid>>>,
      /// Drops the link and stalls instead of answering
      drop_link: Option<Arc<watch::Sender<LinkState>>>,
   }

   impl BleBackend for FakeBackend {
      async fn read_characteristic(
         &self,
         addr: &CharacteristicAddress,
      ) -> std::result::Result<Vec<u8>, BleError> {
         self.reads.lock().push(addr.characteristic);
         if let Some(link) = &self.drop_link {
            link.send_replace(LinkState::Disconnected);
            future::pending::<()>().await;
         }
         self
            .values
            .get(&addr.characteristic)
            .cloned()
            .unwrap_or_else(|| Err(BleError::new(BleErrorKind::CharacteristicNotFound)))
      }
   }

   struct FakeNegotiator {
      capability: CocCapability,
      /// `None` refuses the connection
      response: Option<Vec<u8>>,
      attempts: Arc<AtomicU32>,
   }

   impl CocNegotiator for FakeNegotiator {
      type Stream = DuplexStream;

      fn capability(&self) -> CocCapability {
         self.capability
      }

      async fn connect(
         &self,
         _device: &DeviceId,
         psm: u16,
      ) -> std::result::Result<Channel<DuplexStream>, BleError> {
         self.attempts.fetch_add(1, Ordering::SeqCst);
         let Some(response) = self.response.clone() else {
            return Err(BleError::with_message(BleErrorKind::CocConnectFailed, "refused"));
         };

         let (client, mut server) = duplex(1024);
         tokio::spawn(async move {
            let mut request = [0u8; 2];
            if server.read_exact(&mut request).await.is_ok() && request == [0x01, 0x00] {
               // Deliver the response in two parts
               let (head, tail) = response.split_at(response.len().min(1));
               let _ = server.write_all(head).await;
               tokio::time::sleep(std::time::Duration::from_millis(10)).await;
               let _ = server.write_all(tail).await;
            }
            let mut rest = Vec::new();
            let _ = server.read_to_end(&mut rest).await;
         });
         Ok(Channel::new(client, psm))
      }
   }

   struct Harness {
      link: Arc<watch::Sender<LinkState>>,
      log: Log,
      reads: Arc<Mutex<Vec<Uuid>>>,
      coc_attempts: Arc<AtomicU32>,
   }

   struct Setup {
      characteristics: Option<Vec<Uuid>>,
      values: Vec<(Uuid, std::result::Result<Vec<u8>, BleError>)>,
      capability: CocCapability,
      coc_response: Option<Vec<u8>>,
      prefer_coc: bool,
      drop_link_on_read: bool,
   }

   impl Default for Setup {
      fn default() -> Self {
         Self {
            characteristics: Some(vec![PRIMARY_CHARACTERISTIC, CHANNEL_DESCRIPTOR]),
            values: vec![
               (PRIMARY_CHARACTERISTIC, Ok(vec![0x01, 0x22])),
               (CHANNEL_DESCRIPTOR, Ok(vec![0x81, 0x00])),
            ],
            capability: CocCapability::Available,
            coc_response: Some(vec![0x19, 0x20]),
            prefer_coc: true,
            drop_link_on_read: false,
         }
      }
   }

   impl Setup {
      fn build(self) -> (DeviceSession<FakePeripheral, FakeBackend, FakeNegotiator>, Harness) {
         let (link, _) = watch::channel(LinkState::Idle);
         let link = Arc::new(link);
         let harness = Harness {
            link: link.clone(),
            log: Log::default(),
            reads: Arc::default(),
            coc_attempts: Arc::default(),
         };

         let peripheral = FakePeripheral {
            characteristics: self.characteristics,
            link: link.clone(),
            log: harness.log.clone(),
         };
         let backend = FakeBackend {
            values: self.values.into_iter().collect(),
            reads: harness.reads.clone(),
            drop_link: self.drop_link_on_read.then_some(link),
         };
         let negotiator = FakeNegotiator {
            capability: self.capability,
            response: self.coc_response,
            attempts: harness.coc_attempts.clone(),
         };

         let session = DeviceSession::new(
            peripheral,
            backend,
            negotiator,
            ConnectionPreference::new(self.prefer_coc),
         );
         (session, harness)
      }
   }

   #[tokio::test]
   async fn test_gatt_read_when_coc_not_preferred() {
      let (mut session, harness) = Setup {
         prefer_coc: false,
         ..Setup::default()
      }
      .build();

      let report = session.run().await;
      assert_eq!(report.outcome, Outcome::Success);
      assert_eq!(report.transport, Some(Transport::Gatt));
      assert_eq!(report.model.unwrap().to_string(), "AirPods Pro (2nd gen)");
      assert_eq!(session.state(), SessionState::Terminated(Outcome::Success));

      assert_eq!(*harness.reads.lock(), vec![PRIMARY_CHARACTERISTIC]);
      assert_eq!(harness.coc_attempts.load(Ordering::SeqCst), 0);
      assert_eq!(
         *harness.log.lock(),
         vec!["scan", "connect", "discover", "release"]
      );
   }

   #[tokio::test]
   async fn test_coc_exchange_skips_gatt_read() {
      let (mut session, harness) = Setup::default().build();

      let report = session.run().await;
      assert_eq!(report.outcome, Outcome::Success);
      assert_eq!(report.transport, Some(Transport::L2cap));
      assert_eq!(report.model.unwrap().to_string(), "AirPods 4");
      assert_eq!(
         report.device.as_ref().map(DeviceId::as_str),
         Some("/org/bluez/hci0/dev_58_6F_1A_22_03_9C")
      );

      assert_eq!(*harness.reads.lock(), vec![CHANNEL_DESCRIPTOR]);
      assert_eq!(harness.coc_attempts.load(Ordering::SeqCst), 1);
      assert!(session.prefers_coc());
   }

   #[tokio::test]
   async fn test_coc_failure_falls_back_exactly_once() {
      let (mut session, harness) = Setup {
         coc_response: None,
         ..Setup::default()
      }
      .build();

      let report = session.run().await;
      assert_eq!(report.outcome, Outcome::Success);
      assert_eq!(report.transport, Some(Transport::Gatt));
      assert_eq!(report.model, Some(identify(&[0x01, 0x22])));

      assert_eq!(harness.coc_attempts.load(Ordering::SeqCst), 1);
      assert_eq!(session.coc_attempts(), 1);
      assert!(!session.prefers_coc());
      assert_eq!(
         *harness.reads.lock(),
         vec![CHANNEL_DESCRIPTOR, PRIMARY_CHARACTERISTIC]
      );
   }

   #[tokio::test]
   async fn test_malformed_descriptor_falls_back() {
      let (mut session, harness) = Setup {
         values: vec![
            (PRIMARY_CHARACTERISTIC, Ok(vec![0x08, 0x20])),
            (CHANNEL_DESCRIPTOR, Ok(vec![0x00, 0x00])),
         ],
         ..Setup::default()
      }
      .build();

      let report = session.run().await;
      assert_eq!(report.transport, Some(Transport::Gatt));
      assert_eq!(report.model.unwrap().to_string(), "AirPods (2nd gen)");
      // Rejected before any channel was opened
      assert_eq!(harness.coc_attempts.load(Ordering::SeqCst), 0);
      assert!(!session.prefers_coc());
   }

   #[tokio::test]
   async fn test_missing_service_fails_without_coc() {
      let (mut session, harness) = Setup {
         characteristics: None,
         ..Setup::default()
      }
      .build();

      let report = session.run().await;
      assert_eq!(report.outcome, Outcome::Failure);
      assert_eq!(
         report.error.as_ref().and_then(Error::ble_kind),
         Some(BleErrorKind::ServiceNotFound)
      );
      assert!(harness.reads.lock().is_empty());
      assert_eq!(harness.coc_attempts.load(Ordering::SeqCst), 0);
      assert_eq!(harness.log.lock().last(), Some(&"release"));
   }

   #[tokio::test]
   async fn test_backend_service_not_found_is_terminal() {
      let (mut session, harness) = Setup {
         characteristics: Some(vec![PRIMARY_CHARACTERISTIC]),
         values: vec![(
            PRIMARY_CHARACTERISTIC,
            Err(BleError::new(BleErrorKind::ServiceNotFound)),
         )],
         ..Setup::default()
      }
      .build();

      let report = session.run().await;
      assert_eq!(report.outcome, Outcome::Failure);
      assert_eq!(
         report.error.as_ref().and_then(Error::ble_kind),
         Some(BleErrorKind::ServiceNotFound)
      );
      assert_eq!(harness.coc_attempts.load(Ordering::SeqCst), 0);
      assert_eq!(session.state(), SessionState::Terminated(Outcome::Failure));
   }

   #[tokio::test]
   async fn test_coc_skipped_without_capability() {
      let (mut session, harness) = Setup {
         capability: CocCapability::Unavailable,
         ..Setup::default()
      }
      .build();

      let report = session.run().await;
      assert_eq!(report.transport, Some(Transport::Gatt));
      assert_eq!(*harness.reads.lock(), vec![PRIMARY_CHARACTERISTIC]);
      assert_eq!(harness.coc_attempts.load(Ordering::SeqCst), 0);
      // Preference is only cleared by a failed attempt
      assert!(session.prefers_coc());
   }

   #[tokio::test]
   async fn test_disconnect_during_read_terminates() {
      let (mut session, harness) = Setup {
         prefer_coc: false,
         drop_link_on_read: true,
         ..Setup::default()
      }
      .build();

      let report = session.run().await;
      assert_eq!(report.outcome, Outcome::Failure);
      assert!(matches!(report.error, Some(Error::Disconnected)));
      assert_eq!(session.state(), SessionState::Terminated(Outcome::Failure));
      assert_eq!(harness.log.lock().last(), Some(&"release"));
   }

   #[tokio::test]
   async fn test_disconnect_during_coc_does_not_fall_back() {
      let (mut session, harness) = Setup {
         drop_link_on_read: true,
         ..Setup::default()
      }
      .build();

      let report = session.run().await;
      assert!(matches!(report.error, Some(Error::Disconnected)));
      assert_eq!(*harness.reads.lock(), vec![CHANNEL_DESCRIPTOR]);
      assert!(session.prefers_coc());
   }

   #[tokio::test]
   async fn test_terminated_session_rejects_rerun() {
      let (mut session, harness) = Setup::default().build();
      assert_eq!(session.state(), SessionState::Idle);
      session.run().await;
      let calls = harness.log.lock().len();

      // A late link-loss notification changes nothing
      harness.link.send_replace(LinkState::Disconnected);
      assert_eq!(session.state(), SessionState::Terminated(Outcome::Success));

      let again = session.run().await;
      assert!(matches!(again.error, Some(Error::SessionTerminated)));
      assert_eq!(session.state(), SessionState::Terminated(Outcome::Success));
      assert_eq!(harness.log.lock().len(), calls);
      assert_eq!(harness.coc_attempts.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn test_empty_payload_is_failure() {
      let (mut session, _harness) = Setup {
         prefer_coc: false,
         values: vec![(PRIMARY_CHARACTERISTIC, Ok(Vec::new()))],
         ..Setup::default()
      }
      .build();

      let report = session.run().await;
      assert_eq!(report.outcome, Outcome::Failure);
      assert_eq!(
         report.error.as_ref().and_then(Error::ble_kind),
         Some(BleErrorKind::MalformedReply)
      );
   }

   #[tokio::test]
   async fn test_single_byte_payload_decodes_unknown() {
      let (mut session, _harness) = Setup {
         prefer_coc: false,
         values: vec![(PRIMARY_CHARACTERISTIC, Ok(vec![0x02]))],
         ..Setup::default()
      }
      .build();

      let report = session.run().await;
      assert_eq!(report.outcome, Outcome::Success);
      assert_eq!(report.model, Some(DisplayName::Unknown));
      assert_eq!(report.to_json()["model"], "AirPods (Unknown model)");
      assert_eq!(report.to_json()["transport"], "gatt");
   }
}
