//! L2CAP connection-oriented channel negotiation.
//!
//! This module provides the capability gate for LE CoC, the client-side
//! negotiator that opens a channel to a PSM, and the [`Channel`] wrapper
//! used for a single request/response exchange.

use std::{future::Future, io, time::Duration};

use log::debug;
use smallvec::SmallVec;
use tokio::time;

use crate::{
   bluetooth::backend::DeviceId,
   error::{BleError, BleErrorKind},
};

pub type Packet = SmallVec<[u8; 32]>;

/// Maximum transmission unit for L2CAP packets
const L2CAP_MTU: usize = 672;
/// Timeout for a single write or read on an open channel
const IO_TIMEOUT: Duration = Duration::from_secs(5);
/// Length of the model identifier heading every response frame
const MIN_RESPONSE_LEN: usize = 2;
/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// First Linux release with LE CoC sockets enabled by default
const MIN_KERNEL: (u32, u32) = (3, 15);

/// Whether the running platform can open LE connection-oriented channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CocCapability {
   Available,
   Unavailable,
}

impl CocCapability {
   /// Resolves the capability for the running OS.
   pub fn probe() -> Self {
      #[cfg(target_os = "linux")]
      {
         match std::fs::read_to_string("/proc/sys/kernel/osrelease") {
            Ok(release) => Self::for_kernel(release.trim()),
            Err(e) => {
               log::warn!("Cannot read kernel release, disabling CoC: {e}");
               Self::Unavailable
            },
         }
      }
      #[cfg(not(target_os = "linux"))]
      {
         Self::Unavailable
      }
   }

   #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
   fn for_kernel(release: &str) -> Self {
      match kernel_version(release) {
         Some(version) if version >= MIN_KERNEL => Self::Available,
         _ => Self::Unavailable,
      }
   }

   pub const fn is_available(self) -> bool {
      matches!(self, Self::Available)
   }
}

/// Parses `major.minor` from a kernel release such as `6.8.0-45-generic`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn kernel_version(release: &str) -> Option<(u32, u32)> {
   let mut parts = release.split(|c: char| !c.is_ascii_digit());
   let major = parts.next()?.parse().ok()?;
   let minor = parts.next()?.parse().ok()?;
   Some((major, minor))
}

/// Packet-oriented I/O on an open channel.
///
/// One `send` carries one request frame. A response may still be delivered
/// over several `recv` calls, so callers must not assume one call is one
/// frame.
pub trait FrameIo: Send {
   fn send(&mut self, frame: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

   /// Returns 0 once the peer has closed the channel.
   fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

   fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// An open connection-oriented channel.
///
/// The channel owns its socket; dropping it closes the socket.
#[derive(Debug)]
pub struct Channel<S> {
   io: S,
   psm: u16,
}

impl<S: FrameIo> Channel<S> {
   pub const fn new(io: S, psm: u16) -> Self {
      Self { io, psm }
   }

   pub const fn psm(&self) -> u16 {
      self.psm
   }

   /// Sends one request frame and collects one response frame.
   pub async fn exchange(&mut self, request: &[u8]) -> Result<Packet, BleError> {
      debug!("→ psm {:#06x}: {}", self.psm, hex::encode(request));
      let sent = time::timeout(IO_TIMEOUT, self.io.send(request))
         .await
         .map_err(|_| channel_error("write timed out"))?
         .map_err(|e| channel_error(format!("write failed: {e}")))?;
      if sent != request.len() {
         return Err(channel_error(format!("short write: {sent} of {} bytes", request.len())));
      }

      let mut stack = [0u8; L2CAP_MTU];
      let n = time::timeout(IO_TIMEOUT, self.recv_frame(&mut stack))
         .await
         .map_err(|_| channel_error("read timed out"))??;
      match n {
         0 => {
            return Err(BleError::with_message(
               BleErrorKind::MalformedReply,
               "channel closed before responding",
            ));
         },
         n if n < MIN_RESPONSE_LEN => {
            return Err(BleError::with_message(
               BleErrorKind::MalformedReply,
               format!("truncated response: {n} bytes"),
            ));
         },
         _ => {},
      }

      let recvd = &stack[..n];
      debug!("← psm {:#06x}: {}", self.psm, hex::encode(recvd));
      Ok(Packet::from_slice(recvd))
   }

   /// Receives until the identifier header is complete or the peer closes.
   async fn recv_frame(&mut self, buf: &mut [u8]) -> Result<usize, BleError> {
      let mut len = 0;
      while len < MIN_RESPONSE_LEN {
         let n = self
            .io
            .recv(&mut buf[len..])
            .await
            .map_err(|e| channel_error(format!("read failed: {e}")))?;
         if n == 0 {
            break;
         }
         len += n;
      }
      Ok(len)
   }

   /// Shuts the channel down. Errors are irrelevant at this point.
   pub async fn close(mut self) {
      let _ = time::timeout(IO_TIMEOUT, self.io.shutdown()).await;
   }
}

fn channel_error(message: impl Into<String>) -> BleError {
   BleError::with_message(BleErrorKind::CocConnectFailed, message)
}

/// Client role of connection-oriented channel establishment.
pub trait CocNegotiator: Send + Sync {
   type Stream: FrameIo;

   fn capability(&self) -> CocCapability;

   /// Opens a channel to `psm` on `device`. Never retries.
   fn connect(
      &self,
      device: &DeviceId,
      psm: u16,
   ) -> impl Future<Output = Result<Channel<Self::Stream>, BleError>> + Send;
}

#[cfg(target_os = "linux")]
pub use bluez_coc::L2capNegotiator;

#[cfg(target_os = "linux")]
mod bluez_coc {
   use std::{io, net::Shutdown};

   use bluer::{
      Address, AddressType,
      l2cap::{SeqPacket, Socket, SocketAddr},
   };
   use log::{debug, warn};
   use tokio::time;

   use super::{CONNECT_TIMEOUT, Channel, CocCapability, CocNegotiator, FrameIo, channel_error};
   use crate::{
      bluetooth::backend::{AddressKind, DeviceId},
      error::{BleError, BleErrorKind},
   };

   /// LE CoC negotiator backed by BlueZ L2CAP sockets.
   #[derive(Debug, Clone)]
   pub struct L2capNegotiator {
      capability: CocCapability,
   }

   impl L2capNegotiator {
      pub fn new() -> Self {
         Self {
            capability: CocCapability::probe(),
         }
      }
   }

   impl Default for L2capNegotiator {
      fn default() -> Self {
         Self::new()
      }
   }

   impl FrameIo for SeqPacket {
      async fn send(&mut self, frame: &[u8]) -> io::Result<usize> {
         Self::send(self, frame).await
      }

      async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
         Self::recv(self, buf).await
      }

      async fn shutdown(&mut self) -> io::Result<()> {
         Self::shutdown(self, Shutdown::Both)
      }
   }

   impl CocNegotiator for L2capNegotiator {
      type Stream = SeqPacket;

      fn capability(&self) -> CocCapability {
         self.capability
      }

      async fn connect(&self, device: &DeviceId, psm: u16) -> Result<Channel<SeqPacket>, BleError> {
         if !self.capability.is_available() {
            return Err(BleError::new(BleErrorKind::CocUnsupported));
         }
         let Some(mac) = device.mac() else {
            return Err(channel_error(format!("{device} is not a BlueZ device path")));
         };

         let address = Address(mac);
         let address_type = match device.address_kind() {
            AddressKind::Public => AddressType::LePublic,
            AddressKind::Random => AddressType::LeRandom,
         };

         debug!("Creating L2CAP socket for {address}");
         let socket = Socket::new_seq_packet().map_err(|e| channel_error(e.to_string()))?;
         debug!("Connecting to {address}:{psm:#06x}");

         let seq_packet = time::timeout(
            CONNECT_TIMEOUT,
            socket.connect(SocketAddr::new(address, address_type, psm)),
         )
         .await
         .map_err(|_| {
            warn!("L2CAP connect to {address}:{psm:#06x} timed out");
            channel_error("connect timed out")
         })?
         .map_err(|e| channel_error(e.to_string()))?;

         Ok(Channel::new(seq_packet, psm))
      }
   }
}
