// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-connection lifecycle for the relay data plane.
//!
//! Each accepted socket is driven by one task through the states
//! awaiting-destination -> pending -> active/closed. Admission control
//! consults the shared registries; activation reaches the task through the
//! oneshot rendezvous registered with its [`PendingHandle`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;

use crate::common::registry::{
  ActivationOffer, ActiveRegistry, PendingHandle, PendingRegistry, TakenEndpoint,
};
use crate::common::session::{SessionAddress, BYTESTREAMS_NAMESPACE};
use crate::common::socks5::{Handshake, ReplyCode, SocksError};
use crate::util::RelayStream;

/// Bytes a pending client may send ahead of activation are stashed up to
/// this limit; past it the task genuinely stops reading until activation.
pub const PENDING_STASH_LIMIT: usize = 1024 * 32;

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct EndpointId(u64);

impl EndpointId {
  pub fn new(inner: u64) -> EndpointId {
    EndpointId(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl std::fmt::Debug for EndpointId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("EndpointId").field(&self.0).finish()
  }
}

pub struct EndpointIdGenerator {
  next: AtomicU64,
}

impl EndpointIdGenerator {
  pub fn new(next: u64) -> EndpointIdGenerator {
    EndpointIdGenerator {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> EndpointId {
    EndpointId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }
}

/// How a connection's participation ended. Closure of the underlying
/// socket is implied by every variant except `Activated`, where the stream
/// has been surrendered to a relay link instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointOutcome {
  /// Capability probe acknowledged and closed; no registry interaction.
  Probe,
  /// Refused at admission: address already active, or two already pending.
  Rejected,
  /// Ended while pending, either by the client closing or by a failed
  /// activation closing it as a stray.
  ClosedPending,
  /// Stream surrendered to a relay link.
  Activated,
}

#[derive(thiserror::Error, Debug)]
pub enum EndpointError {
  #[error("Data-plane handshake failure: {0}")]
  Handshake(#[from] SocksError),
  #[error("I/O failure: {0}")]
  Io(#[from] std::io::Error),
}

enum PendingWait {
  Activated(ActivationOffer),
  HandleDropped,
  Closed,
}

pub struct ConnectionEndpoint {
  id: EndpointId,
  pending: Arc<PendingRegistry>,
  active: Arc<ActiveRegistry>,
}

impl ConnectionEndpoint {
  pub fn new(
    id: EndpointId,
    pending: Arc<PendingRegistry>,
    active: Arc<ActiveRegistry>,
  ) -> ConnectionEndpoint {
    ConnectionEndpoint {
      id,
      pending,
      active,
    }
  }

  pub fn id(&self) -> EndpointId {
    self.id
  }

  /// Drives one accepted data-plane connection through its lifecycle:
  /// handshake, admission, the pending wait, and finally either surrender
  /// to a relay link or closure.
  pub async fn serve<S>(self, stream: S) -> Result<EndpointOutcome, EndpointError>
  where
    S: RelayStream + 'static,
  {
    let mut handshake = Handshake::new(stream);
    handshake.negotiate_auth().await?;
    let (destination, _port) = handshake.read_connect_request().await?;

    // Clients verify reachability by "connecting" to the namespace itself
    if destination == BYTESTREAMS_NAMESPACE {
      handshake.send_reply(ReplyCode::Succeeded).await?;
      tracing::debug!(id = ?self.id, "capability probe acknowledged");
      return Ok(EndpointOutcome::Probe);
    }

    let address = SessionAddress::new(destination);
    if self.active.is_active(&address) {
      handshake.send_reply(ReplyCode::NotAllowed).await?;
      tracing::debug!(id = ?self.id, %address, "destination already active; refused");
      return Ok(EndpointOutcome::Rejected);
    }

    let (offer_tx, offer_rx) = oneshot::channel();
    let handle = PendingHandle {
      id: self.id,
      offer_tx,
    };
    if !self.pending.try_admit(&address, handle) {
      handshake.send_reply(ReplyCode::ConnectionRefused).await?;
      tracing::debug!(id = ?self.id, %address, "two participants already pending; refused");
      return Ok(EndpointOutcome::Rejected);
    }
    // An activation may have claimed the address between the is_active
    // check and the admit; back out rather than straddle both registries.
    if self.active.is_active(&address) {
      self.pending.remove(&address, self.id);
      handshake.send_reply(ReplyCode::NotAllowed).await?;
      tracing::debug!(id = ?self.id, %address, "destination activated concurrently; refused");
      return Ok(EndpointOutcome::Rejected);
    }

    handshake.send_reply(ReplyCode::Succeeded).await?;
    tracing::debug!(id = ?self.id, %address, "connection pending");
    self
      .wait_for_activation(address, handshake.into_inner(), offer_rx)
      .await
  }

  /// The pending wait. Application reads stop here: any bytes the client
  /// sends early are stashed (bounded) for replay to the peer, and an EOF
  /// or error is the client abandoning the session.
  async fn wait_for_activation<S>(
    self,
    address: SessionAddress,
    mut stream: S,
    mut offer_rx: oneshot::Receiver<ActivationOffer>,
  ) -> Result<EndpointOutcome, EndpointError>
  where
    S: RelayStream + 'static,
  {
    let mut stash: Vec<u8> = Vec::new();
    let mut buffer = [0u8; 4096];
    let decision = loop {
      tokio::select! {
        offer = &mut offer_rx => {
          break match offer {
            Ok(offer) => PendingWait::Activated(offer),
            Err(_) => PendingWait::HandleDropped,
          };
        }
        read = stream.read(&mut buffer), if stash.len() < PENDING_STASH_LIMIT => {
          match read {
            Ok(0) | Err(_) => break PendingWait::Closed,
            Ok(count) => stash.extend_from_slice(&buffer[..count]),
          }
        }
      }
    };

    match decision {
      PendingWait::Activated(offer) => {
        let taken = TakenEndpoint {
          id: self.id,
          stream: Box::new(stream),
          stash,
        };
        // A dropped receiver means the activation was abandoned after the
        // offer; dropping the stream closes the connection either way.
        let _ = offer.reply_tx.send(taken);
        Ok(EndpointOutcome::Activated)
      }
      PendingWait::HandleDropped => {
        // Our handle was taken and dropped without an offer: a failed
        // activation is closing the strays. The registry entry is gone.
        tracing::debug!(id = ?self.id, %address, "closed as stray by failed activation");
        Ok(EndpointOutcome::ClosedPending)
      }
      PendingWait::Closed => {
        self.pending.remove(&address, self.id);
        tracing::debug!(id = ?self.id, %address, "client closed while pending");
        Ok(EndpointOutcome::ClosedPending)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

  async fn socks_connect(client: &mut DuplexStream, destination: &str) -> u8 {
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut auth = [0u8; 2];
    client.read_exact(&mut auth).await.unwrap();
    assert_eq!(auth, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, destination.len() as u8];
    request.extend_from_slice(destination.as_bytes());
    request.extend_from_slice(&0u16.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    reply[1]
  }

  fn registries() -> (Arc<PendingRegistry>, Arc<ActiveRegistry>) {
    (
      Arc::new(PendingRegistry::new()),
      Arc::new(ActiveRegistry::new()),
    )
  }

  #[tokio::test]
  async fn capability_probe_bypasses_registries() {
    let (pending, active) = registries();
    let (mut client, server) = tokio::io::duplex(1024);
    let endpoint = ConnectionEndpoint::new(EndpointId::new(1), pending.clone(), active);
    let task = tokio::spawn(endpoint.serve(server));

    let reply = socks_connect(&mut client, BYTESTREAMS_NAMESPACE).await;
    assert_eq!(reply, ReplyCode::Succeeded as u8);
    assert_eq!(task.await.unwrap().unwrap(), EndpointOutcome::Probe);
    // Connection is closed and nothing was registered
    let probe_address = SessionAddress::new(BYTESTREAMS_NAMESPACE);
    assert_eq!(pending.pending_count(&probe_address), 0);
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
  }

  #[tokio::test]
  async fn active_destination_is_refused() {
    let (pending, active) = registries();
    let address = SessionAddress::derive("sid", "a@x/r", "b@y/r");
    assert!(active.mark_active(&address));

    let (mut client, server) = tokio::io::duplex(1024);
    let endpoint = ConnectionEndpoint::new(EndpointId::new(1), pending, active);
    let task = tokio::spawn(endpoint.serve(server));

    let reply = socks_connect(&mut client, address.raw()).await;
    assert_eq!(reply, ReplyCode::NotAllowed as u8);
    assert_eq!(task.await.unwrap().unwrap(), EndpointOutcome::Rejected);
  }

  #[tokio::test]
  async fn third_participant_is_refused() {
    let (pending, active) = registries();
    let address = SessionAddress::derive("sid", "a@x/r", "b@y/r");

    let mut clients = Vec::new();
    for id in 1..=2u64 {
      let (mut client, server) = tokio::io::duplex(1024);
      let endpoint = ConnectionEndpoint::new(EndpointId::new(id), pending.clone(), active.clone());
      tokio::spawn(endpoint.serve(server));
      assert_eq!(
        socks_connect(&mut client, address.raw()).await,
        ReplyCode::Succeeded as u8
      );
      clients.push(client);
    }
    assert_eq!(pending.pending_count(&address), 2);

    let (mut third, server) = tokio::io::duplex(1024);
    let endpoint = ConnectionEndpoint::new(EndpointId::new(3), pending.clone(), active);
    let task = tokio::spawn(endpoint.serve(server));
    assert_eq!(
      socks_connect(&mut third, address.raw()).await,
      ReplyCode::ConnectionRefused as u8
    );
    assert_eq!(task.await.unwrap().unwrap(), EndpointOutcome::Rejected);
    assert_eq!(pending.pending_count(&address), 2);
  }

  #[tokio::test]
  async fn pending_closure_unregisters() {
    let (pending, active) = registries();
    let address = SessionAddress::derive("sid", "a@x/r", "b@y/r");

    let (mut client, server) = tokio::io::duplex(1024);
    let endpoint = ConnectionEndpoint::new(EndpointId::new(1), pending.clone(), active);
    let task = tokio::spawn(endpoint.serve(server));
    assert_eq!(
      socks_connect(&mut client, address.raw()).await,
      ReplyCode::Succeeded as u8
    );
    assert_eq!(pending.pending_count(&address), 1);

    drop(client);
    assert_eq!(task.await.unwrap().unwrap(), EndpointOutcome::ClosedPending);
    assert_eq!(pending.pending_count(&address), 0);
  }
}
