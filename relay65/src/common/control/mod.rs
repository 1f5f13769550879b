// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Control-plane handlers: discovery, streamhost advertisement, and
//! session activation, dispatched from stanzas on the negotiation channel.

use futures::future::{BoxFuture, FutureExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing_futures::Instrument;

use crate::common::registry::{
  ActivationOffer, ActiveRegistry, PendingHandle, PendingRegistry, TakenEndpoint,
};
use crate::common::relay::RelayLink;
use crate::common::session::{SessionAddress, BYTESTREAMS_NAMESPACE};
use crate::util::framed::{read_frame_or_eof, write_framed_json, FrameReadError, FrameWriteError};
use crate::util::RelayStream;

pub mod stanza;
pub use stanza::{DiscoInfo, ErrorCondition, Iq, IqType, Payload, StanzaError, Streamhost};

/// Upper bound on one stanza frame; anything larger is a protocol error.
pub const MAX_STANZA_FRAME: usize = 64 * 1024;

/// Narrow seam to the negotiation channel: the relay only ever sends
/// stanzas and receives the next stanza addressed to it. Establishment,
/// authentication, and routing live behind this trait.
pub trait ControlChannel: Send {
  fn send(&mut self, stanza: Iq) -> BoxFuture<'_, Result<(), ChannelError>>;

  /// Resolves with `None` on orderly end-of-stream.
  fn recv(&mut self) -> BoxFuture<'_, Result<Option<Iq>, ChannelError>>;
}

#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
  #[error("Control frame read failure: {0}")]
  Read(#[from] FrameReadError),
  #[error("Control frame write failure: {0}")]
  Write(#[from] FrameWriteError),
}

/// Stanza transport over any byte stream: u32-length-prefixed JSON frames.
/// The shipped control link and the test harness both speak this.
pub struct FramedJsonChannel<S> {
  stream: S,
}

impl<S> FramedJsonChannel<S> {
  pub fn new(stream: S) -> FramedJsonChannel<S> {
    FramedJsonChannel { stream }
  }

  pub fn into_inner(self) -> S {
    self.stream
  }
}

impl<S: RelayStream> ControlChannel for FramedJsonChannel<S> {
  fn send(&mut self, stanza: Iq) -> BoxFuture<'_, Result<(), ChannelError>> {
    async move {
      write_framed_json(&mut self.stream, &stanza)
        .await
        .map_err(Into::into)
    }
    .boxed()
  }

  fn recv(&mut self) -> BoxFuture<'_, Result<Option<Iq>, ChannelError>> {
    async move {
      // Only an end-of-stream on a frame boundary is an orderly close; a
      // stream cut off mid-frame surfaces as an error.
      match read_frame_or_eof(&mut self.stream, MAX_STANZA_FRAME).await? {
        None => Ok(None),
        Some(buffer) => {
          let stanza =
            serde_json::from_slice::<Iq>(&buffer).map_err(FrameReadError::Deserialization)?;
          Ok(Some(stanza))
        }
      }
    }
    .boxed()
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ActivationError {
  /// Wrong number of participants at the moment of the take, including a
  /// participant that closed between the take and the rendezvous.
  #[error("Activation requires exactly two pending connections")]
  Mismatch,
  /// Nothing pending for the derived address.
  #[error("No pending connections for the derived address")]
  NotFound,
  /// Invariant violation or malformed request; reported without detail.
  #[error("Internal failure during activation")]
  Internal,
}

impl ActivationError {
  pub fn condition(&self) -> ErrorCondition {
    match self {
      ActivationError::Mismatch => ErrorCondition::NotAllowed,
      ActivationError::NotFound | ActivationError::Internal => ErrorCondition::ItemNotFound,
    }
  }
}

/// The stanza-facing side of the relay: answers discovery and streamhost
/// queries from static configuration and drives activation against the
/// shared registries.
pub struct ControlPlane {
  jid: String,
  streamhosts: Vec<SocketAddr>,
  pending: Arc<PendingRegistry>,
  active: Arc<ActiveRegistry>,
}

impl ControlPlane {
  pub fn new(
    jid: String,
    streamhosts: Vec<SocketAddr>,
    pending: Arc<PendingRegistry>,
    active: Arc<ActiveRegistry>,
  ) -> ControlPlane {
    ControlPlane {
      jid,
      streamhosts,
      pending,
      active,
    }
  }

  /// Dispatches stanzas until the channel ends. A failed activation
  /// produces an error reply; it never takes the loop down, so one bad
  /// session cannot affect unrelated ones.
  pub async fn run<C: ControlChannel>(&self, channel: &mut C) -> Result<(), ChannelError> {
    while let Some(stanza) = channel.recv().await? {
      if let Some(reply) = self.handle_stanza(stanza).await {
        channel.send(reply).await?;
      }
    }
    Ok(())
  }

  /// Unrecognized shapes are dropped without reply: the channel routes
  /// only the patterns this service registered interest in.
  pub async fn handle_stanza(&self, stanza: Iq) -> Option<Iq> {
    match (stanza.kind, &stanza.payload) {
      (IqType::Get, Payload::DiscoQuery) => Some(self.on_disco(&stanza)),
      (IqType::Get, Payload::StreamhostQuery) => Some(self.on_streamhosts(&stanza)),
      (IqType::Set, Payload::Activate { sid, target }) => {
        let (sid, target) = (sid.clone(), target.clone());
        Some(self.on_activate(&stanza, &sid, &target).await)
      }
      _ => None,
    }
  }

  fn on_disco(&self, stanza: &Iq) -> Iq {
    stanza.result(Payload::DiscoResult(DiscoInfo {
      category: "proxy".into(),
      kind: "bytestreams".into(),
      name: "SOCKS5 Bytestreams Service".into(),
      features: vec![BYTESTREAMS_NAMESPACE.into()],
    }))
  }

  fn on_streamhosts(&self, stanza: &Iq) -> Iq {
    let hosts = self
      .streamhosts
      .iter()
      .map(|addr| Streamhost {
        jid: self.jid.clone(),
        host: addr.ip(),
        port: addr.port(),
      })
      .collect();
    stanza.result(Payload::StreamhostResult { hosts })
  }

  async fn on_activate(&self, stanza: &Iq, sid: &str, target: &str) -> Iq {
    if sid.is_empty() || target.is_empty() || stanza.from.is_empty() {
      tracing::warn!(id = %stanza.id, "malformed activation request");
      return stanza.error(ActivationError::Internal.condition());
    }
    // The envelope sender is the initiator by protocol contract; the hash
    // role order is fixed and deliberately not symmetric.
    let address = SessionAddress::derive(sid, &stanza.from, target);
    tracing::info!(%address, from = %stanza.from, "activation requested");
    match self.activate(&address).await {
      Ok((first, second)) => {
        let link = RelayLink::new(address.clone(), first, second, self.active.clone());
        let span = tracing::debug_span!("relay", %address);
        tokio::spawn(link.run().instrument(span));
        tracing::info!(%address, "activated");
        stanza.result(Payload::Activated)
      }
      Err(error) => {
        tracing::warn!(%address, %error, "activation failed");
        stanza.error(error.condition())
      }
    }
  }

  /// The atomic take, the rendezvous with both endpoint tasks, and the
  /// pending-to-active promotion. Every failure path leaves no connection
  /// stranded: dropping a handle or a taken stream closes it.
  async fn activate(
    &self,
    address: &SessionAddress,
  ) -> Result<(TakenEndpoint, TakenEndpoint), ActivationError> {
    let handles = self.pending.take_for_activation(address);
    match handles.len() {
      0 => return Err(ActivationError::NotFound),
      2 => {}
      // Dropping the handles closes the stray connections
      _ => return Err(ActivationError::Mismatch),
    }

    let mut taken = Vec::with_capacity(2);
    for handle in handles {
      match rendezvous(handle).await {
        Some(endpoint) => taken.push(endpoint),
        // The endpoint closed between the take and the rendezvous; any
        // survivor is closed when `taken` drops
        None => return Err(ActivationError::Mismatch),
      }
    }
    let second = taken.pop().ok_or(ActivationError::Internal)?;
    let first = taken.pop().ok_or(ActivationError::Internal)?;

    if !self.active.mark_active(address) {
      tracing::error!(%address, "address already active at activation");
      return Err(ActivationError::Internal);
    }
    // A connection admitted between the take and the mark would straddle
    // both registries; sweep it out now that the address is active.
    drop(self.pending.take_for_activation(address));
    Ok((first, second))
  }
}

async fn rendezvous(handle: PendingHandle) -> Option<TakenEndpoint> {
  let (reply_tx, reply_rx) = oneshot::channel();
  if handle
    .offer_tx
    .send(ActivationOffer { reply_tx })
    .is_err()
  {
    return None;
  }
  reply_rx.await.ok()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::endpoint::EndpointId;
  use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

  fn plane() -> (ControlPlane, Arc<PendingRegistry>, Arc<ActiveRegistry>) {
    let pending = Arc::new(PendingRegistry::new());
    let active = Arc::new(ActiveRegistry::new());
    let plane = ControlPlane::new(
      "streamer.example.com".into(),
      vec!["192.0.2.1:7777".parse().unwrap()],
      pending.clone(),
      active.clone(),
    );
    (plane, pending, active)
  }

  fn get(payload: Payload) -> Iq {
    Iq {
      id: "iq-1".into(),
      from: "requester@example.com/foo".into(),
      to: "streamer.example.com".into(),
      kind: IqType::Get,
      payload,
    }
  }

  fn activate_request(sid: &str, target: &str) -> Iq {
    Iq {
      id: "iq-2".into(),
      from: "requester@example.com/foo".into(),
      to: "streamer.example.com".into(),
      kind: IqType::Set,
      payload: Payload::Activate {
        sid: sid.into(),
        target: target.into(),
      },
    }
  }

  /// Installs a fake pending endpoint that surrenders `server` when
  /// offered activation; its join handle reports whether it was activated
  /// (true) or closed as a stray (false).
  fn fake_pending(
    pending: &PendingRegistry,
    address: &SessionAddress,
    id: u64,
  ) -> (DuplexStream, tokio::task::JoinHandle<bool>) {
    let (client, server) = tokio::io::duplex(256);
    let (offer_tx, offer_rx) = tokio::sync::oneshot::channel();
    assert!(pending.try_admit(
      address,
      PendingHandle {
        id: EndpointId::new(id),
        offer_tx,
      }
    ));
    let task = tokio::spawn(async move {
      match offer_rx.await {
        Ok(offer) => {
          let _ = offer.reply_tx.send(TakenEndpoint {
            id: EndpointId::new(id),
            stream: Box::new(server),
            stash: Vec::new(),
          });
          true
        }
        Err(_) => false,
      }
    });
    (client, task)
  }

  #[tokio::test]
  async fn disco_reply_describes_a_bytestreams_proxy() {
    let (plane, _, _) = plane();
    let reply = plane.handle_stanza(get(Payload::DiscoQuery)).await.unwrap();
    assert_eq!(reply.kind, IqType::Result);
    assert_eq!(reply.to, "requester@example.com/foo");
    match reply.payload {
      Payload::DiscoResult(info) => {
        assert_eq!(info.category, "proxy");
        assert_eq!(info.kind, "bytestreams");
        assert_eq!(info.features, vec![BYTESTREAMS_NAMESPACE.to_string()]);
      }
      other => panic!("unexpected payload: {:?}", other),
    }
  }

  #[tokio::test]
  async fn streamhost_reply_projects_configuration() {
    let (plane, _, _) = plane();
    let reply = plane
      .handle_stanza(get(Payload::StreamhostQuery))
      .await
      .unwrap();
    match reply.payload {
      Payload::StreamhostResult { hosts } => {
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].jid, "streamer.example.com");
        assert_eq!(hosts[0].port, 7777);
      }
      other => panic!("unexpected payload: {:?}", other),
    }
  }

  #[tokio::test]
  async fn activation_without_pendings_is_item_not_found() {
    let (plane, _, _) = plane();
    let reply = plane
      .handle_stanza(activate_request("vo3sqperknpb", "target@example.org/bar"))
      .await
      .unwrap();
    assert_eq!(reply.kind, IqType::Error);
    assert_eq!(
      reply.payload,
      Payload::Error(StanzaError {
        code: 404,
        condition: ErrorCondition::ItemNotFound,
      })
    );
  }

  #[tokio::test]
  async fn activation_with_one_pending_closes_the_stray() {
    let (plane, pending, active) = plane();
    let address = SessionAddress::derive(
      "vo3sqperknpb",
      "requester@example.com/foo",
      "target@example.org/bar",
    );
    let (_client, stray) = fake_pending(&pending, &address, 1);

    let reply = plane
      .handle_stanza(activate_request("vo3sqperknpb", "target@example.org/bar"))
      .await
      .unwrap();
    assert_eq!(
      reply.payload,
      Payload::Error(StanzaError {
        code: 405,
        condition: ErrorCondition::NotAllowed,
      })
    );
    // The stray endpoint saw its handle dropped, not an activation
    assert!(!stray.await.unwrap());
    assert!(!active.is_active(&address));
    assert_eq!(pending.pending_count(&address), 0);
  }

  #[tokio::test]
  async fn activation_pairs_two_pendings_and_relays() {
    let (plane, pending, active) = plane();
    let address = SessionAddress::derive(
      "vo3sqperknpb",
      "requester@example.com/foo",
      "target@example.org/bar",
    );
    let (mut client_a, task_a) = fake_pending(&pending, &address, 1);
    let (mut client_b, task_b) = fake_pending(&pending, &address, 2);

    let reply = plane
      .handle_stanza(activate_request("vo3sqperknpb", "target@example.org/bar"))
      .await
      .unwrap();
    assert_eq!(reply.kind, IqType::Result);
    assert_eq!(reply.payload, Payload::Activated);
    assert!(task_a.await.unwrap());
    assert!(task_b.await.unwrap());
    assert!(active.is_active(&address));

    client_a.write_all(b"ping").await.unwrap();
    let mut heard = [0u8; 4];
    client_b.read_exact(&mut heard).await.unwrap();
    assert_eq!(&heard, b"ping");

    // A second activation for the same inputs finds nothing pending
    let reply = plane
      .handle_stanza(activate_request("vo3sqperknpb", "target@example.org/bar"))
      .await
      .unwrap();
    assert_eq!(
      reply.payload,
      Payload::Error(StanzaError {
        code: 404,
        condition: ErrorCondition::ItemNotFound,
      })
    );

    // Teardown frees the address
    drop(client_a);
    let mut rest = Vec::new();
    client_b.read_to_end(&mut rest).await.unwrap();
    while active.is_active(&address) {
      tokio::task::yield_now().await;
    }
  }

  #[tokio::test]
  async fn malformed_activation_is_item_not_found() {
    let (plane, _, _) = plane();
    let reply = plane
      .handle_stanza(activate_request("", "target@example.org/bar"))
      .await
      .unwrap();
    assert_eq!(
      reply.payload,
      Payload::Error(StanzaError {
        code: 404,
        condition: ErrorCondition::ItemNotFound,
      })
    );
  }

  #[tokio::test]
  async fn mid_frame_truncation_is_a_channel_error() {
    let (mut near, far) = tokio::io::duplex(256);
    let mut channel = FramedJsonChannel::new(far);
    // A frame announcing 512 bytes, cut off after a handful
    near.write_u32(512).await.unwrap();
    near.write_all(b"{\"id\"").await.unwrap();
    drop(near);
    assert!(matches!(
      channel.recv().await,
      Err(ChannelError::Read(_))
    ));
  }

  #[tokio::test]
  async fn dispatch_loop_replies_over_the_channel() {
    let (plane, _, _) = plane();
    let (near, far) = tokio::io::duplex(4096);
    let mut service_side = FramedJsonChannel::new(far);
    let mut requester_side = FramedJsonChannel::new(near);

    let loop_task = tokio::spawn(async move {
      let result = plane.run(&mut service_side).await;
      (plane, result)
    });

    requester_side.send(get(Payload::DiscoQuery)).await.unwrap();
    let reply = requester_side.recv().await.unwrap().unwrap();
    assert_eq!(reply.kind, IqType::Result);

    // Closing the requester side ends the loop cleanly
    drop(requester_side);
    let (_plane, result) = loop_task.await.unwrap();
    result.unwrap();
  }
}
