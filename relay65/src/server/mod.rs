// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Server assembly: data-plane listeners plus the control-plane loop over
//! one shared pair of registries.

use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::control::{ChannelError, ControlChannel, ControlPlane};
use crate::common::endpoint::{ConnectionEndpoint, EndpointIdGenerator};
use crate::common::registry::{ActiveRegistry, PendingRegistry};

#[derive(Debug, Clone)]
pub struct RelayConfig {
  /// Identity advertised in streamhost results and discovery replies.
  pub jid: String,
  /// Data-plane addresses to bind. Port 0 binds an ephemeral port; the
  /// resolved address is what gets advertised.
  pub listeners: Vec<SocketAddr>,
}

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
  #[error("Failed to bind data-plane listener: {0}")]
  Bind(std::io::Error),
  #[error("Control channel failure: {0}")]
  Control(#[from] ChannelError),
}

/// The bound data-plane listeners and their shutdown signal.
///
/// Stopping cancels the accept loops only: connections already pending or
/// relaying are owned by their own tasks and run to their own conclusion.
pub struct ListenerSet {
  listeners: Vec<TcpListener>,
  local_addrs: Vec<SocketAddr>,
  shutdown: CancellationToken,
}

impl ListenerSet {
  /// Binds every requested address, failing fast on the first refusal.
  pub async fn bind(addrs: &[SocketAddr]) -> std::io::Result<ListenerSet> {
    let mut listeners = Vec::with_capacity(addrs.len());
    let mut local_addrs = Vec::with_capacity(addrs.len());
    for addr in addrs {
      let listener = TcpListener::bind(addr).await?;
      local_addrs.push(listener.local_addr()?);
      listeners.push(listener);
    }
    Ok(ListenerSet {
      listeners,
      local_addrs,
      shutdown: CancellationToken::new(),
    })
  }

  pub fn local_addrs(&self) -> &[SocketAddr] {
    &self.local_addrs
  }

  /// Spawns one accept loop per bound listener, all serving connections
  /// against the given registries. The id generator must be the one owned
  /// by the registries' owner: pending connections outlive a listener set,
  /// and a fresh generator could mint an id already held by one of them.
  pub fn start(
    &mut self,
    pending: &Arc<PendingRegistry>,
    active: &Arc<ActiveRegistry>,
    ids: &Arc<EndpointIdGenerator>,
  ) {
    for listener in self.listeners.drain(..) {
      let local = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
      let span = tracing::debug_span!("listener", %local);
      tokio::spawn(
        accept_loop(
          listener,
          pending.clone(),
          active.clone(),
          ids.clone(),
          self.shutdown.clone(),
        )
        .instrument(span),
      );
    }
  }

  /// Stops accepting new connections. Idempotent.
  pub fn stop(&self) {
    self.shutdown.cancel();
  }
}

async fn accept_loop(
  listener: TcpListener,
  pending: Arc<PendingRegistry>,
  active: Arc<ActiveRegistry>,
  ids: Arc<EndpointIdGenerator>,
  shutdown: CancellationToken,
) {
  let mut incoming = TcpListenerStream::new(listener);
  loop {
    let stream = tokio::select! {
      _ = shutdown.cancelled() => break,
      stream = incoming.next() => stream,
    };
    match stream {
      Some(Ok(stream)) => {
        serve_connection(stream, &pending, &active, &ids);
      }
      Some(Err(error)) => {
        // Transient accept failures (EMFILE and friends) should not take
        // the listener down
        tracing::warn!(%error, "failed to accept connection");
      }
      None => break,
    }
  }
  tracing::debug!("listener stopped");
}

fn serve_connection(
  stream: TcpStream,
  pending: &Arc<PendingRegistry>,
  active: &Arc<ActiveRegistry>,
  ids: &Arc<EndpointIdGenerator>,
) {
  let endpoint = ConnectionEndpoint::new(ids.next(), pending.clone(), active.clone());
  let peer = stream
    .peer_addr()
    .map(|addr| addr.to_string())
    .unwrap_or_else(|_| "unknown".to_string());
  let span = tracing::debug_span!("endpoint", id = endpoint.id().inner(), %peer);
  tokio::spawn(
    async move {
      match endpoint.serve(stream).await {
        Ok(outcome) => tracing::debug!(?outcome, "connection finished"),
        Err(error) => tracing::debug!(%error, "connection failed during handshake"),
      }
    }
    .instrument(span),
  );
}

/// The whole relay service: binds the data plane, then serves the control
/// plane until its channel ends.
pub struct RelayServer {
  config: RelayConfig,
  pending: Arc<PendingRegistry>,
  active: Arc<ActiveRegistry>,
  ids: Arc<EndpointIdGenerator>,
}

impl RelayServer {
  pub fn new(config: RelayConfig) -> RelayServer {
    RelayServer {
      config,
      pending: Arc::new(PendingRegistry::new()),
      active: Arc::new(ActiveRegistry::new()),
      ids: Arc::new(EndpointIdGenerator::new(1)),
    }
  }

  /// Runs one service session over the given control channel. Returns when
  /// the channel ends; the data-plane listeners stop with it, so a caller
  /// re-establishing the channel starts from a clean accept state while
  /// relays already in flight keep running.
  pub async fn run<C: ControlChannel>(&self, channel: &mut C) -> Result<(), ServerError> {
    let mut listeners = ListenerSet::bind(&self.config.listeners)
      .await
      .map_err(ServerError::Bind)?;
    let streamhosts = listeners.local_addrs().to_vec();
    listeners.start(&self.pending, &self.active, &self.ids);
    tracing::info!(
      jid = %self.config.jid,
      streamhosts = ?streamhosts,
      "relay service online"
    );

    let plane = ControlPlane::new(
      self.config.jid.clone(),
      streamhosts,
      self.pending.clone(),
      self.active.clone(),
    );
    let result = plane.run(channel).await;
    listeners.stop();
    tracing::info!("control channel closed; data-plane listeners stopped");
    result.map_err(ServerError::Control)
  }
}
