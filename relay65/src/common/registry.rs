// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Process-wide bookkeeping for session addresses.
//!
//! An address occupies exactly one of three states: absent, pending (one or
//! two connections waiting to be paired), or active (paired and relaying).
//! The registries are shared by the control-plane handler and every
//! connection task; each operation here is a short, per-address-atomic
//! critical section and never awaits.

use dashmap::{DashMap, DashSet};
use tokio::sync::oneshot;

use crate::common::endpoint::EndpointId;
use crate::common::session::SessionAddress;
use crate::util::BoxedRelayStream;

/// A session pairs exactly two participants, never more.
pub const SESSION_PARTICIPANTS: usize = 2;

/// One admitted-but-unpaired connection, as held by the registry.
///
/// Dropping the handle without sending an offer closes the connection: the
/// endpoint task observes the dropped sender and exits, releasing its
/// socket. Failed activations rely on this to close stray participants.
pub struct PendingHandle {
  pub id: EndpointId,
  pub offer_tx: oneshot::Sender<ActivationOffer>,
}

/// Delivered to a pending endpoint task when its session activates. The
/// task answers by surrendering its stream; a dropped `reply_tx` tells the
/// task the activation was abandoned.
pub struct ActivationOffer {
  pub reply_tx: oneshot::Sender<TakenEndpoint>,
}

/// A connection surrendered by its endpoint task for splicing. `stash`
/// holds any bytes the client sent ahead of activation; they belong at the
/// head of the stream relayed to the peer.
pub struct TakenEndpoint {
  pub id: EndpointId,
  pub stream: BoxedRelayStream,
  pub stash: Vec<u8>,
}

/// Connections waiting to be paired, keyed by session address, in arrival
/// order.
#[derive(Default)]
pub struct PendingRegistry {
  conns: DashMap<SessionAddress, Vec<PendingHandle>>,
}

impl PendingRegistry {
  pub fn new() -> PendingRegistry {
    Default::default()
  }

  /// Atomic check-then-append: admits `handle` unless two connections are
  /// already waiting on `address`. Returns `false` when the caller must
  /// refuse the connection; nothing is mutated on refusal.
  pub fn try_admit(&self, address: &SessionAddress, handle: PendingHandle) -> bool {
    let mut entry = self.conns.entry(address.clone()).or_default();
    if entry.len() >= SESSION_PARTICIPANTS {
      return false;
    }
    entry.push(handle);
    true
  }

  /// Removes one specific pending connection (client closed before
  /// activation). Unknown address/id pairs are a no-op: a concurrent
  /// activation may already have taken the entry.
  pub fn remove(&self, address: &SessionAddress, id: EndpointId) {
    let now_empty = match self.conns.get_mut(address) {
      Some(mut entry) => {
        entry.retain(|handle| handle.id != id);
        entry.is_empty()
      }
      None => return,
    };
    if now_empty {
      self.conns.remove_if(address, |_, handles| handles.is_empty());
    }
  }

  /// Atomic remove-and-return of everything pending for `address` (zero,
  /// one, or two handles). Activation requires exactly two; any other
  /// length is the caller's error to report.
  pub fn take_for_activation(&self, address: &SessionAddress) -> Vec<PendingHandle> {
    self
      .conns
      .remove(address)
      .map(|(_, handles)| handles)
      .unwrap_or_default()
  }

  pub fn pending_count(&self, address: &SessionAddress) -> usize {
    self.conns.get(address).map(|entry| entry.len()).unwrap_or(0)
  }
}

/// Session addresses currently paired and relaying.
#[derive(Default)]
pub struct ActiveRegistry {
  addresses: DashSet<SessionAddress>,
}

impl ActiveRegistry {
  pub fn new() -> ActiveRegistry {
    Default::default()
  }

  pub fn is_active(&self, address: &SessionAddress) -> bool {
    self.addresses.contains(address)
  }

  /// Returns `false` when the address was already active, which callers
  /// must treat as an internal invariant failure rather than a success.
  #[must_use]
  pub fn mark_active(&self, address: &SessionAddress) -> bool {
    self.addresses.insert(address.clone())
  }

  /// Idempotent: teardown may race from both sides of a pairing.
  pub fn release(&self, address: &SessionAddress) -> bool {
    self.addresses.remove(address).is_some()
  }
}
