// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use std::sync::Arc;

/// Namespace this relay advertises as its feature in discovery replies.
///
/// Doubles as the capability-probe destination: a client that requests the
/// namespace itself on the data plane is only checking reachability and is
/// acknowledged and disconnected without touching the registries.
pub const BYTESTREAMS_NAMESPACE: &str = "http://jabber.org/protocol/bytestreams";

/// Opaque, hash-derived identifier for one pairing attempt. Doubles as the
/// destination string both participants request on the data plane.
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone)]
#[repr(transparent)]
pub struct SessionAddress(Arc<String>);

impl SessionAddress {
  pub fn new<T: Into<String>>(t: T) -> SessionAddress {
    SessionAddress(Arc::new(t.into()))
  }

  /// Derives the address both peers must independently compute for one
  /// session: lowercase-hex SHA-1 over the UTF-8 concatenation of the
  /// session id, the initiator identity, and the target identity.
  ///
  /// The role order is fixed by the negotiation contract and is not
  /// symmetrized; reordering the inputs changes the digest and would break
  /// wire compatibility with remote peers.
  pub fn derive(sid: &str, initiator: &str, target: &str) -> SessionAddress {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(initiator.as_bytes());
    hasher.update(target.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
      let _ = write!(hex, "{:02x}", byte);
    }
    SessionAddress(Arc::new(hex))
  }

  pub fn raw(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for SessionAddress {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::fmt::Debug for SessionAddress {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("SessionAddress").field(&self.0).finish()
  }
}
