// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The byte forwarder for an activated pairing.
//!
//! Once two endpoints are paired, a single relay task owns both streams
//! and pumps bytes in both directions until either side closes. Ownership
//! by one task is what makes teardown simple: there is exactly one exit
//! path, so collapsing the pair and releasing the address cannot happen
//! twice no matter which side closes first, or whether both do at once.

use futures::future::{self, Either};
use futures::pin_mut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::registry::{ActiveRegistry, TakenEndpoint};
use crate::common::session::SessionAddress;

/// Per-direction copy buffer. Also the bound on in-flight data per
/// direction: a pump does not read again until the previous chunk has been
/// fully written to the opposite side, so a fast producer feeding a slow
/// consumer is paused by its own unfinished write rather than queueing.
pub const RELAY_BUFFER_CAPACITY: usize = 1024 * 32;

pub struct RelayLink {
  address: SessionAddress,
  first: TakenEndpoint,
  second: TakenEndpoint,
  active: Arc<ActiveRegistry>,
}

impl RelayLink {
  pub fn new(
    address: SessionAddress,
    first: TakenEndpoint,
    second: TakenEndpoint,
    active: Arc<ActiveRegistry>,
  ) -> RelayLink {
    RelayLink {
      address,
      first,
      second,
      active,
    }
  }

  /// Splices the two connections until either direction finishes (EOF or
  /// error), then collapses both sides and releases the address.
  pub async fn run(self) {
    let RelayLink {
      address,
      first,
      second,
      active,
    } = self;
    let (mut first_read, mut first_write) = tokio::io::split(first.stream);
    let (mut second_read, mut second_write) = tokio::io::split(second.stream);

    let outcome = {
      // Each side's stash holds bytes its client sent ahead of
      // activation; they belong at the head of the stream to the peer.
      let forward = pump(&mut first_read, &mut second_write, first.stash);
      let backward = pump(&mut second_read, &mut first_write, second.stash);
      pin_mut!(forward, backward);
      match future::select(forward, backward).await {
        Either::Left((result, _)) => ("first-to-second", result),
        Either::Right((result, _)) => ("second-to-first", result),
      }
    };

    // Whichever direction finished takes the whole link down with it: a
    // closed half never leaves a half-open relay behind.
    let _ = first_write.shutdown().await;
    let _ = second_write.shutdown().await;
    active.release(&address);

    match outcome {
      (direction, Ok(bytes)) => {
        tracing::debug!(%address, direction, bytes, "relay link closed");
      }
      (direction, Err(error)) => {
        tracing::debug!(%address, direction, %error, "relay link closed on error");
      }
    }
  }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, stash: Vec<u8>) -> std::io::Result<u64>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut total = 0u64;
  if !stash.is_empty() {
    writer.write_all(&stash).await?;
    writer.flush().await?;
    total += stash.len() as u64;
  }
  let mut buffer = vec![0u8; RELAY_BUFFER_CAPACITY];
  loop {
    let count = reader.read(&mut buffer).await?;
    if count == 0 {
      return Ok(total);
    }
    writer.write_all(&buffer[..count]).await?;
    writer.flush().await?;
    total += count as u64;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::endpoint::EndpointId;
  use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

  fn taken(id: u64, stream: DuplexStream, stash: &[u8]) -> TakenEndpoint {
    TakenEndpoint {
      id: EndpointId::new(id),
      stream: Box::new(stream),
      stash: stash.to_vec(),
    }
  }

  fn activated_address(active: &Arc<ActiveRegistry>) -> SessionAddress {
    let address = SessionAddress::derive("sid", "a@x/r", "b@y/r");
    assert!(active.mark_active(&address));
    address
  }

  #[tokio::test]
  async fn relays_bytes_both_directions_in_order() {
    let active = Arc::new(ActiveRegistry::new());
    let address = activated_address(&active);
    let (mut client_a, endpoint_a) = tokio::io::duplex(256);
    let (mut client_b, endpoint_b) = tokio::io::duplex(256);

    let link = RelayLink::new(
      address.clone(),
      taken(1, endpoint_a, b""),
      taken(2, endpoint_b, b""),
      active.clone(),
    );
    let relay = tokio::spawn(link.run());

    client_a.write_all(b"from a to b").await.unwrap();
    let mut heard_by_b = [0u8; 11];
    client_b.read_exact(&mut heard_by_b).await.unwrap();
    assert_eq!(&heard_by_b, b"from a to b");

    client_b.write_all(b"and back").await.unwrap();
    let mut heard_by_a = [0u8; 8];
    client_a.read_exact(&mut heard_by_a).await.unwrap();
    assert_eq!(&heard_by_a, b"and back");

    // One side closing collapses the whole link
    drop(client_a);
    let mut rest = Vec::new();
    client_b.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    relay.await.unwrap();
    assert!(!active.is_active(&address));
  }

  #[tokio::test]
  async fn stashed_bytes_arrive_first() {
    let active = Arc::new(ActiveRegistry::new());
    let address = activated_address(&active);
    let (mut client_a, endpoint_a) = tokio::io::duplex(256);
    let (mut client_b, endpoint_b) = tokio::io::duplex(256);

    // "early " was read from client A before activation
    let link = RelayLink::new(
      address,
      taken(1, endpoint_a, b"early "),
      taken(2, endpoint_b, b""),
      active,
    );
    tokio::spawn(link.run());

    client_a.write_all(b"and late").await.unwrap();
    client_a.shutdown().await.unwrap();
    drop(client_a);
    let mut heard = Vec::new();
    client_b.read_to_end(&mut heard).await.unwrap();
    assert_eq!(&heard, b"early and late");
  }

  #[tokio::test]
  async fn release_happens_exactly_once_under_simultaneous_close() {
    let active = Arc::new(ActiveRegistry::new());
    let address = activated_address(&active);
    let (client_a, endpoint_a) = tokio::io::duplex(256);
    let (client_b, endpoint_b) = tokio::io::duplex(256);

    let link = RelayLink::new(
      address.clone(),
      taken(1, endpoint_a, b""),
      taken(2, endpoint_b, b""),
      active.clone(),
    );
    let relay = tokio::spawn(link.run());

    // Both clients vanish at once; both pumps finish around the same time
    drop(client_a);
    drop(client_b);
    relay.await.unwrap();
    assert!(!active.is_active(&address));
  }
}
