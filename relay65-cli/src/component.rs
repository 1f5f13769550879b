// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Component link establishment against the local router.
//!
//! The relay attaches to its router as an external component: open a
//! stream for its identity, prove possession of the shared secret by
//! digesting it with the router-assigned stream id, and from then on the
//! authenticated stream carries stanza frames.

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use std::net::SocketAddr;
use tokio::net::TcpStream;

use relay65::common::control::FramedJsonChannel;
use relay65::util::framed::{read_framed_json, write_framed_json};

/// Establishment frames are tiny; anything larger is not our router.
const MAX_LINK_FRAME: usize = 4096;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum LinkFrame {
  /// Component requests a stream for the given identity.
  Open { to: String },
  /// Router assigns a stream id to digest the secret with.
  Stream { id: String },
  /// Component proves the shared secret.
  Handshake { digest: String },
  /// Router accepts; stanzas follow.
  Ack,
}

/// Connects and authenticates to the router, returning the stanza channel
/// for the relay's control plane.
pub async fn connect(
  router: SocketAddr,
  jid: &str,
  secret: &str,
) -> Result<FramedJsonChannel<TcpStream>> {
  let mut stream = TcpStream::connect(router)
    .await
    .with_context(|| format!("Failed to connect to router at {}", router))?;

  write_framed_json(&mut stream, &LinkFrame::Open { to: jid.to_string() })
    .await
    .context("Failed to open component stream")?;
  let stream_id = match read_framed_json::<_, LinkFrame>(&mut stream, MAX_LINK_FRAME)
    .await
    .context("Router closed the link before assigning a stream")?
  {
    LinkFrame::Stream { id } => id,
    other => bail!("Unexpected frame while opening stream: {:?}", other),
  };

  let digest = handshake_digest(&stream_id, secret);
  write_framed_json(&mut stream, &LinkFrame::Handshake { digest })
    .await
    .context("Failed to send handshake")?;
  match read_framed_json::<_, LinkFrame>(&mut stream, MAX_LINK_FRAME)
    .await
    .context("Router closed the link during handshake")?
  {
    LinkFrame::Ack => {}
    other => bail!("Router refused the handshake: {:?}", other),
  }

  tracing::debug!(%router, jid, "component link established");
  Ok(FramedJsonChannel::new(stream))
}

/// Lowercase-hex SHA-1 over the stream id followed by the shared secret.
fn handshake_digest(stream_id: &str, secret: &str) -> String {
  let mut hasher = Sha1::new();
  hasher.update(stream_id.as_bytes());
  hasher.update(secret.as_bytes());
  let digest = hasher.finalize();
  let mut hex = String::with_capacity(digest.len() * 2);
  for byte in digest {
    let _ = write!(hex, "{:02x}", byte);
  }
  hex
}
