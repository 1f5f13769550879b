// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Minimal SOCKS5 server-side handshake for the relay data plane.
//!
//! The relay only ever accepts anonymous authentication and CONNECT
//! requests to domain-name destinations: the "domain" a client requests is
//! the hash-derived session address, not a resolvable host. Everything
//! else in RFC 1928 is refused with the appropriate reply code.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS_VERSION: u8 = 0x05;
pub const AUTH_ANONYMOUS: u8 = 0x00;
pub const AUTH_UNACCEPTABLE: u8 = 0xff;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;

/// Reply codes the relay sends in the CONNECT response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
  Succeeded = 0x00,
  GeneralFailure = 0x01,
  NotAllowed = 0x02,
  ConnectionRefused = 0x05,
  CommandNotSupported = 0x07,
  AddressTypeNotSupported = 0x08,
}

#[derive(thiserror::Error, Debug)]
pub enum SocksError {
  #[error("I/O failure during handshake: {0}")]
  Io(#[from] std::io::Error),
  #[error("Unsupported SOCKS version {0:#04x}")]
  UnsupportedVersion(u8),
  #[error("No acceptable authentication method offered")]
  NoAcceptableAuth,
  #[error("Unsupported command {0:#04x}")]
  UnsupportedCommand(u8),
  #[error("Unsupported address type {0:#04x}")]
  UnsupportedAddressType(u8),
  #[error("Destination was not valid UTF-8")]
  InvalidDestination,
}

/// Server half of the handshake, generic over the underlying stream.
pub struct Handshake<S> {
  stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Handshake<S> {
  pub fn new(stream: S) -> Handshake<S> {
    Handshake { stream }
  }

  pub fn into_inner(self) -> S {
    self.stream
  }

  /// Reads the client greeting and selects anonymous authentication, or
  /// refuses the session when the client does not offer it.
  pub async fn negotiate_auth(&mut self) -> Result<(), SocksError> {
    let mut greeting = [0u8; 2];
    self.stream.read_exact(&mut greeting).await?;
    let (version, method_count) = (greeting[0], greeting[1]);
    if version != SOCKS_VERSION {
      self
        .stream
        .write_all(&[SOCKS_VERSION, AUTH_UNACCEPTABLE])
        .await?;
      return Err(SocksError::UnsupportedVersion(version));
    }

    let mut methods = vec![0u8; method_count as usize];
    self.stream.read_exact(&mut methods).await?;
    if methods.contains(&AUTH_ANONYMOUS) {
      self
        .stream
        .write_all(&[SOCKS_VERSION, AUTH_ANONYMOUS])
        .await?;
      Ok(())
    } else {
      self
        .stream
        .write_all(&[SOCKS_VERSION, AUTH_UNACCEPTABLE])
        .await?;
      Err(SocksError::NoAcceptableAuth)
    }
  }

  /// Reads the CONNECT request and returns the requested destination
  /// string and port. Only CONNECT to a domain-name destination is
  /// accepted; the port carries no meaning for session addressing.
  pub async fn read_connect_request(&mut self) -> Result<(String, u16), SocksError> {
    let mut header = [0u8; 4];
    self.stream.read_exact(&mut header).await?;
    let (version, command, _reserved, addr_type) =
      (header[0], header[1], header[2], header[3]);

    if version != SOCKS_VERSION {
      self.send_reply(ReplyCode::GeneralFailure).await?;
      return Err(SocksError::UnsupportedVersion(version));
    }
    if command != CMD_CONNECT {
      self.send_reply(ReplyCode::CommandNotSupported).await?;
      return Err(SocksError::UnsupportedCommand(command));
    }
    if addr_type != ATYP_DOMAIN {
      self.send_reply(ReplyCode::AddressTypeNotSupported).await?;
      return Err(SocksError::UnsupportedAddressType(addr_type));
    }

    let length = self.stream.read_u8().await? as usize;
    let mut destination = vec![0u8; length];
    self.stream.read_exact(&mut destination).await?;
    let destination = match String::from_utf8(destination) {
      Ok(destination) => destination,
      Err(_) => {
        self.send_reply(ReplyCode::GeneralFailure).await?;
        return Err(SocksError::InvalidDestination);
      }
    };
    let port = self.stream.read_u16().await?;
    Ok((destination, port))
  }

  /// Sends the CONNECT reply. The bind address is always the zero IPv4
  /// address: clients of a relay have no use for it.
  pub async fn send_reply(&mut self, code: ReplyCode) -> Result<(), SocksError> {
    let reply = [
      SOCKS_VERSION,
      code as u8,
      0x00,
      ATYP_IPV4,
      0,
      0,
      0,
      0,
      0,
      0,
    ];
    self.stream.write_all(&reply).await?;
    self.stream.flush().await?;
    Ok(())
  }
}
