// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Port a relay listener binds when a configured address omits one.
pub const DEFAULT_DATA_PORT: u16 = 7777;

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(|e| e.into())
    .and_then(|mut items| {
      items.next().ok_or_else(|| {
        AnyErr::msg("No addresses were resolved from the given host")
      })
    })
}

/// Parses one listener endpoint of the form `ip` or `ip:port`.
pub fn parse_listener(v: &str) -> Result<SocketAddr> {
  let (ip, port) = match v.split_once(':') {
    Some((ip, port)) => {
      let port = port
        .parse::<u16>()
        .map_err(|_| AnyErr::msg("Listener port was not a valid u16"))?;
      (ip, port)
    }
    None => (v, DEFAULT_DATA_PORT),
  };
  let ip = ip
    .parse::<Ipv4Addr>()
    .map_err(|_| AnyErr::msg("Listener host was not a valid IPv4 address"))?;
  Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Screens a comma-separated listener list. Invalid entries are warned
/// about and skipped; an empty result refuses the whole configuration, as
/// a relay with nothing to advertise cannot serve anyone.
pub fn parse_listener_list(v: &str) -> Result<Vec<SocketAddr>> {
  let mut addrs = Vec::new();
  for entry in v.split(',').map(str::trim).filter(|e| !e.is_empty()) {
    match parse_listener(entry) {
      Ok(addr) => addrs.push(addr),
      Err(error) => {
        tracing::warn!(entry, %error, "Not using invalid listener address");
      }
    }
  }
  if addrs.is_empty() {
    Err(AnyErr::msg("No valid listener addresses were configured"))
  } else {
    Ok(addrs)
  }
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_listener_list(v: &str) -> Result<(), String> {
  parse_listener_list(v).map(|_| ()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn listener_with_port() {
    let addr = parse_listener("192.0.2.10:7778").unwrap();
    assert_eq!(addr, "192.0.2.10:7778".parse().unwrap());
  }

  #[test]
  fn listener_defaults_port() {
    let addr = parse_listener("192.0.2.10").unwrap();
    assert_eq!(addr.port(), DEFAULT_DATA_PORT);
  }

  #[test]
  fn listener_rejects_hostnames() {
    assert!(parse_listener("relay.example.com:7777").is_err());
  }

  #[test]
  fn list_skips_invalid_entries() {
    let addrs = parse_listener_list("192.0.2.1, not-an-ip, 192.0.2.2:8000").unwrap();
    assert_eq!(addrs.len(), 2);
    assert_eq!(addrs[1].port(), 8000);
  }

  #[test]
  fn list_with_no_valid_entries_is_an_error() {
    assert!(parse_listener_list("bogus, also:bogus").is_err());
    assert!(parse_listener_list("").is_err());
  }
}
