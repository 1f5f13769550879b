// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use relay65::server::{RelayConfig, RelayServer};
use relay65::util::validators::{
  parse_listener_list, parse_socketaddr, validate_listener_list, validate_socketaddr,
};

mod component;

/// Wait between component reconnection attempts when the router link
/// drops or cannot be established.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

fn main() {
  let matches = Command::new(env!("CARGO_PKG_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about("SOCKS5 bytestreams relay, attached to a router as a component")
    .arg(
      Arg::new("jid")
        .long("jid")
        .takes_value(true)
        .default_value("proxy65")
        .help("Identity the relay attaches and advertises as"),
    )
    .arg(
      Arg::new("secret")
        .long("secret")
        .takes_value(true)
        .required(true)
        .help("Shared secret for the component handshake"),
    )
    .arg(
      Arg::new("router")
        .long("router")
        .takes_value(true)
        .default_value("127.0.0.1:6000")
        .validator(validate_socketaddr)
        .help("Router component port to attach to"),
    )
    .arg(
      Arg::new("listen")
        .long("listen")
        .alias("proxyips")
        .takes_value(true)
        .required(true)
        .validator(validate_listener_list)
        .help("Comma-separated data-plane addresses, each `ip` or `ip:port`"),
    )
    .get_matches();

  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector)
    .expect("Logger initialization must succeed");

  let rt = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .thread_name("tokio-reactor-worker")
    .build()
    .expect("Runtime initialization must succeed");
  if let Err(error) = rt.block_on(run(matches)) {
    tracing::error!(%error, "relay exited with failure");
    std::process::exit(1);
  }
}

async fn run(matches: ArgMatches) -> Result<()> {
  let jid = matches.value_of("jid").unwrap().to_string();
  let secret = matches.value_of("secret").unwrap().to_string();
  let router = parse_socketaddr(matches.value_of("router").unwrap())?;
  let listeners = parse_listener_list(matches.value_of("listen").unwrap())?;

  let server = RelayServer::new(RelayConfig {
    jid: jid.clone(),
    listeners,
  });
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        tracing::info!("Interrupt received; shutting down");
        return Ok(());
      }
      result = session(&server, router, &jid, &secret) => {
        match result {
          Ok(()) => tracing::info!("Router closed the component link; reconnecting"),
          Err(error) => tracing::warn!(%error, "Component session failed; reconnecting"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
      }
    }
  }
}

/// One component session: attach to the router, then serve until the link
/// ends. Relays already in flight survive the link; only the accept loops
/// and the control plane restart with the next session.
async fn session(
  server: &RelayServer,
  router: SocketAddr,
  jid: &str,
  secret: &str,
) -> Result<()> {
  let mut channel = component::connect(router, jid, secret).await?;
  server.run(&mut channel).await?;
  Ok(())
}
