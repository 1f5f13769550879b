// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A bytestreams relay for federated messaging networks.
//!
//! Two remote peers that cannot open a direct connection each dial this
//! relay over a SOCKS5-style handshake, requesting the same hash-derived
//! session address as their destination. An out-of-band activation on the
//! control channel then splices the two connections into one bidirectional
//! pipe; the relay never interprets the bytes it forwards.

pub mod common;
pub mod server;
pub mod util;
