// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Session coordination and relay engine: address derivation, admission
//! registries, the per-connection state machine, the control-plane
//! handlers, and the byte forwarder that splices an activated pair.

pub mod control;
pub mod endpoint;
pub mod registry;
pub mod relay;
pub mod session;
pub mod socks5;
