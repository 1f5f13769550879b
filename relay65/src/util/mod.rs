// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncWrite};

pub mod framed;
pub mod validators;

/// A byte stream capable of carrying one side of a relayed session.
///
/// Implemented for anything that is both readable and writable; boxed at
/// the registry seam so that relay code does not care whether it is talking
/// to a TCP socket or an in-memory duplex pair in tests.
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<S> RelayStream for S where S: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedRelayStream = Box<dyn RelayStream + 'static>;
