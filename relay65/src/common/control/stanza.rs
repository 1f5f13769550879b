// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Typed stanza model for the negotiation channel.
//!
//! The channel itself (session establishment, authentication, routing) is
//! an external collaborator; this model is the narrow surface the relay
//! needs: three request shapes, their results, and two error conditions.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Request/response envelope. Correlation is by `id` and the channel's own
/// addressing; this service never invents ids, it echoes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iq {
  pub id: String,
  pub from: String,
  pub to: String,
  #[serde(rename = "type")]
  pub kind: IqType,
  pub payload: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IqType {
  Get,
  Set,
  Result,
  Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Payload {
  /// Service discovery query.
  DiscoQuery,
  DiscoResult(DiscoInfo),
  /// Query for the relay's advertised data-plane addresses.
  StreamhostQuery,
  StreamhostResult { hosts: Vec<Streamhost> },
  /// Activation request: splice the two connections pending for the
  /// address derived from `sid`, the envelope sender, and `target`.
  Activate { sid: String, target: String },
  Activated,
  Error(StanzaError),
}

/// Static service descriptor returned to discovery queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoInfo {
  pub category: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub name: String,
  pub features: Vec<String>,
}

/// One candidate relay address: identity, host, port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Streamhost {
  pub jid: String,
  pub host: IpAddr,
  pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StanzaError {
  pub code: u16,
  pub condition: ErrorCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCondition {
  NotAllowed,
  ItemNotFound,
}

impl ErrorCondition {
  /// Legacy numeric code carried alongside the condition.
  pub fn legacy_code(self) -> u16 {
    match self {
      ErrorCondition::NotAllowed => 405,
      ErrorCondition::ItemNotFound => 404,
    }
  }
}

impl Iq {
  /// Result envelope for this request: addressing swapped, id echoed.
  pub fn result(&self, payload: Payload) -> Iq {
    Iq {
      id: self.id.clone(),
      from: self.to.clone(),
      to: self.from.clone(),
      kind: IqType::Result,
      payload,
    }
  }

  /// Error envelope for this request.
  pub fn error(&self, condition: ErrorCondition) -> Iq {
    Iq {
      id: self.id.clone(),
      from: self.to.clone(),
      to: self.from.clone(),
      kind: IqType::Error,
      payload: Payload::Error(StanzaError {
        code: condition.legacy_code(),
        condition,
      }),
    }
  }
}
