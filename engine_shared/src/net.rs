//! Wire protocol.
//!
//! Every frame on the persistent socket is a JSON `Envelope` naming an
//! endpoint and carrying an arbitrary payload. Request/response pairs and
//! push messages share the same channel; endpoints are the only routing key.
//!
//! Action ids are the `WireId`s from the binding tables and must match the
//! server byte for byte.

use anyhow::Context;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    actions::ActionFrame,
    bindings::Device,
    physics::PhysicsSnapshot,
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 2;

/// Endpoint names.
pub mod endpoints {
    /// Round-trip check; the server echoes the payload.
    pub const PING: &str = "ping";
    /// Request an entity; answered on the same endpoint.
    pub const JOIN: &str = "join";
    /// Client input (client -> server) and relayed peer input (server -> client).
    pub const INPUT: &str = "input";
    /// Authoritative world state (server -> client).
    pub const STATE: &str = "state";
    /// Server-initiated reset of all local input.
    pub const RESET: &str = "reset";
}

/// Opaque entity id assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

/// One frame on the multiplexed socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub endpoint: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(endpoint: impl Into<String>, data: impl Serialize) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: endpoint.into(),
            data: serde_json::to_value(data).context("serialize payload")?,
        })
    }

    /// Deserializes the payload.
    pub fn payload<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.data.clone())
            .with_context(|| format!("decode `{}` payload", self.endpoint))
    }

    pub fn to_text(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("serialize envelope")
    }

    pub fn from_text(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("deserialize envelope")
    }
}

/// Client -> server on `join`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub protocol: u32,
    pub kind: String,
}

/// Server -> client on `join`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub entity: EntityId,
    pub kind: String,
    pub physics: Option<PhysicsSnapshot>,
}

/// An entity's input, sent whenever its action state changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMessage {
    pub entity: EntityId,
    pub device: Option<Device>,
    #[serde(flatten)]
    pub frame: ActionFrame,
    pub physics: Option<PhysicsSnapshot>,
}

/// Authoritative state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStateMessage {
    pub entity: EntityId,
    pub kind: String,
    pub physics: Option<PhysicsSnapshot>,
    #[serde(default)]
    pub input: ActionFrame,
}

/// World state broadcast on `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub tick: u32,
    pub entities: Vec<EntityStateMessage>,
}

/// Body of a non-2xx HTTP response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}
